// Period bucketing for top-up loads: maps a sort value to the period it belongs to.
use std::fmt;

use time::{OffsetDateTime, UtcOffset};

use crate::core::value::parse_timestamp;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied period function. `None` means the value belongs to no period,
/// which ends a top-up at that record.
pub trait PeriodOf: Send + Sync {
    fn period_of(&self, sort_value: &str) -> Option<PeriodKey>;
}

impl<F> PeriodOf for F
where
    F: Fn(&str) -> Option<PeriodKey> + Send + Sync,
{
    fn period_of(&self, sort_value: &str) -> Option<PeriodKey> {
        self(sort_value)
    }
}

/// Calendar periods over RFC 3339 timestamps, bucketed in UTC.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Period {
    Day,
    Month,
    Year,
}

impl PeriodOf for Period {
    fn period_of(&self, sort_value: &str) -> Option<PeriodKey> {
        let nanos = parse_timestamp(sort_value)?;
        let time = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()?
            .to_offset(UtcOffset::UTC);
        let key = match self {
            Period::Day => format!(
                "{:04}-{:02}-{:02}",
                time.year(),
                u8::from(time.month()),
                time.day()
            ),
            Period::Month => format!("{:04}-{:02}", time.year(), u8::from(time.month())),
            Period::Year => format!("{:04}", time.year()),
        };
        Some(PeriodKey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::{Period, PeriodKey, PeriodOf};

    #[test]
    fn calendar_periods_bucket_in_utc() {
        let value = "2024-02-01T01:30:00+03:00";
        assert_eq!(Period::Month.period_of(value), Some(PeriodKey::new("2024-01")));
        assert_eq!(Period::Day.period_of(value), Some(PeriodKey::new("2024-01-31")));
        assert_eq!(Period::Year.period_of(value), Some(PeriodKey::new("2024")));
    }

    #[test]
    fn non_timestamps_have_no_period() {
        assert_eq!(Period::Month.period_of("Alice"), None);
    }

    #[test]
    fn closures_are_period_functions() {
        let first_letter = |value: &str| value.get(..1).map(PeriodKey::new);
        assert_eq!(first_letter.period_of("Alice"), Some(PeriodKey::new("A")));
        assert_eq!(first_letter.period_of(""), None);
    }
}
