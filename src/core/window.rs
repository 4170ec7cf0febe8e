// Access-window policies: decide which stored records a caller may see.
use std::time::Duration;

use time::OffsetDateTime;

use crate::core::query::Query;
use crate::core::store::Record;
use crate::core::value::parse_timestamp;

/// Policy collaborator. Records it does not admit are withheld from pages, and a
/// tail that ends on withheld records is reported as `LIMITED` rather than `END`.
pub trait AccessWindow: Send + Sync {
    fn admits(&self, query: &Query, record: &Record) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenWindow;

impl AccessWindow for OpenWindow {
    fn admits(&self, _query: &Query, _record: &Record) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Horizon {
    /// Records strictly older than this instant are hidden.
    NotBefore(OffsetDateTime),
    /// Records older than `now - age` are hidden; evaluated per call.
    MaxAge(Duration),
}

/// Retention policy over one timestamp field. Records without that field are admitted.
#[derive(Clone, Debug)]
pub struct RetentionWindow {
    field: String,
    horizon: Horizon,
}

impl RetentionWindow {
    pub fn not_before(field: impl Into<String>, cutoff: OffsetDateTime) -> Self {
        Self {
            field: field.into(),
            horizon: Horizon::NotBefore(cutoff),
        }
    }

    pub fn max_age(field: impl Into<String>, age: Duration) -> Self {
        Self {
            field: field.into(),
            horizon: Horizon::MaxAge(age),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    fn cutoff_nanos(&self) -> i128 {
        let cutoff = match self.horizon {
            Horizon::NotBefore(cutoff) => cutoff,
            Horizon::MaxAge(age) => OffsetDateTime::now_utc() - age,
        };
        cutoff.unix_timestamp_nanos()
    }
}

impl AccessWindow for RetentionWindow {
    fn admits(&self, _query: &Query, record: &Record) -> bool {
        let Some(value) = record.data.get(&self.field).and_then(|value| value.as_str()) else {
            return true;
        };
        match parse_timestamp(value) {
            Some(nanos) => nanos >= self.cutoff_nanos(),
            None => true,
        }
    }
}
