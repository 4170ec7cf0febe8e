// Sort-field types, ordered sort keys, and the canonical string form of range bounds.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// RFC 3339 strings, compared as instants.
    Timestamp,
    /// Byte-wise ordered strings.
    Text,
    /// Signed 64-bit integers.
    Integer,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Timestamp => "timestamp",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
        }
    }

    pub fn parse_bound(self, raw: &str) -> Result<SortKey, Error> {
        match self {
            FieldType::Timestamp => parse_timestamp(raw)
                .map(SortKey::Timestamp)
                .ok_or_else(|| invalid_bound(raw, "bound is not an RFC 3339 timestamp")),
            FieldType::Text => Ok(SortKey::Text(raw.to_string())),
            FieldType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(SortKey::Integer)
                .map_err(|err| invalid_bound(raw, "bound is not an integer").with_source(err)),
        }
    }

    /// Pull this type's sort key out of a record field. `None` when absent or mistyped.
    pub fn extract(self, value: &Value) -> Option<SortKey> {
        match self {
            FieldType::Timestamp => value
                .as_str()
                .and_then(parse_timestamp)
                .map(SortKey::Timestamp),
            FieldType::Text => value.as_str().map(|text| SortKey::Text(text.to_string())),
            FieldType::Integer => value.as_i64().map(SortKey::Integer),
        }
    }
}

/// Ordered value of one sort field. Keys of different variants never meet in one index.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SortKey {
    Integer(i64),
    Text(String),
    /// Unix time in nanoseconds.
    Timestamp(i128),
}

impl SortKey {
    /// Canonical bound string; parses back to an equal key.
    pub fn render(&self) -> String {
        match self {
            SortKey::Integer(value) => value.to_string(),
            SortKey::Text(value) => value.clone(),
            SortKey::Timestamp(nanos) => format_timestamp(*nanos).unwrap_or_else(|| nanos.to_string()),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            SortKey::Integer(_) => FieldType::Integer,
            SortKey::Text(_) => FieldType::Text,
            SortKey::Timestamp(_) => FieldType::Timestamp,
        }
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<i128> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .ok()
        .map(OffsetDateTime::unix_timestamp_nanos)
}

fn format_timestamp(nanos: i128) -> Option<String> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
}

fn invalid_bound(raw: &str, message: &str) -> Error {
    Error::new(ErrorKind::InvalidBound)
        .with_message(message)
        .with_bound(raw)
}
