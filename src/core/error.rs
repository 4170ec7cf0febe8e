// Error taxonomy shared by the fetcher, the list cache, the transport and the CLI.
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Internal,
    Usage,
    InvalidQuery,
    InvalidBound,
    NotFound,
    StoreUnavailable,
    Cancelled,
    Permission,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::Usage => "Usage",
            ErrorKind::InvalidQuery => "InvalidQuery",
            ErrorKind::InvalidBound => "InvalidBound",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Permission => "Permission",
            ErrorKind::Io => "Io",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "Internal" => ErrorKind::Internal,
            "Usage" => ErrorKind::Usage,
            "InvalidQuery" => ErrorKind::InvalidQuery,
            "InvalidBound" => ErrorKind::InvalidBound,
            "NotFound" => ErrorKind::NotFound,
            "StoreUnavailable" => ErrorKind::StoreUnavailable,
            "Cancelled" => ErrorKind::Cancelled,
            "Permission" => ErrorKind::Permission,
            "Io" => ErrorKind::Io,
            _ => return None,
        };
        Some(kind)
    }

    /// Caller errors are never worth retrying; the request itself must change.
    pub fn is_caller_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Usage | ErrorKind::InvalidQuery | ErrorKind::InvalidBound
        )
    }
}

/// Errors are `Clone` so one failed fetch can be handed to every coalesced waiter.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    collection: Option<String>,
    bound: Option<String>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            collection: None,
            bound: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn bound(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_bound(mut self, bound: impl Into<String>) -> Self {
        self.bound = Some(bound.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(collection) = &self.collection {
            write!(f, " (collection: {collection})")?;
        }
        if let Some(bound) = &self.bound {
            write!(f, " (bound: {bound})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::InvalidQuery => 3,
        ErrorKind::InvalidBound => 4,
        ErrorKind::NotFound => 5,
        ErrorKind::StoreUnavailable => 6,
        ErrorKind::Cancelled => 7,
        ErrorKind::Permission => 8,
        ErrorKind::Io => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};
    use std::error::Error as _;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::InvalidQuery, 3),
            (ErrorKind::InvalidBound, 4),
            (ErrorKind::NotFound, 5),
            (ErrorKind::StoreUnavailable, 6),
            (ErrorKind::Cancelled, 7),
            (ErrorKind::Permission, 8),
            (ErrorKind::Io, 9),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::InvalidBound)
            .with_message("bound is not a timestamp")
            .with_collection("events")
            .with_bound("yesterday");
        assert_eq!(
            err.to_string(),
            "InvalidBound: bound is not a timestamp (collection: events) (bound: yesterday)"
        );
    }

    #[test]
    fn clones_share_source() {
        let io = std::io::Error::other("connection reset");
        let err = Error::new(ErrorKind::StoreUnavailable).with_source(io);
        let copy = err.clone();
        assert_eq!(
            copy.source().map(|source| source.to_string()),
            Some("connection reset".to_string())
        );
    }

    #[test]
    fn caller_errors_are_flagged() {
        assert!(ErrorKind::InvalidBound.is_caller_error());
        assert!(ErrorKind::InvalidQuery.is_caller_error());
        assert!(!ErrorKind::StoreUnavailable.is_caller_error());
    }
}
