use thiserror::Error;

pub type DriverResult<T, E = DriverError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    /// The path has no object and nothing below it.
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("unsupported method")]
    UnsupportedMethod,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Every problem found while validating a configuration, reported at once.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),

    /// Failure reported by the remote object store, passed through as-is.
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

/// Error returned by `StorageDriver::write_stream`.
///
/// Carries the number of bytes taken from the source before the failure so
/// callers can resume the upload from `offset + consumed`.
#[derive(Error, Debug)]
#[error("write stopped after {consumed} bytes: {source}")]
pub struct PartialWrite {
    pub consumed: u64,
    #[source]
    pub source: DriverError,
}

impl PartialWrite {
    pub fn new(consumed: u64, source: impl Into<DriverError>) -> Self {
        Self {
            consumed,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_lists_every_problem() {
        let err = DriverError::InvalidConfiguration(vec![
            "no region parameter provided".into(),
            "no bucket parameter provided".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid configuration: no region parameter provided; no bucket parameter provided"
        );
    }

    #[test]
    fn partial_write_keeps_consumed_count() {
        let err = PartialWrite::new(42, std::io::Error::other("source broke"));
        assert_eq!(err.consumed, 42);
        assert!(matches!(err.source, DriverError::Io(_)));
        assert!(err.to_string().starts_with("write stopped after 42 bytes"));
    }
}
