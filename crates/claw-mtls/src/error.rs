//! mTLS credential error types.

use thiserror::Error;

/// Result type for mTLS credential operations.
pub type Result<T> = std::result::Result<T, Error>;

/// mTLS credential error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Profile definitions are missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The issuance backend rejected or failed a request.
    #[error("issuance failed: {0}")]
    Issuance(String),

    /// Certificate or key material could not be decoded or assembled.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// Profile not registered.
    #[error("profile not found: {0}")]
    NotFound(String),

    /// A renewal loop already exists for the profile.
    #[error("renewal already scheduled for profile: {0}")]
    AlreadyScheduled(String),

    /// The scheduler has been shut down.
    #[error("renewal scheduler has been shut down")]
    ShutDown,

    /// No async runtime is available for background work.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Returns true if the error belongs to an issuance cycle and the cycle
    /// should be retried after backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Issuance(_) | Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_formats_correctly() {
        let err = Error::NotFound("payments".to_string());
        assert_eq!(err.to_string(), "profile not found: payments");

        let err = Error::Configuration("profile 'x' has no role".to_string());
        assert_eq!(err.to_string(), "configuration error: profile 'x' has no role");

        assert_eq!(Error::ShutDown.to_string(), "renewal scheduler has been shut down");
    }

    #[test_case(Error::Issuance("denied".into()), true ; "issuance")]
    #[test_case(Error::Decode("bad pem".into()), true ; "decode")]
    #[test_case(Error::NotFound("p".into()), false ; "not found")]
    #[test_case(Error::Configuration("c".into()), false ; "configuration")]
    #[test_case(Error::ShutDown, false ; "shut down")]
    fn retryable_classification(err: Error, expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }
}
