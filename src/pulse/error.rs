//! Pulse validation errors.

use thiserror::Error;

/// Errors that can occur while validating pulse configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PulseError {
    /// Pulse type is not one of `tcp`, `http` or `none`.
    #[error("unknown pulse type '{0}'")]
    UnknownType(String),

    /// Probe interval must be strictly positive.
    #[error("pulse interval must be positive")]
    InvalidInterval,
}

/// Result type for pulse operations.
pub type PulseResult<T> = Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PulseError::UnknownType("icmp".to_string());
        assert_eq!(err.to_string(), "unknown pulse type 'icmp'");

        assert_eq!(
            PulseError::InvalidInterval.to_string(),
            "pulse interval must be positive"
        );
    }
}
