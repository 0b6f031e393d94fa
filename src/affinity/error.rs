//! Error types for the session affinity layer

use thiserror::Error;

use crate::cache::CacheError;

use super::codec::CodecError;

/// Errors raised while configuring the filter or claiming ownership
#[derive(Debug, Error)]
pub enum AffinityError {
    /// Explicit local server address is not an absolute http(s) URI
    #[error("Invalid local server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Any other startup-time configuration problem
    #[error("Invalid affinity configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(CacheError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AffinityError {
    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        AffinityError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error stems from configuration rather than a runtime fault
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            AffinityError::InvalidAddress { .. } | AffinityError::Config(_)
        )
    }
}

impl From<CacheError> for AffinityError {
    /// Factory errors raised by the store's own record factory come back
    /// wrapped by the cache; unwrap them to the original affinity error.
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Factory(inner) => match inner.downcast::<AffinityError>() {
                Ok(affinity) => *affinity,
                Err(other) => AffinityError::Cache(CacheError::Factory(other)),
            },
            CacheError::InvalidSelector(selector) => AffinityError::Config(format!(
                "invalid cache selector '{}' (expected 'memory' or 'sqlite:<path>')",
                selector
            )),
            other => AffinityError::Cache(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_error_unwraps_to_affinity_error() {
        let original = AffinityError::invalid_address("ftp://x", "scheme must be http or https");
        let wrapped = CacheError::Factory(Box::new(original));

        let err: AffinityError = wrapped.into();
        assert!(matches!(err, AffinityError::InvalidAddress { .. }));
        assert!(err.is_config());
    }

    #[test]
    fn test_backend_error_stays_cache_error() {
        let err: AffinityError = CacheError::Backend("connection refused".into()).into();
        assert!(matches!(err, AffinityError::Cache(CacheError::Backend(_))));
        assert!(!err.is_config());
        assert_eq!(err.to_string(), "Cache backend error: connection refused");
    }
}
