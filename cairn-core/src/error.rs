//! Error types for cairn cache operations

use thiserror::Error;

/// Key validation errors.
///
/// Raised before any backend I/O happens; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cache key is empty")]
    EmptyKey,

    #[error("Invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Value stored at {key:?} is not an integer")]
    NotAnInteger { key: String },
}

/// Backend I/O and record errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("I/O failure at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error(
        "Invalidation of tag {tag} stopped after {cleared} members ({remaining} remaining): {reason}"
    )]
    PartialInvalidation {
        tag: String,
        cleared: usize,
        remaining: usize,
        reason: String,
    },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Driver not supported: {driver}")]
    DriverNotSupported { driver: String },

    #[error("Configuration parse error: {reason}")]
    Parse { reason: String },
}

/// Named lease errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock {name} is already held")]
    AlreadyHeld { name: String },

    #[error("Timed out after {waited_ms}ms waiting for lock {name}")]
    Timeout { name: String, waited_ms: u64 },

    #[error("Driver {driver} does not support locks")]
    Unsupported { driver: String },
}

/// Master error type for all cairn errors.
#[derive(Debug, Clone, Error)]
pub enum CairnError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

/// Result type alias for cairn operations.
pub type CairnResult<T> = Result<T, CairnError>;

impl BackendError {
    /// Wrap a filesystem error together with the path it happened at.
    pub fn io(path: impl std::fmt::Display, err: &std::io::Error) -> Self {
        BackendError::Io {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn unavailable(backend: &str, reason: impl std::fmt::Display) -> Self {
        BackendError::Unavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(key: &str, reason: impl std::fmt::Display) -> Self {
        BackendError::CorruptRecord {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CairnError {
    fn from(err: serde_json::Error) -> Self {
        CairnError::Backend(err.into())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_invalid_key() {
        let err = ValidationError::InvalidKey {
            key: "a/../b".to_string(),
            reason: "parent segment".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid cache key"));
        assert!(msg.contains("a/../b"));
        assert!(msg.contains("parent segment"));
    }

    #[test]
    fn test_backend_error_display_partial_invalidation() {
        let err = BackendError::PartialInvalidation {
            tag: "|app|users".to_string(),
            cleared: 3,
            remaining: 2,
            reason: "disk full".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("|app|users"));
        assert!(msg.contains("3 members"));
        assert!(msg.contains("2 remaining"));
    }

    #[test]
    fn test_backend_error_io_helper() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = BackendError::io("/tmp/cache/a#", &io);
        assert!(matches!(err, BackendError::Io { ref path, .. } if path == "/tmp/cache/a#"));
    }

    #[test]
    fn test_lock_error_display_timeout() {
        let err = LockError::Timeout {
            name: "reports".to_string(),
            waited_ms: 250,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("250ms"));
        assert!(msg.contains("reports"));
    }

    #[test]
    fn test_config_error_display_driver_not_supported() {
        let err = ConfigError::DriverNotSupported {
            driver: "memcached".to_string(),
        };
        assert!(format!("{}", err).contains("memcached"));
    }

    #[test]
    fn test_cairn_error_from_variants() {
        let validation = CairnError::from(ValidationError::EmptyKey);
        assert!(matches!(validation, CairnError::Validation(_)));

        let backend = CairnError::from(BackendError::LockPoisoned);
        assert!(matches!(backend, CairnError::Backend(_)));

        let config = CairnError::from(ConfigError::MissingRequired {
            field: "path".to_string(),
        });
        assert!(matches!(config, CairnError::Config(_)));

        let lock = CairnError::from(LockError::AlreadyHeld {
            name: "job".to_string(),
        });
        assert!(matches!(lock, CairnError::Lock(_)));
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<i64>("not json").unwrap_err();
        let err = CairnError::from(json_err);
        assert!(matches!(
            err,
            CairnError::Backend(BackendError::Serialization { .. })
        ));
    }
}
