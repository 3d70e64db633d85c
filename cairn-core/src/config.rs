//! Store configuration

use crate::error::{CairnError, CairnResult, ConfigError};
use crate::key::KeyRules;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default entry lifetime when a write carries no ttl: 365 days.
pub const DEFAULT_TTL_SECS: u64 = 31_536_000;

/// Default LMDB map size.
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 64;

/// Backend driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Redis,
    Memcached,
    /// Flat file store, one file per key.
    File,
    /// Nested file store; the historical spelling is kept as the primary name.
    #[serde(rename = "hierarchial_file", alias = "hierarchical_file")]
    HierarchialFile,
    /// Embedded LMDB environment.
    Lmdb,
    /// In-process map, not persisted.
    Memory,
}

impl Driver {
    pub fn as_str(self) -> &'static str {
        match self {
            Driver::Redis => "redis",
            Driver::Memcached => "memcached",
            Driver::File => "file",
            Driver::HierarchialFile => "hierarchial_file",
            Driver::Lmdb => "lmdb",
            Driver::Memory => "memory",
        }
    }

    /// Escaping rules used for keys sent to this driver.
    pub fn key_rules(self) -> KeyRules {
        match self {
            Driver::File => KeyRules::FlatFile,
            Driver::HierarchialFile => KeyRules::HierarchicalFile,
            Driver::Redis | Driver::Memcached | Driver::Lmdb | Driver::Memory => {
                KeyRules::Protocol
            }
        }
    }

    pub fn is_network(self) -> bool {
        matches!(self, Driver::Redis | Driver::Memcached)
    }

    pub fn is_file(self) -> bool {
        matches!(self, Driver::File | Driver::HierarchialFile)
    }

    pub fn needs_path(self) -> bool {
        self.is_file() || self == Driver::Lmdb
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unix permission bits for files and directories the file drivers create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePermissions {
    #[serde(default)]
    pub file: Option<u32>,
    #[serde(default)]
    pub dir: Option<u32>,
}

impl FilePermissions {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.dir.is_none()
    }
}

/// Named lease settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_enabled")]
    pub enabled: bool,
    /// How long `Store::lock` keeps retrying a held lease. Zero means one attempt.
    #[serde(default, alias = "wait")]
    pub wait_ms: u64,
    #[serde(default = "default_retry_interval_ms", alias = "retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_lock_enabled() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: default_lock_enabled(),
            wait_ms: 0,
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Configuration for one cache store.
///
/// Consumed once by the driver factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub driver: Driver,
    #[serde(default)]
    pub prefix: String,
    /// Server URL for network drivers.
    #[serde(default)]
    pub connection: Option<String>,
    /// Root directory for file and lmdb drivers.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub permissions: FilePermissions,
    #[serde(default = "default_ttl_secs", alias = "default_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_lmdb_map_size_mb")]
    pub lmdb_map_size_mb: usize,
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_lmdb_map_size_mb() -> usize {
    DEFAULT_LMDB_MAP_SIZE_MB
}

impl StoreConfig {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            prefix: String::new(),
            connection: None,
            path: None,
            permissions: FilePermissions::default(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
            lock: LockConfig::default(),
        }
    }

    pub fn memory() -> Self {
        Self::new(Driver::Memory)
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Driver::File).with_path(path)
    }

    pub fn hierarchical_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Driver::HierarchialFile).with_path(path)
    }

    pub fn lmdb(path: impl Into<PathBuf>) -> Self {
        Self::new(Driver::Lmdb).with_path(path)
    }

    pub fn redis(url: impl Into<String>) -> Self {
        Self::new(Driver::Redis).with_connection(url)
    }

    pub fn memcached(url: impl Into<String>) -> Self {
        Self::new(Driver::Memcached).with_connection(url)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_connection(mut self, url: impl Into<String>) -> Self {
        self.connection = Some(url.into());
        self
    }

    pub fn with_permissions(mut self, permissions: FilePermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Parse a TOML table and validate it.
    pub fn from_toml_str(input: &str) -> CairnResult<Self> {
        let config: StoreConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(CairnError::Config) if invalid.
    ///
    /// Validates:
    /// - file and lmdb drivers have a path
    /// - network drivers have a connection URL
    /// - default ttl and lmdb map size are positive
    /// - permission bits fit in 0o7777 and only appear on file drivers
    /// - lock retry interval is positive when waiting is enabled
    pub fn validate(&self) -> CairnResult<()> {
        // Validate path
        if self.driver.needs_path() && self.path.is_none() {
            return Err(CairnError::Config(ConfigError::MissingRequired {
                field: "path".to_string(),
            }));
        }

        // Validate connection
        if self.driver.is_network() {
            match self.connection.as_deref() {
                None => {
                    return Err(CairnError::Config(ConfigError::MissingRequired {
                        field: "connection".to_string(),
                    }))
                }
                Some(url) if url.trim().is_empty() => {
                    return Err(CairnError::Config(ConfigError::InvalidValue {
                        field: "connection".to_string(),
                        value: url.to_string(),
                        reason: "connection must not be empty".to_string(),
                    }))
                }
                Some(_) => {}
            }
        }

        // Validate default_ttl_secs
        if self.default_ttl_secs == 0 {
            return Err(CairnError::Config(ConfigError::InvalidValue {
                field: "default_ttl_secs".to_string(),
                value: self.default_ttl_secs.to_string(),
                reason: "default_ttl_secs must be greater than 0".to_string(),
            }));
        }

        // Validate lmdb_map_size_mb
        if self.driver == Driver::Lmdb && self.lmdb_map_size_mb == 0 {
            return Err(CairnError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: self.lmdb_map_size_mb.to_string(),
                reason: "lmdb_map_size_mb must be greater than 0".to_string(),
            }));
        }
        if self.driver == Driver::Lmdb && self.lmdb_map_size_mb.checked_mul(1024 * 1024).is_none() {
            return Err(CairnError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: self.lmdb_map_size_mb.to_string(),
                reason: "lmdb_map_size_mb overflows the address space".to_string(),
            }));
        }

        // Validate permissions
        for (field, bits) in [
            ("permissions.file", self.permissions.file),
            ("permissions.dir", self.permissions.dir),
        ] {
            if let Some(bits) = bits {
                if bits > 0o7777 {
                    return Err(CairnError::Config(ConfigError::InvalidValue {
                        field: field.to_string(),
                        value: format!("{:o}", bits),
                        reason: "permission bits must be at most 0o7777".to_string(),
                    }));
                }
            }
        }
        if !self.permissions.is_empty() && !self.driver.is_file() {
            return Err(CairnError::Config(ConfigError::IncompatibleOptions {
                option_a: "permissions".to_string(),
                option_b: format!("driver = {}", self.driver),
            }));
        }

        // Validate lock retry interval
        if self.lock.enabled && self.lock.wait_ms > 0 && self.lock.retry_interval_ms == 0 {
            return Err(CairnError::Config(ConfigError::InvalidValue {
                field: "lock.retry_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "retry_interval_ms must be positive when wait_ms is set".to_string(),
            }));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::memory();
        assert_eq!(config.default_ttl(), Duration::from_secs(31_536_000));
        assert!(config.lock.enabled);
        assert_eq!(config.lock.wait(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_driver_requires_path() {
        let config = StoreConfig::new(Driver::HierarchialFile);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::MissingRequired { ref field }) if field == "path"
        ));
    }

    #[test]
    fn test_network_driver_requires_connection() {
        let config = StoreConfig::new(Driver::Redis);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::MissingRequired { ref field }) if field == "connection"
        ));

        let blank = StoreConfig::memcached("  ");
        assert!(matches!(
            blank.validate(),
            Err(CairnError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_oversized_lmdb_map_rejected() {
        let mut config = StoreConfig::lmdb("/tmp/cache");
        config.lmdb_map_size_mb = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(CairnError::Config(ConfigError::InvalidValue { ref field, .. })) if field == "lmdb_map_size_mb"
        ));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = StoreConfig::memory().with_default_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_permissions_only_for_file_drivers() {
        let perms = FilePermissions {
            file: Some(0o640),
            dir: Some(0o750),
        };
        assert!(StoreConfig::file("/tmp/c")
            .with_permissions(perms)
            .validate()
            .is_ok());
        assert!(matches!(
            StoreConfig::memory().with_permissions(perms).validate(),
            Err(CairnError::Config(ConfigError::IncompatibleOptions { .. }))
        ));

        let too_wide = FilePermissions {
            file: Some(0o17777),
            dir: None,
        };
        assert!(StoreConfig::file("/tmp/c")
            .with_permissions(too_wide)
            .validate()
            .is_err());
    }

    #[test]
    fn test_lock_wait_requires_interval() {
        let config = StoreConfig::memory().with_lock(LockConfig {
            enabled: true,
            wait_ms: 500,
            retry_interval_ms: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = StoreConfig::from_toml_str(
            r#"
            driver = "hierarchical_file"
            prefix = "app"
            path = "/var/cache/app"
            default_ttl = 600

            [permissions]
            file = 0o644

            [lock]
            wait = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.driver, Driver::HierarchialFile);
        assert_eq!(config.driver.key_rules(), KeyRules::HierarchicalFile);
        assert_eq!(config.prefix, "app");
        assert_eq!(config.default_ttl_secs, 600);
        assert_eq!(config.permissions.file, Some(0o644));
        assert_eq!(config.lock.wait_ms, 250);
        assert_eq!(config.lock.retry_interval_ms, 100);
    }

    #[test]
    fn test_from_toml_reports_parse_errors() {
        let err = StoreConfig::from_toml_str("driver = \"floppy\"").unwrap_err();
        assert!(matches!(err, CairnError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_driver_names_round_trip_through_serde() {
        let driver: Driver = serde_json::from_str("\"hierarchial_file\"").unwrap();
        assert_eq!(driver, Driver::HierarchialFile);
        assert_eq!(serde_json::to_string(&Driver::Lmdb).unwrap(), "\"lmdb\"");
        assert_eq!(Driver::File.to_string(), "file");
    }
}
