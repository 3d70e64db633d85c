//! Cairn Core - Keys, Records and Configuration
//!
//! Shared vocabulary for the cairn cache stores: storage key encoding,
//! cache records, time sources, configuration and errors.
//! No backend I/O lives in this crate.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod identity;
pub mod key;

pub use clock::{ceil_secs, Clock, ManualClock, SystemClock};
pub use config::{Driver, FilePermissions, LockConfig, StoreConfig, DEFAULT_TTL_SECS};
pub use entry::{CacheEntry, CacheItem, FileRecord, TagName};
pub use error::{BackendError, CairnError, CairnResult, ConfigError, LockError, ValidationError};
pub use identity::{compute_key_hash, new_owner_token, OwnerToken};
pub use key::{KeyCodec, KeyRules};
