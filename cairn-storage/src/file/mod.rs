//! Filesystem drivers: the cache engine and its lease files.

pub mod engine;
pub mod lock;

pub use engine::{FileCachePool, FileLayout};
pub use lock::FileLockBackend;
