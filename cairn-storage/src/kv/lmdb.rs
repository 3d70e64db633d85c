//! LMDB-backed connection for the `lmdb` driver.
//!
//! Uses the heed crate (Rust bindings for LMDB): a memory-mapped,
//! persistent key/value store embedded in the process.
//!
//! # Value Format
//!
//! `[expires_at: 8 bytes LE, epoch millis, 0 = never][payload]`
//!
//! Expired values are skipped on read and overwritten on the next write;
//! there is no background sweep.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Reads use a read transaction; every
//! read-modify-write primitive (`add`, `increment`, compare-and-delete, list
//! updates) runs inside a single write transaction, so they are atomic
//! across threads and processes sharing the environment.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::{BackendError, CairnError, CairnResult, Clock, ConfigError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use super::{decode_counter, decode_list, ConnectionCapabilities, KvConnection};
use crate::tag_index::push_unique;

const EXPIRY_WIDTH: usize = 8;

/// Persistent [`KvConnection`] over one LMDB environment.
pub struct LmdbConnection {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LmdbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbConnection")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

fn lmdb_err(err: heed::Error) -> CairnError {
    BackendError::unavailable("lmdb", err).into()
}

fn encode(expires_at: Option<i64>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(EXPIRY_WIDTH + payload.len());
    bytes.extend_from_slice(&expires_at.unwrap_or(0).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn decode<'b>(key: &str, bytes: &'b [u8]) -> CairnResult<(Option<i64>, &'b [u8])> {
    if bytes.len() < EXPIRY_WIDTH {
        return Err(BackendError::corrupt(key, "value shorter than expiry header").into());
    }
    let (header, payload) = bytes.split_at(EXPIRY_WIDTH);
    let expiry_bytes: [u8; EXPIRY_WIDTH] = header
        .try_into()
        .map_err(|_| BackendError::corrupt(key, "invalid expiry header"))?;
    let expires_at = match i64::from_le_bytes(expiry_bytes) {
        0 => None,
        at => Some(at),
    };
    Ok((expires_at, payload))
}

impl LmdbConnection {
    /// Open (and create) an environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    /// - `max_size_mb` does not fit in the address space
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: Arc<dyn Clock>,
    ) -> CairnResult<Self> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            CairnError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: max_size_mb.to_string(),
                reason: "map size overflows the address space".to_string(),
            })
        })?;

        // Ensure directory exists
        std::fs::create_dir_all(&path)
            .map_err(|e| BackendError::io(path.as_ref().display(), &e))?;

        // Open LMDB environment
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(lmdb_err)?;

        // Open the default database
        let mut wtxn = env.write_txn().map_err(lmdb_err)?;
        let db: Database<Bytes, Bytes> =
            env.create_database(&mut wtxn, None).map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        Ok(Self { env, db, clock })
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.deadline_millis(ttl))
    }

    /// Live `(expires_at, payload)` under `key` within `txn`.
    fn read_live(&self, txn: &RoTxn<'_>, key: &str) -> CairnResult<Option<(Option<i64>, Vec<u8>)>> {
        let Some(bytes) = self.db.get(txn, key.as_bytes()).map_err(lmdb_err)? else {
            return Ok(None);
        };
        let (expires_at, payload) = decode(key, bytes)?;
        if matches!(expires_at, Some(at) if self.clock.now_epoch_millis() >= at) {
            return Ok(None);
        }
        Ok(Some((expires_at, payload.to_vec())))
    }

    /// Rewrite one list inside a single write transaction.
    fn update_list<F>(&self, key: &str, update: F) -> CairnResult<()>
    where
        F: FnOnce(&mut Vec<String>) -> bool,
    {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut list = match self.read_live(&wtxn, key)? {
            Some((_, payload)) => decode_list(key, &payload)?,
            None => Vec::new(),
        };
        if update(&mut list) {
            let bytes = encode(None, &serde_json::to_vec(&list)?);
            self.db
                .put(&mut wtxn, key.as_bytes(), &bytes)
                .map_err(lmdb_err)?;
            wtxn.commit().map_err(lmdb_err)?;
        }
        Ok(())
    }
}

impl KvConnection for LmdbConnection {
    fn backend_name(&self) -> &'static str {
        "lmdb"
    }

    fn capabilities(&self) -> ConnectionCapabilities {
        ConnectionCapabilities::ATOMIC_ADD
            | ConnectionCapabilities::BULK_DELETE
            | ConnectionCapabilities::COMPARE_AND_DELETE
    }

    fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(lmdb_err)?;
        Ok(self.read_live(&rtxn, key)?.map(|(_, payload)| payload))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        let bytes = encode(self.expiry(ttl), value);
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)
    }

    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        if self.read_live(&wtxn, key)?.is_some() {
            return Ok(false);
        }
        let bytes = encode(self.expiry(ttl), value);
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> CairnResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let was_live = self.read_live(&wtxn, key)?.is_some();
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;
        Ok(was_live)
    }

    fn increment(&self, key: &str, by: i64) -> CairnResult<i64> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let (current, expires_at) = match self.read_live(&wtxn, key)? {
            Some((expires_at, payload)) => (decode_counter(key, &payload)?, expires_at),
            None => (0, None),
        };
        let next = current + by;
        let bytes = encode(expires_at, next.to_string().as_bytes());
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;
        Ok(next)
    }

    fn flush(&self) -> CairnResult<()> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        self.db.clear(&mut wtxn).map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)
    }

    fn delete_many(&self, keys: &[String]) -> CairnResult<usize> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let mut deleted = 0;
        for key in keys {
            if self.read_live(&wtxn, key)?.is_some() {
                deleted += 1;
            }
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(lmdb_err)?;
        }
        wtxn.commit().map_err(lmdb_err)?;
        Ok(deleted)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> CairnResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err)?;
        let matches = self
            .read_live(&wtxn, key)?
            .is_some_and(|(_, payload)| payload == expected);
        if matches {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(lmdb_err)?;
            wtxn.commit().map_err(lmdb_err)?;
        }
        Ok(matches)
    }

    fn list_push(&self, key: &str, member: &str) -> CairnResult<()> {
        self.update_list(key, |list| push_unique(list, member))
    }

    fn list_remove(&self, key: &str, member: &str) -> CairnResult<()> {
        self.update_list(key, |list| {
            let before = list.len();
            list.retain(|m| m != member);
            list.len() != before
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_conn() -> (LmdbConnection, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(ManualClock::new(ManualClock::DEFAULT_EPOCH_SECS));
        let conn = LmdbConnection::open(temp_dir.path(), 10, clock.clone())
            .expect("connection creation should succeed");
        (conn, clock, temp_dir)
    }

    #[test]
    fn test_oversized_map_rejected() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(ManualClock::new(ManualClock::DEFAULT_EPOCH_SECS));
        let err = LmdbConnection::open(temp_dir.path(), usize::MAX, clock).unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "lmdb_map_size_mb"
        ));
    }

    #[test]
    fn test_far_future_expiry_stays_live() {
        let (conn, clock, _dir) = create_test_conn();
        conn.set("k", b"v", Some(Duration::MAX)).unwrap();
        conn.set("s", b"v", Some(Duration::from_secs(u64::MAX))).unwrap();
        clock.advance(Duration::from_secs(10 * 365 * 86_400));
        assert_eq!(conn.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(conn.get("s").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_put_and_get() {
        let (conn, _clock, _dir) = create_test_conn();
        conn.set("k", b"value", None).unwrap();
        assert_eq!(conn.get("k").unwrap(), Some(b"value".to_vec()));
        assert_eq!(conn.get("missing").unwrap(), None);
    }

    #[test]
    fn test_value_header_layout() {
        let (conn, clock, _dir) = create_test_conn();
        conn.set("k", b"v", Some(Duration::from_secs(1))).unwrap();

        let rtxn = conn.env.read_txn().unwrap();
        let raw = conn.db.get(&rtxn, b"k".as_slice()).unwrap().unwrap();
        let expiry = i64::from_le_bytes(raw[..8].try_into().unwrap());
        assert_eq!(expiry, clock.now_epoch_millis() + 1000);
        assert_eq!(&raw[8..], b"v");
    }

    #[test]
    fn test_expired_values_are_invisible() {
        let (conn, clock, _dir) = create_test_conn();
        conn.set("k", b"v", Some(Duration::from_secs(3))).unwrap();
        clock.advance(Duration::from_secs(3));
        assert_eq!(conn.get("k").unwrap(), None);
        assert!(conn.add("k", b"w", None).unwrap());
    }

    #[test]
    fn test_add_and_compare_delete() {
        let (conn, _clock, _dir) = create_test_conn();
        assert!(conn.add("lock", b"a", None).unwrap());
        assert!(!conn.add("lock", b"b", None).unwrap());
        assert!(!conn.delete_if_equals("lock", b"b").unwrap());
        assert!(conn.delete_if_equals("lock", b"a").unwrap());
        assert_eq!(conn.get("lock").unwrap(), None);
    }

    #[test]
    fn test_increment() {
        let (conn, _clock, _dir) = create_test_conn();
        assert_eq!(conn.increment("n", 1).unwrap(), 1);
        assert_eq!(conn.increment("n", 2).unwrap(), 3);
    }

    #[test]
    fn test_lists_and_bulk_delete() {
        let (conn, _clock, _dir) = create_test_conn();
        conn.list_push("tag!t", "a").unwrap();
        conn.list_push("tag!t", "a").unwrap();
        conn.list_push("tag!t", "b").unwrap();
        assert_eq!(conn.list_range("tag!t").unwrap(), vec!["a", "b"]);

        conn.set("a", b"1", None).unwrap();
        let deleted = conn
            .delete_many(&["a".to_string(), "tag!t".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(conn.list_range("tag!t").unwrap().is_empty());
    }

    #[test]
    fn test_flush_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        {
            let conn = LmdbConnection::open(temp_dir.path(), 10, clock.clone()).unwrap();
            conn.set("persisted", b"yes", None).unwrap();
        }
        let conn = LmdbConnection::open(temp_dir.path(), 10, clock).unwrap();
        assert_eq!(conn.get("persisted").unwrap(), Some(b"yes".to_vec()));
        conn.flush().unwrap();
        assert_eq!(conn.get("persisted").unwrap(), None);
    }
}
