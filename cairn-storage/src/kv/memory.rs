//! In-process connection for the `memory` driver and for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cairn_core::{BackendError, CairnResult, Clock};

use super::{decode_counter, decode_list, ConnectionCapabilities, KvConnection};
use crate::tag_index::push_unique;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    /// Epoch milliseconds; `None` never expires.
    expires_at: Option<i64>,
}

/// Map-backed [`KvConnection`]. Every operation runs under one mutex, so all
/// primitives are atomic.
#[derive(Debug)]
pub struct InMemoryConnection {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    capabilities: ConnectionCapabilities,
}

impl InMemoryConnection {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capabilities(clock, ConnectionCapabilities::all())
    }

    /// Advertise a narrower set of primitives, to behave like a simpler server.
    pub fn with_capabilities(clock: Arc<dyn Clock>, capabilities: ConnectionCapabilities) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            capabilities,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_epoch_millis();
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| is_live(s, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> CairnResult<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| BackendError::LockPoisoned.into())
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.deadline_millis(ttl))
    }

    /// Live value under `key`, dropping it if expired.
    fn live<'m>(&self, slots: &'m mut HashMap<String, Slot>, key: &str) -> Option<&'m mut Slot> {
        let now = self.clock.now_epoch_millis();
        if slots.get(key).is_some_and(|slot| !is_live(slot, now)) {
            slots.remove(key);
        }
        slots.get_mut(key)
    }
}

fn is_live(slot: &Slot, now_ms: i64) -> bool {
    !matches!(slot.expires_at, Some(at) if now_ms >= at)
}

impl KvConnection for InMemoryConnection {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> ConnectionCapabilities {
        self.capabilities
    }

    fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        let mut slots = self.lock()?;
        Ok(self.live(&mut slots, key).map(|slot| slot.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        let expires_at = self.expiry(ttl);
        self.lock()?.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut slots = self.lock()?;
        if self.live(&mut slots, key).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> CairnResult<bool> {
        let mut slots = self.lock()?;
        let was_live = self.live(&mut slots, key).is_some();
        slots.remove(key);
        Ok(was_live)
    }

    fn increment(&self, key: &str, by: i64) -> CairnResult<i64> {
        let mut slots = self.lock()?;
        let (current, expires_at) = match self.live(&mut slots, key) {
            Some(slot) => (decode_counter(key, &slot.value)?, slot.expires_at),
            None => (0, None),
        };
        let next = current + by;
        slots.insert(
            key.to_string(),
            Slot {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn flush(&self) -> CairnResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> CairnResult<usize> {
        let mut slots = self.lock()?;
        let mut deleted = 0;
        for key in keys {
            if self.live(&mut slots, key).is_some() {
                deleted += 1;
            }
            slots.remove(key);
        }
        Ok(deleted)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> CairnResult<bool> {
        let mut slots = self.lock()?;
        let matches = self
            .live(&mut slots, key)
            .is_some_and(|slot| slot.value == expected);
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    fn list_push(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut slots = self.lock()?;
        let mut list = match self.live(&mut slots, key) {
            Some(slot) => decode_list(key, &slot.value)?,
            None => Vec::new(),
        };
        if push_unique(&mut list, member) {
            slots.insert(
                key.to_string(),
                Slot {
                    value: serde_json::to_vec(&list)?,
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    fn list_remove(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut slots = self.lock()?;
        if let Some(slot) = self.live(&mut slots, key) {
            let mut list = decode_list(key, &slot.value)?;
            list.retain(|m| m != member);
            slot.value = serde_json::to_vec(&list)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::ManualClock;

    fn create_test_conn() -> (InMemoryConnection, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(ManualClock::DEFAULT_EPOCH_SECS));
        (InMemoryConnection::new(clock.clone()), clock)
    }

    #[test]
    fn test_set_get_delete() {
        let (conn, _clock) = create_test_conn();
        conn.set("k", b"v", None).unwrap();
        assert_eq!(conn.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(conn.delete("k").unwrap());
        assert!(!conn.delete("k").unwrap());
        assert_eq!(conn.get("k").unwrap(), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let (conn, clock) = create_test_conn();
        conn.set("k", b"v", Some(Duration::from_secs(2))).unwrap();
        clock.advance(Duration::from_millis(1999));
        assert!(conn.get("k").unwrap().is_some());
        clock.advance(Duration::from_millis(1));
        assert!(conn.get("k").unwrap().is_none());
    }

    #[test]
    fn test_add_only_when_absent() {
        let (conn, clock) = create_test_conn();
        assert!(conn.add("k", b"a", Some(Duration::from_secs(1))).unwrap());
        assert!(!conn.add("k", b"b", None).unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(conn.add("k", b"c", None).unwrap());
        assert_eq!(conn.get("k").unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn test_increment_creates_counter() {
        let (conn, _clock) = create_test_conn();
        assert_eq!(conn.increment("n", 1).unwrap(), 1);
        assert_eq!(conn.increment("n", 5).unwrap(), 6);
        assert_eq!(conn.get("n").unwrap(), Some(b"6".to_vec()));

        conn.set("bad", b"x", None).unwrap();
        assert!(conn.increment("bad", 1).is_err());
    }

    #[test]
    fn test_compare_and_delete() {
        let (conn, _clock) = create_test_conn();
        conn.set("lock", b"owner-a", None).unwrap();
        assert!(!conn.delete_if_equals("lock", b"owner-b").unwrap());
        assert!(conn.delete_if_equals("lock", b"owner-a").unwrap());
    }

    #[test]
    fn test_lists_dedupe_on_push() {
        let (conn, _clock) = create_test_conn();
        conn.list_push("l", "a").unwrap();
        conn.list_push("l", "b").unwrap();
        conn.list_push("l", "a").unwrap();
        assert_eq!(conn.list_range("l").unwrap(), vec!["a", "b"]);
        conn.list_remove("l", "a").unwrap();
        assert_eq!(conn.list_range("l").unwrap(), vec!["b"]);
        assert!(conn.list_range("missing").unwrap().is_empty());
    }

    #[test]
    fn test_delete_many_and_flush() {
        let (conn, _clock) = create_test_conn();
        for key in ["a", "b", "c"] {
            conn.set(key, b"1", None).unwrap();
        }
        let deleted = conn
            .delete_many(&["a".to_string(), "b".to_string(), "zz".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(conn.len(), 1);
        conn.flush().unwrap();
        assert!(conn.is_empty());
    }
}
