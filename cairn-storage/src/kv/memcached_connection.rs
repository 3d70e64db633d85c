//! Memcached connection.
//!
//! Memcached has no lists and no multi-key delete, so tag lists use the
//! default read-modify-write JSON encoding and tag invalidation walks members.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::{BackendError, CairnResult, Clock};
use memcache::{Client, MemcacheError};

use super::{ConnectionCapabilities, KvConnection};

/// Relative expirations above this are read by the server as unix time.
const MAX_RELATIVE_EXPIRATION_SECS: u64 = 60 * 60 * 24 * 30;

fn memcache_err(err: MemcacheError) -> BackendError {
    BackendError::unavailable("memcached", err)
}

/// [`KvConnection`] for one or more memcached servers.
pub struct MemcachedConnection {
    client: Client,
    clock: Arc<dyn Clock>,
    url: String,
}

impl fmt::Debug for MemcachedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedConnection")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl MemcachedConnection {
    /// Connect to `url` (`memcache://host:port`).
    pub fn open(url: &str, clock: Arc<dyn Clock>) -> CairnResult<Self> {
        let client = Client::connect(url).map_err(memcache_err)?;
        Ok(Self {
            client,
            clock,
            url: url.to_string(),
        })
    }

    fn expiration(&self, ttl: Option<Duration>) -> u32 {
        expiration_for(ttl, self.clock.now_epoch_secs())
    }
}

/// Memcached expiration field: `0` never expires, relative seconds up to 30
/// days, absolute unix time beyond.
fn expiration_for(ttl: Option<Duration>, now_secs: i64) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let secs = ttl.as_secs().max(1);
    if secs <= MAX_RELATIVE_EXPIRATION_SECS {
        return secs as u32;
    }
    let now = u64::try_from(now_secs).unwrap_or(0);
    u32::try_from(now.saturating_add(secs)).unwrap_or(u32::MAX)
}

impl KvConnection for MemcachedConnection {
    fn backend_name(&self) -> &'static str {
        "memcached"
    }

    fn capabilities(&self) -> ConnectionCapabilities {
        ConnectionCapabilities::ATOMIC_ADD
    }

    fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        Ok(self.client.get::<Vec<u8>>(key).map_err(memcache_err)?)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        self.client
            .set(key, value, self.expiration(ttl))
            .map_err(memcache_err)?;
        Ok(())
    }

    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<bool> {
        match self.client.add(key, value, self.expiration(ttl)) {
            Ok(()) => Ok(true),
            // NOT_STORED and transport failures look alike; a present key means the former
            Err(err) => match self.get(key)? {
                Some(_) => Ok(false),
                None => Err(memcache_err(err).into()),
            },
        }
    }

    fn delete(&self, key: &str) -> CairnResult<bool> {
        Ok(self.client.delete(key).map_err(memcache_err)?)
    }

    fn increment(&self, key: &str, by: i64) -> CairnResult<i64> {
        if self.get(key)?.is_none() && self.add(key, by.max(0).to_string().as_bytes(), None)? {
            return Ok(by.max(0));
        }
        let next = if by >= 0 {
            self.client.increment(key, by as u64)
        } else {
            self.client.decrement(key, by.unsigned_abs())
        }
        .map_err(memcache_err)?;
        i64::try_from(next).map_err(|e| BackendError::corrupt(key, e).into())
    }

    fn flush(&self) -> CairnResult<()> {
        self.client.flush().map_err(memcache_err)?;
        Ok(())
    }
}
