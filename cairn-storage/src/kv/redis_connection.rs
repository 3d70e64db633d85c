//! Redis connection over one synchronous client connection.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use cairn_core::{BackendError, CairnResult};
use once_cell::sync::Lazy;
use redis::{Connection, RedisError, Script};

use super::{ConnectionCapabilities, KvConnection};

/// Delete KEYS[1] only while it still holds ARGV[1].
static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        end
        return 0
        "#,
    )
});

fn redis_err(err: RedisError) -> BackendError {
    BackendError::unavailable("redis", err)
}

/// Largest `PX` the server accepts once added to its own clock.
const MAX_TTL_MILLIS: u64 = (i64::MAX / 2) as u64;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_TTL_MILLIS)
}

/// [`KvConnection`] for a redis server. Tag lists are native redis lists.
pub struct RedisConnection {
    conn: Mutex<Connection>,
    url: String,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    /// Connect to `url` (`redis://host:port/db`).
    pub fn open(url: &str) -> CairnResult<Self> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let conn = client.get_connection().map_err(redis_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            url: url.to_string(),
        })
    }

    fn lock(&self) -> CairnResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BackendError::LockPoisoned.into())
    }
}

impl KvConnection for RedisConnection {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> ConnectionCapabilities {
        ConnectionCapabilities::all()
    }

    fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        let mut conn = self.lock()?;
        Ok(redis::cmd("GET")
            .arg(key)
            .query::<Option<Vec<u8>>>(&mut *conn)
            .map_err(redis_err)?)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let mut conn = self.lock()?;
        cmd.query::<()>(&mut *conn).map_err(redis_err)?;
        Ok(())
    }

    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let mut conn = self.lock()?;
        let reply: Option<String> = cmd.query(&mut *conn).map_err(redis_err)?;
        Ok(reply.is_some())
    }

    fn delete(&self, key: &str) -> CairnResult<bool> {
        let mut conn = self.lock()?;
        let deleted: usize = redis::cmd("DEL")
            .arg(key)
            .query(&mut *conn)
            .map_err(redis_err)?;
        Ok(deleted > 0)
    }

    fn increment(&self, key: &str, by: i64) -> CairnResult<i64> {
        let mut conn = self.lock()?;
        Ok(redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query::<i64>(&mut *conn)
            .map_err(redis_err)?)
    }

    fn flush(&self) -> CairnResult<()> {
        let mut conn = self.lock()?;
        redis::cmd("FLUSHDB")
            .query::<()>(&mut *conn)
            .map_err(redis_err)?;
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> CairnResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        Ok(redis::cmd("DEL")
            .arg(keys)
            .query::<usize>(&mut *conn)
            .map_err(redis_err)?)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> CairnResult<bool> {
        let mut conn = self.lock()?;
        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke(&mut *conn)
            .map_err(redis_err)?;
        Ok(deleted > 0)
    }

    fn list_range(&self, key: &str) -> CairnResult<Vec<String>> {
        let mut conn = self.lock()?;
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query::<Vec<String>>(&mut *conn)
            .map_err(redis_err)?)
    }

    /// `RPUSH`; duplicates are left for readers to compact.
    fn list_push(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut conn = self.lock()?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(member)
            .query::<()>(&mut *conn)
            .map_err(redis_err)?;
        Ok(())
    }

    fn list_remove(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut conn = self.lock()?;
        redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(member)
            .query::<()>(&mut *conn)
            .map_err(redis_err)?;
        Ok(())
    }
}
