//! Time sources.
//!
//! Every expiry decision goes through a [`Clock`] so tests can move time
//! forward instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Clock abstraction for expiry checks.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_epoch_secs(&self) -> i64;

    fn now_epoch_millis(&self) -> i64 {
        self.now_epoch_secs().saturating_mul(1000)
    }

    /// Epoch seconds `ttl` from now, saturating at `i64::MAX`.
    fn deadline_secs(&self, ttl: Duration) -> i64 {
        self.now_epoch_secs().saturating_add(saturating_i64(ttl.as_secs().into()))
    }

    /// Epoch milliseconds `ttl` from now, saturating at `i64::MAX`.
    fn deadline_millis(&self, ttl: Duration) -> i64 {
        self.now_epoch_millis().saturating_add(saturating_i64(ttl.as_millis()))
    }
}

fn saturating_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Whole seconds in `ttl`, rounded up and never below one.
pub fn ceil_secs(ttl: Duration) -> u64 {
    ttl.as_secs()
        .saturating_add(u64::from(ttl.subsec_nanos() > 0))
        .max(1)
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn now_epoch_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Advanceable clock for simulated-time tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// 2024-01-01 00:00:00 UTC
    pub const DEFAULT_EPOCH_SECS: i64 = 1_704_067_200;

    pub fn new(epoch_secs: i64) -> Self {
        Self {
            millis: AtomicI64::new(epoch_secs.saturating_mul(1000)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = saturating_i64(by.as_millis());
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| {
                Some(ms.saturating_add(by))
            });
    }

    pub fn set(&self, epoch_secs: i64) {
        self.millis
            .store(epoch_secs.saturating_mul(1000), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_secs(&self) -> i64 {
        self.now_epoch_millis().div_euclid(1000)
    }

    fn now_epoch_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
