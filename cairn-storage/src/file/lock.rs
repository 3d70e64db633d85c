//! Lease files for the file drivers.
//!
//! A lease is a file created with `create_new`, holding the owner token and
//! expiry. Release reads the owner back and then deletes, which leaves a
//! short window where a lease that expired and was taken over in between
//! could be removed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cairn_core::{BackendError, CairnResult, Clock, FilePermissions, ValidationError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::{remove_file_if_exists, set_file_mode};
use crate::lock::LockBackend;

/// Attempts to take over an expired lease before reporting it held.
const MAX_TAKEOVER_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    owner: String,
    /// Epoch milliseconds; `None` never expires.
    expires_at: Option<i64>,
}

impl Lease {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if now_ms >= at)
    }
}

enum LeaseState {
    Missing,
    Held(Lease),
    /// Present but not parseable, most likely mid-write.
    Unreadable,
}

/// [`LockBackend`] over lease files in `<base>/locks`.
#[derive(Debug)]
pub struct FileLockBackend {
    dir: PathBuf,
    permissions: FilePermissions,
    clock: Arc<dyn Clock>,
}

impl FileLockBackend {
    pub fn open(
        base: impl AsRef<Path>,
        permissions: FilePermissions,
        clock: Arc<dyn Clock>,
    ) -> CairnResult<Self> {
        let dir = base.as_ref().join("locks");
        fs::create_dir_all(&dir).map_err(|e| BackendError::io(dir.display(), &e))?;
        Ok(Self {
            dir,
            permissions,
            clock,
        })
    }

    fn lease_path(&self, name: &str) -> CairnResult<PathBuf> {
        let file = name.replace('|', "!");
        if file.is_empty()
            || file == "."
            || file == ".."
            || file.contains(['/', '\\', '\0'])
        {
            return Err(ValidationError::InvalidKey {
                key: name.to_string(),
                reason: "not a valid lock name".to_string(),
            }
            .into());
        }
        Ok(self.dir.join(format!("{file}.lock")))
    }

    fn read_lease(&self, path: &Path) -> CairnResult<LeaseState> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .map(LeaseState::Held)
                .unwrap_or(LeaseState::Unreadable)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LeaseState::Missing),
            Err(e) => Err(BackendError::io(path.display(), &e).into()),
        }
    }

    fn create_lease(&self, path: &Path, lease: &Lease) -> CairnResult<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(BackendError::io(path.display(), &e).into()),
        };
        let bytes = serde_json::to_vec(lease)?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| BackendError::io(path.display(), &e))?;
        set_file_mode(path, self.permissions.file)?;
        Ok(true)
    }
}

impl LockBackend for FileLockBackend {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn try_acquire(&self, name: &str, owner: &str, ttl: Option<Duration>) -> CairnResult<bool> {
        let path = self.lease_path(name)?;
        for _ in 0..MAX_TAKEOVER_ATTEMPTS {
            let now = self.clock.now_epoch_millis();
            let lease = Lease {
                owner: owner.to_string(),
                expires_at: ttl.map(|ttl| self.clock.deadline_millis(ttl)),
            };
            if self.create_lease(&path, &lease)? {
                return Ok(true);
            }
            match self.read_lease(&path)? {
                LeaseState::Missing => continue,
                LeaseState::Held(current) if current.is_expired(now) => {
                    debug!(lock = %name, previous = %current.owner, "taking over expired lease");
                    remove_file_if_exists(&path)?;
                }
                LeaseState::Held(_) | LeaseState::Unreadable => return Ok(false),
            }
        }
        Ok(false)
    }

    fn release(&self, name: &str, owner: &str) -> CairnResult<bool> {
        let path = self.lease_path(name)?;
        match self.read_lease(&path)? {
            LeaseState::Held(lease) if lease.owner == owner => {
                remove_file_if_exists(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn force_release(&self, name: &str) -> CairnResult<()> {
        remove_file_if_exists(&self.lease_path(name)?)
    }

    fn current_owner(&self, name: &str) -> CairnResult<Option<String>> {
        let path = self.lease_path(name)?;
        match self.read_lease(&path)? {
            LeaseState::Held(lease) if !lease.is_expired(self.clock.now_epoch_millis()) => {
                Ok(Some(lease.owner))
            }
            _ => Ok(None),
        }
    }
}
