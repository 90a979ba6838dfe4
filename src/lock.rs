use std::process;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LockConfig;
use crate::db::{Database, DbError};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {key} is held by another process")]
    AlreadyLocked { key: String },
    #[error("Timed out after {waited_secs}s waiting for lock {key}")]
    Timeout { key: String, waited_secs: u64 },
    #[error("Lock {key} is not held by this handle")]
    NotOwner { key: String },
    #[error("Lock store error: {0}")]
    Store(#[from] DbError),
    #[error("Lock state error: {0}")]
    Serde(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, LockError>;

/// What the holder writes into the kv store. The pid allows stale-lock
/// cleanup to tell a crashed holder from a slow one.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    /// Unix seconds at acquisition.
    acquired_at: i64,
    token: String,
}

/// Proof of ownership, required to release. Dropping a handle without
/// releasing leaves the lock for stale cleanup to reap.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Cross-process mutual exclusion backed by the shared SQLite kv table.
/// Acquisition rides on an atomic insert-if-absent, so two processes
/// polling the same key can never both win.
pub struct LockService<'a> {
    db: &'a Database,
    cfg: LockConfig,
}

impl<'a> LockService<'a> {
    pub fn new(db: &'a Database, cfg: LockConfig) -> Self {
        Self { db, cfg }
    }

    /// Acquire the lock for (operation, resource). A zero timeout fails
    /// immediately when the lock is held; a positive timeout polls until
    /// acquired or the deadline passes.
    pub fn acquire(&self, operation: &str, resource: &str, timeout_secs: u64) -> Result<LockHandle> {
        let key = lock_key(operation, resource);
        let token = new_token();
        let holder = LockHolder {
            pid: process::id(),
            acquired_at: unix_now(),
            token: token.clone(),
        };
        let value = serde_json::to_string(&holder)?;

        let started = Instant::now();
        loop {
            if self.db.kv_set_if_absent(&key, &value, None)? {
                log::debug!("Acquired {key}");
                return Ok(LockHandle { key, token });
            }
            if timeout_secs == 0 {
                return Err(LockError::AlreadyLocked { key });
            }
            if started.elapsed() >= Duration::from_secs(timeout_secs) {
                return Err(LockError::Timeout {
                    key,
                    waited_secs: timeout_secs,
                });
            }
            thread::sleep(Duration::from_millis(self.cfg.poll_interval_ms));
        }
    }

    /// Release a held lock. Fails with NotOwner if the stored token does
    /// not match — someone force-released and re-acquired underneath us.
    pub fn release(&self, handle: LockHandle) -> Result<()> {
        match self.db.kv_get(&handle.key)? {
            Some(raw) => {
                let holder: LockHolder = serde_json::from_str(&raw)?;
                if holder.token != handle.token {
                    return Err(LockError::NotOwner { key: handle.key });
                }
                self.db.kv_delete(&handle.key)?;
                log::debug!("Released {}", handle.key);
                Ok(())
            }
            None => Err(LockError::NotOwner { key: handle.key }),
        }
    }

    pub fn is_locked(&self, operation: &str, resource: &str) -> Result<bool> {
        Ok(self.db.kv_get(&lock_key(operation, resource))?.is_some())
    }

    /// Unconditional release, for operator intervention. Returns true if
    /// a lock was actually removed.
    pub fn force_release(&self, operation: &str, resource: &str) -> Result<bool> {
        let key = lock_key(operation, resource);
        let removed = self.db.kv_delete(&key)?;
        if removed {
            log::warn!("Force-released {key}");
        }
        Ok(removed)
    }

    /// All currently held locks as (key, holder-json) pairs.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        Ok(self.db.kv_scan("lock:")?)
    }

    /// Remove locks that are both past the age threshold and whose owner
    /// process is dead. Returns the number reaped. A live holder keeps its
    /// lock no matter how old; a crashed holder keeps it until the window
    /// passes, so a restarting worker can pick its own lock back up.
    pub fn cleanup_stale(&self, max_age_hours: i64) -> Result<usize> {
        let max_age_secs = max_age_hours * 3600;
        let now = unix_now();
        let mut reaped = 0usize;

        for (key, raw) in self.db.kv_scan("lock:")? {
            let stale = match serde_json::from_str::<LockHolder>(&raw) {
                Ok(holder) => {
                    now - holder.acquired_at > max_age_secs && !pid_alive(holder.pid)
                }
                // Unparseable holder state cannot be released properly
                Err(_) => true,
            };
            if stale {
                log::warn!("Reaping stale lock {key}");
                self.db.kv_delete(&key)?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

fn lock_key(operation: &str, resource: &str) -> String {
    format!("lock:{operation}:{resource}")
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Unique-enough token: pid plus a monotonic-ish nanosecond stamp.
fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}-{}-{nanos}", process::id(), unix_now())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(db: &Database) -> LockService<'_> {
        LockService::new(
            db,
            LockConfig {
                poll_interval_ms: 10,
                stale_after_hours: 4,
            },
        )
    }

    #[test]
    fn test_mutual_exclusion() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);

        let h = locks.acquire("import", "GratefulDead", 0).unwrap();
        assert!(locks.is_locked("import", "GratefulDead").unwrap());

        // Second non-blocking acquire loses
        assert!(matches!(
            locks.acquire("import", "GratefulDead", 0),
            Err(LockError::AlreadyLocked { .. })
        ));
        // Different resource is independent
        let other = locks.acquire("import", "Phish", 0).unwrap();
        locks.release(other).unwrap();

        locks.release(h).unwrap();
        assert!(!locks.is_locked("import", "GratefulDead").unwrap());
        // Re-acquirable after release
        let h2 = locks.acquire("import", "GratefulDead", 0).unwrap();
        locks.release(h2).unwrap();
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);
        let _held = locks.acquire("crawl", "etree", 0).unwrap();
        assert!(matches!(
            locks.acquire("crawl", "etree", 1),
            Err(LockError::Timeout { waited_secs: 1, .. })
        ));
    }

    #[test]
    fn test_release_requires_matching_token() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);
        let held = locks.acquire("import", "GD", 0).unwrap();

        let forged = LockHandle {
            key: lock_key("import", "GD"),
            token: "forged".to_string(),
        };
        assert!(matches!(
            locks.release(forged),
            Err(LockError::NotOwner { .. })
        ));
        // Real owner still releases fine
        locks.release(held).unwrap();
    }

    #[test]
    fn test_force_release() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);
        let _held = locks.acquire("import", "GD", 0).unwrap();
        assert!(locks.force_release("import", "GD").unwrap());
        assert!(!locks.force_release("import", "GD").unwrap());
    }

    fn plant(db: &Database, resource: &str, pid: u32, age_secs: i64) {
        let holder = LockHolder {
            pid,
            acquired_at: unix_now() - age_secs,
            token: "x".to_string(),
        };
        db.kv_set(
            &lock_key("import", resource),
            &serde_json::to_string(&holder).unwrap(),
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_cleanup_requires_age_and_dead_owner() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);
        let dead_pid = u32::MAX - 1;

        plant(&db, "aged-dead", dead_pid, 5 * 3600);
        plant(&db, "fresh-dead", dead_pid, 60);
        plant(&db, "aged-live", process::id(), 5 * 3600);

        assert_eq!(locks.cleanup_stale(4).unwrap(), 1);
        assert!(!locks.is_locked("import", "aged-dead").unwrap());
        // A recently crashed holder keeps its lock until the window passes
        assert!(locks.is_locked("import", "fresh-dead").unwrap());
        // A live holder is never reaped, however old the lock
        assert!(locks.is_locked("import", "aged-live").unwrap());
    }

    #[test]
    fn test_unparseable_holder_is_reaped() {
        let db = Database::open_in_memory().unwrap();
        let locks = service(&db);
        db.kv_set("lock:import:junk", "{not json", None).unwrap();
        assert_eq!(locks.cleanup_stale(4).unwrap(), 1);
    }
}
