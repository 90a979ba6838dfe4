use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::db::Database;

/// Key-value key holding the shared breaker state.
const STATE_KEY: &str = "breaker:archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Serialize, Deserialize)]
struct BreakerState {
    state: State,
    failures: u32,
    /// Unix seconds of the last failure while closed/half-open.
    last_failure: i64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: State::Closed,
            failures: 0,
            last_failure: 0,
        }
    }
}

/// Circuit breaker guarding the archive API. State lives in the shared kv
/// store so every worker process sees the same circuit. The
/// read-then-write updates are best-effort: a race on the failure counter
/// only delays how quickly the circuit opens.
pub struct CircuitBreaker<'a> {
    db: &'a Database,
    threshold: u32,
    reset_secs: i64,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(db: &'a Database, threshold: u32, reset_secs: i64) -> Self {
        Self {
            db,
            threshold,
            reset_secs,
        }
    }

    fn load(&self) -> Result<BreakerState, ApiError> {
        let state = self
            .db
            .kv_get(STATE_KEY)?
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default();
        Ok(state)
    }

    fn store(&self, state: &BreakerState) -> Result<(), ApiError> {
        let json = serde_json::to_string(state)
            .map_err(|e| ApiError::Malformed {
                endpoint: "breaker".to_string(),
                message: e.to_string(),
            })?;
        self.db.kv_set(STATE_KEY, &json, None)?;
        Ok(())
    }

    /// Gate a call. Open circuit fails fast with `CircuitOpen` until the
    /// reset window elapses, then lets one trial call through (half-open).
    pub fn before_call(&self) -> Result<(), ApiError> {
        let mut s = self.load()?;
        match s.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed = Utc::now().timestamp() - s.last_failure;
                if elapsed >= self.reset_secs {
                    log::info!("Circuit breaker half-open after {elapsed}s, allowing trial call");
                    s.state = State::HalfOpen;
                    self.store(&s)?;
                    Ok(())
                } else {
                    Err(ApiError::CircuitOpen)
                }
            }
        }
    }

    /// A call succeeded: close the circuit and reset the failure count.
    pub fn on_success(&self) -> Result<(), ApiError> {
        let s = self.load()?;
        if s.state != State::Closed || s.failures > 0 {
            self.store(&BreakerState::default())?;
        }
        Ok(())
    }

    /// A call failed: count it, opening the circuit at the threshold.
    /// A half-open trial failure re-opens immediately and restarts the timeout.
    pub fn on_failure(&self) -> Result<(), ApiError> {
        let mut s = self.load()?;
        match s.state {
            State::HalfOpen => {
                log::warn!("Circuit breaker trial call failed, re-opening");
                s.state = State::Open;
                s.last_failure = Utc::now().timestamp();
            }
            State::Closed => {
                s.failures += 1;
                if s.failures >= self.threshold {
                    log::warn!(
                        "Circuit breaker opening after {} consecutive failures",
                        s.failures
                    );
                    s.state = State::Open;
                    s.last_failure = Utc::now().timestamp();
                }
            }
            State::Open => {
                s.last_failure = Utc::now().timestamp();
            }
        }
        self.store(&s)
    }

    /// True if the circuit is currently open (no reset-window check).
    pub fn is_open(&self) -> Result<bool, ApiError> {
        Ok(self.load()?.state == State::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(db: &Database) -> CircuitBreaker<'_> {
        CircuitBreaker::new(db, 3, 30)
    }

    /// Rewrite the stored failure timestamp to simulate elapsed time.
    fn backdate_failure(db: &Database, secs: i64) {
        let raw = db.kv_get(STATE_KEY).unwrap().unwrap();
        let mut s: BreakerState = serde_json::from_str(&raw).unwrap();
        s.last_failure -= secs;
        db.kv_set(STATE_KEY, &serde_json::to_string(&s).unwrap(), None)
            .unwrap();
    }

    #[test]
    fn test_opens_at_threshold() {
        let db = Database::open_in_memory().unwrap();
        let b = breaker(&db);

        b.before_call().unwrap();
        b.on_failure().unwrap();
        b.on_failure().unwrap();
        assert!(b.before_call().is_ok());
        b.on_failure().unwrap();

        assert!(b.is_open().unwrap());
        assert!(matches!(b.before_call(), Err(ApiError::CircuitOpen)));
    }

    #[test]
    fn test_half_open_after_reset_window() {
        let db = Database::open_in_memory().unwrap();
        let b = breaker(&db);
        for _ in 0..3 {
            b.on_failure().unwrap();
        }
        // 10s elapsed: still open
        backdate_failure(&db, 10);
        assert!(matches!(b.before_call(), Err(ApiError::CircuitOpen)));

        // 31s elapsed: trial call allowed, success closes the circuit
        backdate_failure(&db, 21);
        b.before_call().unwrap();
        b.on_success().unwrap();
        assert!(!b.is_open().unwrap());
        b.before_call().unwrap();
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let db = Database::open_in_memory().unwrap();
        let b = breaker(&db);
        for _ in 0..3 {
            b.on_failure().unwrap();
        }
        backdate_failure(&db, 31);
        b.before_call().unwrap(); // half-open trial
        b.on_failure().unwrap();
        assert!(b.is_open().unwrap());
        assert!(matches!(b.before_call(), Err(ApiError::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let db = Database::open_in_memory().unwrap();
        let b = breaker(&db);
        b.on_failure().unwrap();
        b.on_failure().unwrap();
        b.on_success().unwrap();
        // Counter reset — two more failures don't open a threshold-3 circuit
        b.on_failure().unwrap();
        b.on_failure().unwrap();
        assert!(!b.is_open().unwrap());
    }
}
