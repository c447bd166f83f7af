//! Per-tunnel circuit breaker with closed/open/half-open state (spec §4.4).
//!
//! No pack example implements a circuit breaker directly; built from the
//! spec's own state-machine description, in the teacher's idiom (RwLock map
//! with double-checked insertion, as the teacher guards its tunnel registry).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

/// Three-state failure-counting guard. All transitions happen under one lock.
pub struct CircuitBreaker {
    max_failures: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker::with_config(DEFAULT_MAX_FAILURES, DEFAULT_RECOVERY_TIMEOUT)
    }

    pub fn with_config(max_failures: u32, recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            max_failures,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                half_open_probe_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Returns `Ok(())` if the call should proceed, transitioning
    /// Open → Half-Open once `recovery_timeout` has elapsed. Half-Open admits
    /// exactly one in-flight probe; concurrent callers are refused until that
    /// probe resolves via `record_success`/`record_failure`.
    pub async fn allow(&self) -> Result<(), BreakerOpenError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Err(BreakerOpenError)
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                } else {
                    Err(BreakerOpenError)
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures = 0;
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.half_open_probe_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.failures = 0;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probe_in_flight = false;
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.max_failures {
                    inner.state = BreakerState::Open;
                    inner.failures = 0;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Convenience: if `allow` returns ok, run `f`, then record
    /// success/failure based on its result.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.allow().await.map_err(ExecuteError::Open)?;
        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(ExecuteError::Inner(e))
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct BreakerOpenError;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    #[error("circuit breaker is open")]
    Open(BreakerOpenError),
    #[error(transparent)]
    Inner(E),
}

/// Lazily allocates one breaker per tunnel id, with double-checked locking
/// on miss (spec §4.4, §5).
pub struct TunnelCircuitBreaker {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    max_failures: u32,
    recovery_timeout: Duration,
}

impl TunnelCircuitBreaker {
    pub fn new() -> Self {
        TunnelCircuitBreaker {
            breakers: RwLock::new(HashMap::new()),
            max_failures: DEFAULT_MAX_FAILURES,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }

    pub async fn get_or_create(&self, tunnel_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(tunnel_id) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write().await;
        if let Some(existing) = breakers.get(tunnel_id) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::with_config(
            self.max_failures,
            self.recovery_timeout,
        ));
        breakers.insert(tunnel_id.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub async fn remove(&self, tunnel_id: &str) {
        self.breakers.write().await.remove(tunnel_id);
    }
}

impl Default for TunnelCircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = CircuitBreaker::with_config(2, Duration::from_millis(50));
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.allow().await.is_err());
    }

    #[tokio::test]
    async fn test_success_resets_failures_in_closed() {
        let breaker = CircuitBreaker::with_config(2, Duration::from_millis(50));
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = CircuitBreaker::with_config(1, Duration::from_millis(10));
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await.is_ok());
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::with_config(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.allow().await.unwrap();
        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_only_one_probe() {
        let breaker = CircuitBreaker::with_config(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.allow().await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        assert!(breaker.allow().await.is_err());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_config(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.allow().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_tunnel_map_returns_same_breaker_for_same_id() {
        let map = TunnelCircuitBreaker::new();
        let a = map.get_or_create("t1").await;
        let b = map.get_or_create("t1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_tunnel_map_different_ids_get_different_breakers() {
        let map = TunnelCircuitBreaker::new();
        let a = map.get_or_create("t1").await;
        let b = map.get_or_create("t2").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
