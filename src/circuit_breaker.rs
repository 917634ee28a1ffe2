//! Circuit breaker guarding outbound threat-intel providers.
//!
//! Each provider (VirusTotal, AbuseIPDB, ipinfo, WHOIS, DNS) gets its own breaker.
//! After `failure_threshold` consecutive transient failures the breaker opens
//! and lookups are skipped as unavailable until `reset_timeout_secs` passes;
//! then a single probe request is let through (half-open). A probe that never
//! reports back is forgotten after another `reset_timeout_secs`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{PhishError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// Set while the half-open probe is in flight
    probe_started: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

/// Only transient upstream trouble trips the breaker
fn counts_as_failure(error: &PhishError) -> bool {
    matches!(
        error,
        PhishError::RateLimitExceeded { .. }
            | PhishError::ServerError { .. }
            | PhishError::NetworkError(_)
    )
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_started: None,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reject the call early while the circuit is open
    pub async fn check_request(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.reset_timeout_secs);
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => match inner.probe_started.map(|t| t.elapsed()) {
                Some(running) if running < timeout => Err(PhishError::CircuitBreakerOpen {
                    message: format!("{} is being probed after repeated failures", self.name),
                    retry_after_secs: (timeout - running).as_secs(),
                }),
                _ => {
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                }
            },
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(timeout);

                if elapsed >= timeout {
                    debug!(provider = self.name, "Circuit half-open after {:?}", elapsed);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(PhishError::CircuitBreakerOpen {
                        message: format!(
                            "{} disabled after {} consecutive failures",
                            self.name, inner.failure_count
                        ),
                        retry_after_secs: (timeout - elapsed).as_secs(),
                    })
                }
            }
        }
    }

    pub async fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            debug!(provider = self.name, "Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub async fn record_failure(&self, error: &PhishError) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.probe_started = None;
        if !counts_as_failure(error) {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        provider = self.name,
                        failures = inner.failure_count,
                        "Opening circuit for {} seconds",
                        self.config.reset_timeout_secs
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = self.name, "Probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` under the breaker, recording its outcome
    pub async fn guard<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_request().await?;
        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error).await;
                Err(error)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout_secs: 1,
        }
    }

    fn server_error() -> PhishError {
        PhishError::ServerError {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("virustotal", config(3));
        for _ in 0..3 {
            breaker.record_failure(&server_error()).await;
        }

        assert_eq!(breaker.state().await, CircuitState::Open);
        let err = breaker.check_request().await.unwrap_err();
        assert!(matches!(err, PhishError::CircuitBreakerOpen { .. }));
        assert!(err.to_string().contains("virustotal"));
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_count() {
        let breaker = CircuitBreaker::new("abuseipdb", config(1));
        breaker
            .record_failure(&PhishError::AuthError("bad key".to_string()))
            .await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("ipinfo", config(3));
        breaker.record_failure(&server_error()).await;
        breaker.record_failure(&server_error()).await;
        breaker.record_success().await;
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_recovers() {
        let breaker = CircuitBreaker::new("whois", config(1));
        breaker.record_failure(&server_error()).await;
        assert!(breaker.check_request().await.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(breaker.check_request().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_one_probe() {
        let breaker = CircuitBreaker::new("dns", config(1));
        breaker.record_failure(&server_error()).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(breaker.check_request().await.is_ok());
        let err = breaker.check_request().await.unwrap_err();
        assert!(matches!(err, PhishError::CircuitBreakerOpen { .. }));

        breaker.record_success().await;
        assert!(breaker.check_request().await.is_ok());
        assert!(breaker.check_request().await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_probe_expires() {
        let breaker = CircuitBreaker::new("dns", config(1));
        breaker.record_failure(&server_error()).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        breaker.check_request().await.unwrap();
        assert!(breaker.check_request().await.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(breaker.check_request().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_permanent_error_releases_probe() {
        let breaker = CircuitBreaker::new("virustotal", config(1));
        breaker.record_failure(&server_error()).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let _ = breaker
            .guard(async { Err::<(), _>(PhishError::AuthError("bad key".to_string())) })
            .await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert!(breaker.check_request().await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("whois", config(1));
        breaker.record_failure(&server_error()).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        breaker.check_request().await.unwrap();

        breaker
            .record_failure(&PhishError::NetworkError("reset".to_string()))
            .await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_guard_records_outcome() {
        let breaker = CircuitBreaker::new("virustotal", config(2));
        let value = breaker.guard(async { Ok::<_, PhishError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        for _ in 0..2 {
            let _ = breaker
                .guard(async { Err::<(), _>(server_error()) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::new(
            "virustotal",
            CircuitBreakerConfig {
                enabled: false,
                failure_threshold: 1,
                reset_timeout_secs: 60,
            },
        );
        breaker.record_failure(&server_error()).await;
        assert!(breaker.check_request().await.is_ok());
    }
}
