use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    clients::store::SharedStore,
    error::CircuitBreakerError,
    models::{
        circuit_breaker::{BreakerConfig, BreakerKey, BreakerRecord, BreakerSnapshot, CircuitState},
        notification::Channel,
        vendor::Vendor,
    },
};

const MAX_CAS_ATTEMPTS: usize = 16;
const NO_TRIAL: i64 = i64::MIN;

/// Hands out breaker handles over one shared store.
#[derive(Clone)]
pub struct BreakerRegistry {
    store: Arc<dyn SharedStore>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(store: Arc<dyn SharedStore>, config: BreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker registry initialized"
        );

        Self { store, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn breaker(&self, key: BreakerKey) -> CircuitBreaker {
        CircuitBreaker::new(key, Arc::clone(&self.store), self.config.clone())
    }

    pub fn for_vendor(&self, vendor: Vendor, channel: Channel, tenant: &str) -> CircuitBreaker {
        self.breaker(BreakerKey::new(vendor.as_str(), channel.as_str(), tenant))
    }
}

enum Transition {
    None,
    Opened,
    Reopened,
    Closed,
}

/// Handle on one `(vendor, channel, tenant)` breaker. State lives in the shared
/// store; every mutation is a compare-and-swap on the serialized record, so
/// concurrent workers never lose an update and only one of them can claim the
/// half-open trial.
///
/// The handle remembers the trial it claimed, so the caller that won the trial
/// keeps seeing `is_available() == true` until it reports an outcome.
pub struct CircuitBreaker {
    key: BreakerKey,
    storage_key: String,
    store: Arc<dyn SharedStore>,
    config: BreakerConfig,
    claimed_trial: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(key: BreakerKey, store: Arc<dyn SharedStore>, config: BreakerConfig) -> Self {
        Self {
            storage_key: key.storage_key(),
            key,
            store,
            config,
            claimed_trial: AtomicI64::new(NO_TRIAL),
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    pub fn holds_trial(&self) -> bool {
        self.claimed_trial.load(Ordering::Acquire) != NO_TRIAL
    }

    pub async fn get_state(&self) -> Result<BreakerSnapshot, Error> {
        let (_, record) = self.load().await?;
        Ok(BreakerSnapshot::from(&record))
    }

    pub async fn is_available(&self) -> Result<bool, Error> {
        let cooldown_ms = self.config.cooldown.as_millis() as i64;
        let claimed = self.claimed_trial.load(Ordering::Acquire);

        let (available, trial) = self
            .update(|record, now| match record.state {
                CircuitState::Closed => (None, (true, None)),
                CircuitState::Open => {
                    let opened_at = record.opened_at.unwrap_or(0);
                    if now - opened_at >= cooldown_ms {
                        (Some(Self::claim_trial(record, now)), (true, Some(now)))
                    } else {
                        (None, (false, None))
                    }
                }
                CircuitState::HalfOpen => {
                    let started = record.trial_started_at.unwrap_or(0);
                    if claimed != NO_TRIAL && record.trial_started_at == Some(claimed) {
                        (None, (true, None))
                    } else if now - started >= cooldown_ms {
                        // The previous trial holder never reported back.
                        (Some(Self::claim_trial(record, now)), (true, Some(now)))
                    } else {
                        (None, (false, None))
                    }
                }
            })
            .await?;

        if let Some(started) = trial {
            self.claimed_trial.store(started, Ordering::Release);
            info!(breaker = %self.key.component(), "Circuit breaker half-open, admitting trial call");
        }

        Ok(available)
    }

    pub async fn record_success(&self) -> Result<(), Error> {
        let transition = self
            .update(|record, _| match record.state {
                CircuitState::HalfOpen => (
                    Some(BreakerRecord::default()),
                    Transition::Closed,
                ),
                CircuitState::Closed | CircuitState::Open if record.consecutive_failures > 0 => (
                    Some(BreakerRecord {
                        consecutive_failures: 0,
                        ..record.clone()
                    }),
                    Transition::None,
                ),
                _ => (None, Transition::None),
            })
            .await?;

        self.claimed_trial.store(NO_TRIAL, Ordering::Release);
        self.log_transition(transition, 0);
        Ok(())
    }

    pub async fn record_failure(&self) -> Result<(), Error> {
        let threshold = self.config.failure_threshold;

        let (transition, failures) = self
            .update(|record, now| {
                let failures = record.consecutive_failures.saturating_add(1);
                let mut next = BreakerRecord {
                    consecutive_failures: failures,
                    last_failure_at: Some(now),
                    ..record.clone()
                };

                let transition = match record.state {
                    CircuitState::Closed if failures >= threshold => {
                        next.state = CircuitState::Open;
                        next.opened_at = Some(now);
                        Transition::Opened
                    }
                    CircuitState::HalfOpen => {
                        next.state = CircuitState::Open;
                        next.opened_at = Some(now);
                        next.trial_started_at = None;
                        Transition::Reopened
                    }
                    _ => Transition::None,
                };

                (Some(next), (transition, failures))
            })
            .await?;

        self.claimed_trial.store(NO_TRIAL, Ordering::Release);

        debug!(
            breaker = %self.key.component(),
            failures,
            threshold,
            "Circuit breaker failure recorded"
        );
        self.log_transition(transition, failures);
        Ok(())
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self
            .is_available()
            .await
            .map_err(CircuitBreakerError::Store)?
        {
            warn!(breaker = %self.key.component(), "Circuit breaker is open, rejecting call");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.key.component(),
            });
        }

        match operation().await {
            Ok(result) => {
                self.record_success()
                    .await
                    .map_err(CircuitBreakerError::Store)?;
                Ok(result)
            }
            Err(e) => {
                self.record_failure()
                    .await
                    .map_err(CircuitBreakerError::Store)?;
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn claim_trial(record: &BreakerRecord, now: i64) -> BreakerRecord {
        BreakerRecord {
            state: CircuitState::HalfOpen,
            trial_started_at: Some(now),
            ..record.clone()
        }
    }

    async fn load(&self) -> Result<(Option<String>, BreakerRecord), Error> {
        let raw = self.store.get(&self.storage_key).await?;
        let record = match raw.as_deref() {
            Some(value) => serde_json::from_str(value).map_err(|e| {
                anyhow!("Corrupt circuit breaker state at {}: {}", self.storage_key, e)
            })?,
            None => BreakerRecord::default(),
        };
        Ok((raw, record))
    }

    /// Read-decide-swap loop. `decide` returns the record to write (if any)
    /// and the value to hand back once the write has landed.
    async fn update<R, F>(&self, decide: F) -> Result<R, Error>
    where
        F: Fn(&BreakerRecord, i64) -> (Option<BreakerRecord>, R),
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = self.load().await?;
            let now = Utc::now().timestamp_millis();

            let (next, result) = decide(&record, now);
            let Some(next) = next.filter(|n| *n != record) else {
                return Ok(result);
            };

            let encoded = serde_json::to_string(&next)?;
            if self
                .store
                .compare_and_swap(&self.storage_key, raw.as_deref(), &encoded)
                .await?
            {
                return Ok(result);
            }

            debug!(breaker = %self.key.component(), "Circuit breaker update raced, retrying");
        }

        Err(anyhow!(
            "Circuit breaker {} is under too much contention",
            self.key.component()
        ))
    }

    fn log_transition(&self, transition: Transition, failures: u32) {
        match transition {
            Transition::Opened => warn!(
                breaker = %self.key.component(),
                failures,
                "Circuit breaker opened due to consecutive failures"
            ),
            Transition::Reopened => warn!(
                breaker = %self.key.component(),
                "Circuit breaker reopened after failed trial call"
            ),
            Transition::Closed => info!(
                breaker = %self.key.component(),
                "Circuit breaker closed after successful trial call"
            ),
            Transition::None => {}
        }
    }
}
