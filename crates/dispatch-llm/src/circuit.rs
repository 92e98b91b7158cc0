//! Per-provider circuit breaker over a sliding window of outcomes.
//!
//! The window is split into fixed-width buckets of atomic counters. Each
//! counter carries the epoch it counts for, so a bucket reused for a new
//! epoch starts from zero without a separate reset and recording an outcome
//! never takes a lock. The circuit opens once the window holds at least
//! `min_requests` outcomes and the failure rate reaches the threshold. After
//! `cooldown_ms` a single trial call is let through (half-open); its outcome
//! closes or re-opens the circuit. A trial that never reports back is
//! replaced after another cooldown.

use crate::ProviderId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure fraction that opens the circuit, 0.0 to 1.0
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is trusted
    pub min_requests: u32,
    pub window_ms: u64,
    pub buckets: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_requests: 5,
            window_ms: 60_000,
            buckets: 6,
            cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one provider's circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider: ProviderId,
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
    pub failure_rate: f64,
    pub cooldown_remaining: Option<Duration>,
}

/// Outcome count tagged with its bucket epoch: epoch in the high 32 bits,
/// count in the low 32. A count from an older epoch reads as zero.
#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn increment(&self, epoch: u32) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
            let count = if (packed >> 32) as u32 == epoch {
                (packed as u32).saturating_add(1)
            } else {
                1
            };
            Some(((epoch as u64) << 32) | count as u64)
        });
    }

    /// Count if it belongs to one of the `span` epochs ending at `current`
    fn load(&self, current: u32, span: u32) -> u32 {
        let packed = self.0.load(Ordering::Acquire);
        if current.wrapping_sub((packed >> 32) as u32) < span {
            packed as u32
        } else {
            0
        }
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[derive(Default)]
struct Bucket {
    successes: Counter,
    failures: Counter,
}

struct Circuit {
    buckets: Vec<Bucket>,
    /// Millis since breaker start, plus one; zero means closed
    opened_at: AtomicU64,
    /// Start of the in-flight half-open trial, same encoding; zero means none
    trial_started: AtomicU64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    bucket_ms: u64,
    started: Instant,
    circuits: Vec<Circuit>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let buckets = config.buckets.max(1);
        let bucket_ms = (config.window_ms / buckets as u64).max(1);
        let circuits = ProviderId::ALL
            .iter()
            .map(|_| Circuit {
                buckets: (0..buckets).map(|_| Bucket::default()).collect(),
                opened_at: AtomicU64::new(0),
                trial_started: AtomicU64::new(0),
            })
            .collect();

        Self {
            config,
            bucket_ms,
            started: Instant::now(),
            circuits,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn circuit(&self, provider: ProviderId) -> &Circuit {
        &self.circuits[provider.index()]
    }

    /// Whether a call to `provider` may be attempted now. In half-open state
    /// only the caller that wins the trial slot is let through; it must then
    /// record an outcome or call [`CircuitBreaker::release_trial`].
    pub fn allows(&self, provider: ProviderId) -> bool {
        match self.state(provider) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let trial = &self.circuit(provider).trial_started;
                let now = self.now_ms();
                let started = trial.load(Ordering::Acquire);
                let stale = started != 0 && now + 1 >= started + self.config.cooldown_ms.max(1);
                (started == 0 || stale)
                    && trial
                        .compare_exchange(started, now + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            }
        }
    }

    /// Give up the trial slot without judging the provider, e.g. after a
    /// rejection caused by the request itself
    pub fn release_trial(&self, provider: ProviderId) {
        self.circuit(provider).trial_started.store(0, Ordering::Release);
    }

    pub fn state(&self, provider: ProviderId) -> CircuitState {
        let opened_at = self.circuit(provider).opened_at.load(Ordering::Acquire);
        if opened_at == 0 {
            CircuitState::Closed
        } else if self.now_ms() + 1 >= opened_at + self.config.cooldown_ms {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn record_success(&self, provider: ProviderId) {
        let circuit = self.circuit(provider);
        if self.state(provider) == CircuitState::HalfOpen {
            tracing::info!(provider = %provider, "Circuit closed after successful trial");
            self.reset(circuit);
            circuit.opened_at.store(0, Ordering::Release);
            circuit.trial_started.store(0, Ordering::Release);
            return;
        }
        let (bucket, epoch) = self.bucket(circuit);
        bucket.successes.increment(epoch);
    }

    pub fn record_failure(&self, provider: ProviderId) {
        let circuit = self.circuit(provider);
        let now = self.now_ms();

        match self.state(provider) {
            CircuitState::HalfOpen => {
                tracing::warn!(provider = %provider, "Trial failed, circuit re-opened");
                circuit.opened_at.store(now + 1, Ordering::Release);
                circuit.trial_started.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let (bucket, epoch) = self.bucket(circuit);
                bucket.failures.increment(epoch);
                let (requests, failures) = self.totals(circuit);
                if requests >= self.config.min_requests
                    && failures as f64 / requests as f64 >= self.config.failure_rate_threshold
                {
                    tracing::warn!(
                        provider = %provider,
                        requests = requests,
                        failures = failures,
                        "Circuit opened"
                    );
                    circuit.opened_at.store(now + 1, Ordering::Release);
                }
            }
        }
    }

    /// Bucket for the current instant and the epoch to count it under
    fn bucket<'a>(&self, circuit: &'a Circuit) -> (&'a Bucket, u32) {
        let epoch = self.now_ms() / self.bucket_ms;
        let bucket = &circuit.buckets[(epoch % circuit.buckets.len() as u64) as usize];
        (bucket, epoch as u32)
    }

    fn totals(&self, circuit: &Circuit) -> (u32, u32) {
        let current = (self.now_ms() / self.bucket_ms) as u32;
        let span = circuit.buckets.len() as u32;
        circuit.buckets.iter().fold((0, 0), |(requests, failures), b| {
            let s = b.successes.load(current, span);
            let f = b.failures.load(current, span);
            (requests + s + f, failures + f)
        })
    }

    fn reset(&self, circuit: &Circuit) {
        for bucket in &circuit.buckets {
            bucket.successes.clear();
            bucket.failures.clear();
        }
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        let now = self.now_ms();
        ProviderId::ALL
            .into_iter()
            .map(|provider| {
                let circuit = self.circuit(provider);
                let (requests, failures) = self.totals(circuit);
                let state = self.state(provider);
                let cooldown_remaining = match state {
                    CircuitState::Open => {
                        let reopen = circuit.opened_at.load(Ordering::Acquire) + self.config.cooldown_ms;
                        Some(Duration::from_millis(reopen.saturating_sub(now + 1)))
                    }
                    _ => None,
                };
                ProviderStatus {
                    provider,
                    state,
                    requests,
                    failures,
                    failure_rate: if requests == 0 {
                        0.0
                    } else {
                        failures as f64 / requests as f64
                    },
                    cooldown_remaining,
                }
            })
            .collect()
    }
}
