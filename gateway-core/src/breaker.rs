//! Per-endpoint circuit breaker
//!
//! One breaker instance owns a state table keyed by `METHOD:url`. A circuit
//! opens once its consecutive failures exceed the threshold, rejects calls
//! until the cooldown elapses, then lets exactly one probe through. The probe
//! closes the circuit on success and re-opens it on failure.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    #[serde(rename = "HALF")]
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF"),
        }
    }
}

/// Breaker key: upper-cased method and full URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(method: &str, url: &str) -> Self {
        Self(format!("{}:{}", method.to_ascii_uppercase(), url))
    }

    pub fn post(url: &str) -> Self {
        Self::new("POST", url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Circuit opens when failures exceed this count
    pub failure_threshold: u32,
    pub cool_down: Duration,
    /// Hard deadline for one `fire`
    pub request_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a guarded call produced no value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    #[error("circuit open for {0}")]
    CircuitOpen(EndpointKey),

    #[error("request to {0} timed out")]
    Timeout(EndpointKey),

    #[error("request to {endpoint} failed: {reason}")]
    Failed { endpoint: EndpointKey, reason: String },
}

#[derive(Debug, Clone)]
struct EndpointCircuit {
    state: CircuitState,
    failures: u32,
    next_try: DateTime<Utc>,
}

impl EndpointCircuit {
    fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            next_try: now,
        }
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: EndpointKey,
    pub state: CircuitState,
    pub failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<EndpointKey, EndpointCircuit>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admission check; may move an expired OPEN circuit to HALF
    pub fn on_request(&self, endpoint: &EndpointKey) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(endpoint.clone())
            .or_insert_with(|| EndpointCircuit::closed(now));

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open if circuit.next_try <= now => {
                info!(breaker = %self.name, endpoint = %endpoint, "Circuit half-open, sending probe");
                circuit.state = CircuitState::HalfOpen;
                // A probe that never reports back must not wedge the circuit
                circuit.next_try = now + to_chrono(self.config.request_timeout);
                true
            }
            CircuitState::HalfOpen if circuit.next_try <= now => {
                warn!(breaker = %self.name, endpoint = %endpoint, "Stale probe, admitting another");
                circuit.next_try = now + to_chrono(self.config.request_timeout);
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => false,
        }
    }

    pub fn on_success(&self, endpoint: &EndpointKey) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let previous = circuits.insert(endpoint.clone(), EndpointCircuit::closed(now));
        if let Some(prev) = previous {
            if prev.state != CircuitState::Closed {
                info!(breaker = %self.name, endpoint = %endpoint, "Circuit closed");
            }
        }
    }

    pub fn on_failure(&self, endpoint: &EndpointKey) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(endpoint.clone())
            .or_insert_with(|| EndpointCircuit::closed(now));

        circuit.failures = circuit.failures.saturating_add(1);
        if circuit.state == CircuitState::HalfOpen || circuit.failures > self.config.failure_threshold {
            circuit.state = CircuitState::Open;
            circuit.next_try = now + to_chrono(self.config.cool_down);
            warn!(
                breaker = %self.name,
                endpoint = %endpoint,
                failures = circuit.failures,
                "Circuit OPEN until {}",
                circuit.next_try
            );
        } else {
            debug!(breaker = %self.name, endpoint = %endpoint, failures = circuit.failures, "Recorded failure");
        }
    }

    pub fn state(&self, endpoint: &EndpointKey) -> CircuitState {
        self.circuits
            .lock()
            .get(endpoint)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        self.circuits
            .lock()
            .iter()
            .map(|(endpoint, c)| CircuitSnapshot {
                endpoint: endpoint.clone(),
                state: c.state,
                failures: c.failures,
            })
            .collect()
    }

    /// Run `call` if the circuit admits it, under the request timeout.
    ///
    /// Errors and timeouts count as failures. Never panics on downstream
    /// trouble; the caller gets an [`Unavailable`] instead.
    pub async fn fire<T, E, F, Fut>(&self, endpoint: &EndpointKey, call: F) -> Result<T, Unavailable>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.on_request(endpoint) {
            return Err(Unavailable::CircuitOpen(endpoint.clone()));
        }

        match tokio::time::timeout(self.config.request_timeout, call()).await {
            Ok(Ok(value)) => {
                self.on_success(endpoint);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(endpoint);
                Err(Unavailable::Failed {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.on_failure(endpoint);
                Err(Unavailable::Timeout(endpoint.clone()))
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
