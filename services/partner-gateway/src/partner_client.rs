//! Outbound partner calls: retry inside one circuit-breaker admission

use crate::metrics;
use crate::models::EncryptedPayload;
use gateway_core::{CircuitBreaker, EndpointKey, Unavailable};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Linear backoff: retry n waits `n * base_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

/// Why a single attempt failed
#[derive(Debug)]
pub enum AttemptError {
    Transport(reqwest::Error),
    Status(StatusCode),
}

impl AttemptError {
    /// Network errors, timeouts and 5xx are worth another try; 4xx are not
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(_) => true,
            AttemptError::Status(status) => status.is_server_error(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transport(e) if e.is_timeout() => write!(f, "timeout: {e}"),
            AttemptError::Transport(e) => write!(f, "transport: {e}"),
            AttemptError::Status(status) => write!(f, "HTTP {status}"),
        }
    }
}

/// Raw downstream answer
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    /// Envelope from the body.
    ///
    /// Some ticketing systems answer with a bare JSON string or plain text
    /// instead of `{ "data": ... }`; both are accepted.
    pub fn envelope(&self) -> EncryptedPayload {
        if let Ok(payload) = serde_json::from_str::<EncryptedPayload>(&self.body) {
            if payload.data.is_some() {
                return payload;
            }
        }
        if let Ok(Value::String(data)) = serde_json::from_str::<Value>(&self.body) {
            return EncryptedPayload::new(strip_control(&data));
        }
        let text = strip_control(self.body.trim().trim_matches('"'));
        if text.is_empty() {
            EncryptedPayload::default()
        } else {
            EncryptedPayload::new(text)
        }
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

fn strip_control(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

/// HTTP client for every downstream partner, one breaker per client
#[derive(Debug, Clone)]
pub struct PartnerClient {
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl PartnerClient {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            breaker,
            retry,
            attempt_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// POST `{ "data": ciphertext }` and return the downstream envelope
    pub async fn post_envelope(&self, url: &str, ciphertext: &str) -> Result<EncryptedPayload, Unavailable> {
        let body = EncryptedPayload::new(ciphertext);
        let reply = self
            .execute(url, |http| http.post(url).json(&body), |_| false)
            .await?;
        Ok(reply.envelope())
    }

    /// POST a form body, e.g. an OAuth token request
    pub async fn post_form<T: Serialize + ?Sized>(&self, url: &str, form: &T) -> Result<Reply, Unavailable> {
        self.execute(url, |http| http.post(url).form(form), |_| false).await
    }

    /// POST JSON with a bearer token; a 404 is an answer, not a failure
    pub async fn post_json_bearer<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        token: &str,
    ) -> Result<Reply, Unavailable> {
        self.execute(
            url,
            |http| http.post(url).bearer_auth(token).json(body),
            |status| status == StatusCode::NOT_FOUND,
        )
        .await
    }

    async fn execute<B, A>(&self, url: &str, build: B, accept: A) -> Result<Reply, Unavailable>
    where
        B: Fn(&reqwest::Client) -> RequestBuilder,
        A: Fn(StatusCode) -> bool,
    {
        let endpoint = EndpointKey::post(url);
        let timer = metrics::DOWNSTREAM_LATENCY
            .with_label_values(&[self.breaker.name()])
            .start_timer();

        let result = self
            .breaker
            .fire(&endpoint, || self.with_retry(url, &build, &accept))
            .await;

        timer.observe_duration();
        metrics::record_breaker_state(&self.breaker, &endpoint);
        let outcome = match &result {
            Ok(_) => "success",
            Err(Unavailable::CircuitOpen(_)) => "circuit_open",
            Err(Unavailable::Timeout(_)) => "timeout",
            Err(Unavailable::Failed { .. }) => "failed",
        };
        metrics::DOWNSTREAM_CALLS
            .with_label_values(&[self.breaker.name(), outcome])
            .inc();

        if let Err(e) = &result {
            warn!(breaker = %self.breaker.name(), error = %e, "Downstream call unavailable");
        }
        result
    }

    async fn with_retry<B, A>(&self, url: &str, build: &B, accept: &A) -> Result<Reply, AttemptError>
    where
        B: Fn(&reqwest::Client) -> RequestBuilder,
        A: Fn(StatusCode) -> bool,
    {
        let mut retry = 0;
        loop {
            match self.attempt(build, accept).await {
                Ok(reply) => {
                    if retry > 0 {
                        info!(url, retry, "Downstream call succeeded after retry");
                    }
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() && retry < self.retry.max_retries => {
                    retry += 1;
                    let delay = self.retry.delay_for(retry);
                    warn!(url, retry, max_retries = self.retry.max_retries, error = %e, "Retrying downstream call after {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<B, A>(&self, build: &B, accept: &A) -> Result<Reply, AttemptError>
    where
        B: Fn(&reqwest::Client) -> RequestBuilder,
        A: Fn(StatusCode) -> bool,
    {
        let response = build(&self.http)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(AttemptError::Transport)?;

        let status = response.status();
        if !status.is_success() && !accept(status) {
            return Err(AttemptError::Status(status));
        }

        let body = response.text().await.map_err(AttemptError::Transport)?;
        Ok(Reply {
            status: status.as_u16(),
            body,
        })
    }
}
