//! Bounded-retry request execution with exponential backoff, jitter, rate-limit
//! awareness and size-scaled timeouts.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::client::CompletionClient;
use crate::error::{AttemptError, ClientError, ParseFailure, TransportFailure};
use crate::request::GenerationRequest;

/// Statuses treated as transient upstream failures.
pub const TRANSIENT_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Backoff shape shared by every call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Upper bound of the exponential part of the wait.
    pub cap: Duration,
    /// Upper bound applied to a server-supplied Retry-After hint.
    pub max_rate_limit_wait: Duration,
    /// Width of the uniform jitter added to every exponential wait.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            cap: Duration::from_secs(32),
            max_rate_limit_wait: Duration::from_secs(120),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Exponential part of the wait before attempt `attempt` (1-based, > 1):
    /// `min(cap, 2^(attempt-1))` seconds.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        Duration::from_secs(1u64 << exp).min(self.cap)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.0..1.0) * self.jitter.as_secs_f64();
        self.base_delay(attempt) + Duration::from_secs_f64(jitter)
    }
}

/// Request timeout that grows with the number of images or cards in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub per_unit: Duration,
    pub max: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(120),
            per_unit: Duration::from_secs(10),
            max: Duration::from_secs(600),
        }
    }
}

impl TimeoutPolicy {
    pub fn for_units(&self, units: usize) -> Duration {
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        (self.base + self.per_unit.saturating_mul(units)).min(self.max)
    }
}

/// Attempt budget for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// Abstraction over waiting, so backoff can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Executes requests with bounded retries. Never returns an unhandled fault:
/// the caller always gets either the parsed value or a [`TransportFailure`].
#[derive(Clone)]
pub struct RetryingTransport {
    client: Arc<dyn CompletionClient>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffPolicy,
}

impl RetryingTransport {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            client,
            sleeper: Arc::new(TokioSleeper),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the request until it returns 200 or the budget is spent.
    pub async fn execute(
        &self,
        request: &GenerationRequest,
        budget: AttemptBudget,
    ) -> Result<String, TransportFailure> {
        self.execute_with(request, budget, |text| Ok(text.to_string()))
            .await
    }

    /// Like [`execute`](Self::execute), but a [`ParseFailure`] from `parse` counts
    /// as a failed attempt and triggers another round trip.
    pub async fn execute_with<T, F>(
        &self,
        request: &GenerationRequest,
        budget: AttemptBudget,
        parse: F,
    ) -> Result<T, TransportFailure>
    where
        F: Fn(&str) -> Result<T, ParseFailure> + Send + Sync,
        T: Send,
    {
        let max_attempts = budget.max_attempts.max(1);
        let mut last_error: Option<AttemptError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let wait = self.wait_before(attempt, last_error.as_ref());
                info!(
                    mode = ?request.mode,
                    attempt,
                    max_attempts,
                    wait_secs = wait.as_secs_f64(),
                    "Retrying after backoff"
                );
                self.sleeper.sleep(wait).await;
            }

            let outcome = match self.attempt(request, budget.timeout).await {
                Ok(text) => parse(&text).map_err(AttemptError::from),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log_attempt_error(&e, attempt, max_attempts);
                    last_error = Some(e);
                }
            }
        }

        error!(mode = ?request.mode, max_attempts, "Failed after all attempts");
        Err(TransportFailure::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.map(Box::new),
        })
    }

    async fn attempt(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<String, AttemptError> {
        let response = tokio::time::timeout(timeout, self.client.complete(request, timeout))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("no response within {}s", timeout.as_secs()))
            })??;

        match response.status {
            200 => Ok(response.body),
            429 => Err(AttemptError::RateLimited {
                retry_after: response.retry_after,
            }),
            status if TRANSIENT_STATUSES.contains(&status) => {
                Err(AttemptError::Transient { status })
            }
            status => Err(AttemptError::Application {
                status,
                body: truncate(&response.body, 100),
            }),
        }
    }

    fn wait_before(&self, attempt: u32, last_error: Option<&AttemptError>) -> Duration {
        match last_error {
            Some(AttemptError::RateLimited {
                retry_after: Some(hint),
            }) => (*hint).min(self.backoff.max_rate_limit_wait),
            _ => self.backoff.delay_with_jitter(attempt),
        }
    }
}

fn log_attempt_error(e: &AttemptError, attempt: u32, max_attempts: u32) {
    match e {
        AttemptError::RateLimited { retry_after } => warn!(
            attempt,
            max_attempts,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Rate limited"
        ),
        AttemptError::Transient { status } => {
            warn!(attempt, max_attempts, status, "Transient upstream failure")
        }
        AttemptError::Application { status, body } => {
            error!(attempt, max_attempts, status, body = %body, "API error")
        }
        AttemptError::Client(ClientError::Timeout(msg)) => {
            warn!(attempt, max_attempts, detail = %truncate(msg, 50), "Request timeout")
        }
        AttemptError::Client(ClientError::Connection(msg)) => {
            warn!(attempt, max_attempts, detail = %truncate(msg, 50), "Connection error")
        }
        AttemptError::Client(other) => {
            warn!(attempt, max_attempts, detail = %truncate(&other.to_string(), 50), "Request error")
        }
        AttemptError::Parse(failure) => {
            warn!(attempt, max_attempts, error = %failure, "Unparseable response")
        }
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientResponse;
    use crate::request::RequestMode;
    use crate::testing::{MockClient, RecordingSleeper};

    fn request() -> GenerationRequest {
        GenerationRequest {
            mode: RequestMode::Generation,
            instruction: "go".into(),
            attachments: Vec::new(),
            max_completion_tokens: None,
        }
    }

    fn budget(max_attempts: u32) -> AttemptBudget {
        AttemptBudget {
            max_attempts,
            timeout: Duration::from_secs(5),
        }
    }

    fn transport(client: Arc<MockClient>, sleeper: Arc<RecordingSleeper>) -> RetryingTransport {
        RetryingTransport::new(client).with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn succeeds_after_r_failures_with_r_growing_sleeps() {
        let client = Arc::new(MockClient::scripted(vec![
            Ok(ClientResponse::status(503, "busy")),
            Err(ClientError::Connection("reset".into())),
            Ok(ClientResponse::status(418, "teapot")),
            Ok(ClientResponse::ok("done")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let out = transport(client.clone(), sleeper.clone())
            .execute(&request(), budget(5))
            .await
            .unwrap();

        assert_eq!(out, "done");
        assert_eq!(client.call_count(), 4);
        let sleeps = sleeper.sleeps();
        assert_eq!(sleeps.len(), 3);
        let policy = BackoffPolicy::default();
        for (i, wait) in sleeps.iter().enumerate() {
            let base = policy.base_delay(i as u32 + 2);
            assert!(*wait >= base && *wait < base + policy.jitter, "{wait:?} vs {base:?}");
        }
        let bases: Vec<_> = (2..=4).map(|k| policy.base_delay(k)).collect();
        assert!(bases.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn exhausts_when_failures_reach_the_budget() {
        let client = Arc::new(MockClient::scripted(vec![
            Ok(ClientResponse::status(500, "")),
            Ok(ClientResponse::status(500, "")),
            Ok(ClientResponse::status(500, "")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let err = transport(client.clone(), sleeper.clone())
            .execute(&request(), budget(3))
            .await
            .unwrap_err();

        let TransportFailure::RetriesExhausted {
            attempts,
            last_error,
        } = err;
        assert_eq!(attempts, 3);
        assert_eq!(
            last_error.as_deref(),
            Some(&AttemptError::Transient { status: 500 })
        );
        assert_eq!(client.call_count(), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_hint_replaces_backoff() {
        let mut limited = ClientResponse::status(429, "slow down");
        limited.retry_after = Some(Duration::from_secs(7));
        let client = Arc::new(MockClient::scripted(vec![
            Ok(limited),
            Ok(ClientResponse::ok("ok")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        transport(client, sleeper.clone())
            .execute(&request(), budget(3))
            .await
            .unwrap();

        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(7)]);
    }

    #[tokio::test]
    async fn rate_limit_hint_is_capped() {
        let mut limited = ClientResponse::status(429, "");
        limited.retry_after = Some(Duration::from_secs(3600));
        let client = Arc::new(MockClient::scripted(vec![
            Ok(limited),
            Ok(ClientResponse::ok("ok")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        transport(client, sleeper.clone())
            .execute(&request(), budget(2))
            .await
            .unwrap();

        assert_eq!(
            sleeper.sleeps(),
            vec![BackoffPolicy::default().max_rate_limit_wait]
        );
    }

    #[tokio::test]
    async fn parse_failures_consume_attempts() {
        let client = Arc::new(MockClient::scripted(vec![
            Ok(ClientResponse::ok("no json here")),
            Ok(ClientResponse::ok("[1, 2]")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let parsed = transport(client.clone(), sleeper.clone())
            .execute_with(&request(), budget(3), |text| {
                if text.starts_with('[') {
                    Ok(text.len())
                } else {
                    Err(ParseFailure::NoJson("array"))
                }
            })
            .await
            .unwrap();

        assert_eq!(parsed, 6);
        assert_eq!(client.call_count(), 2);
        assert_eq!(sleeper.sleeps().len(), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(12), policy.cap);
    }

    #[test]
    fn timeout_scales_with_units() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.for_units(0), Duration::from_secs(120));
        assert_eq!(policy.for_units(3), Duration::from_secs(150));
        assert_eq!(policy.for_units(1000), policy.max);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("short", 10), "short");
    }
}
