//! Drive a market study to a terminal state by repeated status reads.
//!
//! `watch` yields every successful observation as a lazy stream that ends
//! after the terminal record or the first fatal error. Transient failures
//! (no record, network or decode errors) are absorbed up to
//! `max_retries` consecutive occurrences and never surface individually.
//! `poll_until_completed` drives the same session with a progress callback.

use std::future::Future;
use std::time::Duration;

use futures::{stream, Stream};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::market_study::{MarketStudy, MarketStudyStatus};
use crate::services::api::{ApiError, MarketStudyApi};

/// Source of a currently valid access token, asked once per iteration.
pub trait TokenSupplier: Send + Sync {
    fn token(&self) -> impl Future<Output = Option<String>> + Send;
}

impl<F, Fut> TokenSupplier for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send,
{
    fn token(&self) -> impl Future<Output = Option<String>> + Send {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Wait between iterations.
    pub interval: Duration,
    /// Overall budget for the poll, measured from its start.
    pub timeout: Duration,
    /// Consecutive transient failures tolerated; reaching it is fatal.
    pub max_retries: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30 * 60),
            max_retries: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Market study polling timeout exceeded ({0:?})")]
    Timeout(Duration),

    #[error("Authentication failed - unable to get valid token")]
    Unauthenticated,

    #[error("Market study not found after {attempts} attempts")]
    NotFound { attempts: u32 },

    #[error("Failed to fetch market study after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: ApiError,
    },

    #[error("Polling cancelled")]
    Cancelled,
}

struct PollSession<'a, A, T> {
    api: &'a A,
    tokens: &'a T,
    study_id: Uuid,
    options: PollOptions,
    cancel: CancellationToken,
    deadline: Instant,
    consecutive_errors: u32,
    started: bool,
    finished: bool,
}

impl<'a, A, T> PollSession<'a, A, T>
where
    A: MarketStudyApi,
    T: TokenSupplier,
{
    fn new(api: &'a A, tokens: &'a T, study_id: Uuid, options: &PollOptions, cancel: CancellationToken) -> Self {
        Self {
            api,
            tokens,
            study_id,
            options: options.clone(),
            cancel,
            deadline: Instant::now() + options.timeout,
            consecutive_errors: 0,
            started: false,
            finished: false,
        }
    }

    /// Run `fut` unless cancelled or the deadline passes first.
    async fn guarded<F: Future>(&self, fut: F) -> Result<F::Output, PollError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PollError::Cancelled),
            out = timeout_at(self.deadline, fut) => out.map_err(|_| PollError::Timeout(self.options.timeout)),
        }
    }

    /// Sleep one interval, never past the deadline.
    async fn wait(&self) -> Result<(), PollError> {
        let until = (Instant::now() + self.options.interval).min(self.deadline);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PollError::Cancelled),
            _ = sleep_until(until) => Ok(()),
        }
    }

    async fn next_observation(&mut self) -> Result<MarketStudy, PollError> {
        loop {
            if self.started {
                self.wait().await?;
            }
            self.started = true;

            if Instant::now() >= self.deadline {
                return Err(PollError::Timeout(self.options.timeout));
            }

            let Some(token) = self.guarded(self.tokens.token()).await? else {
                return Err(PollError::Unauthenticated);
            };

            metrics::counter!("poll_iterations_total").increment(1);
            let fetched = self
                .guarded(self.api.get_market_study(self.study_id, &token))
                .await?;

            let failure = match fetched {
                Ok(Some(study)) => {
                    self.consecutive_errors = 0;
                    return Ok(study);
                }
                Ok(None) => None,
                Err(e) => Some(e),
            };

            self.consecutive_errors += 1;
            metrics::counter!("poll_transient_errors_total").increment(1);
            tracing::warn!(
                study_id = %self.study_id,
                attempt = self.consecutive_errors,
                max_retries = self.options.max_retries,
                error = failure.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "no record".to_string()),
                "Failed to fetch market study"
            );

            if self.consecutive_errors >= self.options.max_retries {
                let attempts = self.consecutive_errors;
                return Err(match failure {
                    Some(last_error) => PollError::Exhausted { attempts, last_error },
                    None => PollError::NotFound { attempts },
                });
            }
        }
    }
}

/// Stream of status observations for one market study.
///
/// Nothing happens until the stream is polled. The token supplier is asked
/// for a token on every iteration. Each item is a successfully fetched
/// record; the stream ends after yielding a terminal record or an error.
pub fn watch<'a, A, T>(
    api: &'a A,
    study_id: Uuid,
    tokens: &'a T,
    options: &PollOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<MarketStudy, PollError>> + Send + 'a
where
    A: MarketStudyApi + 'a,
    T: TokenSupplier + 'a,
{
    let session = PollSession::new(api, tokens, study_id, options, cancel);

    stream::unfold(session, |mut session| async move {
        if session.finished {
            return None;
        }
        let item = session.next_observation().await;
        session.finished = match &item {
            Ok(study) => study.is_terminal(),
            Err(_) => true,
        };
        Some((item, session))
    })
}

/// Poll until the study reaches `completed` or `failed`.
///
/// `on_progress` sees every successful fetch, repeated `in_progress`
/// observations and the terminal record included.
pub async fn poll_until_completed<A, T, F>(
    api: &A,
    study_id: Uuid,
    tokens: &T,
    options: &PollOptions,
    mut on_progress: F,
    cancel: CancellationToken,
) -> Result<MarketStudy, PollError>
where
    A: MarketStudyApi,
    T: TokenSupplier,
    F: FnMut(MarketStudyStatus, &MarketStudy),
{
    tracing::debug!(
        study_id = %study_id,
        interval_ms = options.interval.as_millis() as u64,
        max_retries = options.max_retries,
        "Polling market study"
    );

    let mut session = PollSession::new(api, tokens, study_id, options, cancel);
    loop {
        let study = session.next_observation().await?;
        on_progress(study.status, &study);
        if study.is_terminal() {
            return Ok(study);
        }
    }
}
