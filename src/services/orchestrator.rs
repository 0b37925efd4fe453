//! Analyze / retry / generate-metadata handlers.
//!
//! Each operation marks the study `in_progress` locally before any network
//! call, claims the study's poll slot, triggers the pipeline step and polls
//! until a terminal state. When polling itself gives up, one direct read
//! decides the final local state; if that read fails too the study stays
//! `in_progress` rather than being reported as failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::market_study::{MarketStudy, MarketStudyStatus, PipelineStep, RunTaskResponse};
use crate::services::api::{ApiError, MarketStudyApi};
use crate::services::board::StudyBoard;
use crate::services::notify::{Notice, Notifier};
use crate::services::poller::{poll_until_completed, PollError, PollOptions, TokenSupplier};
use crate::services::registry::{ActiveJobRegistry, PollSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Analyze,
    Retry,
    GenerateMetadata,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Analyze => "Keyword analysis",
            Operation::Retry => "Retry analysis",
            Operation::GenerateMetadata => "Metadata generation",
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Operation::Analyze => "analyze",
            Operation::Retry => "retry",
            Operation::GenerateMetadata => "generate_metadata",
        }
    }
}

/// How an operation ended, from the UI's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Polling reached `completed`.
    Completed(MarketStudy),
    /// Polling reached `failed`; the record carries the server's message.
    Failed(MarketStudy),
    /// Polling errored out but a direct read returned this record.
    Verified(MarketStudy),
    /// Polling and the direct read both failed; the study is left as it was.
    Unverified { reason: String },
    Cancelled,
    /// Another poll already owns this study.
    AlreadyPolling,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Verified(_) => "verified",
            Outcome::Unverified { .. } => "unverified",
            Outcome::Cancelled => "cancelled",
            Outcome::AlreadyPolling => "already_polling",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll: PollOptions,
    /// Pause between triggering a retry and the first status read.
    pub retry_settle: Duration,
    /// Page size used when loading a project's studies.
    pub page_size: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll: PollOptions {
                interval: Duration::from_secs(5),
                max_retries: 10,
                ..PollOptions::default()
            },
            retry_settle: Duration::from_secs(1),
            page_size: 100,
        }
    }
}

pub struct PipelineOrchestrator<A, T> {
    api: Arc<A>,
    tokens: Arc<T>,
    board: Arc<StudyBoard>,
    registry: Arc<ActiveJobRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: OrchestratorSettings,
}

impl<A, T> PipelineOrchestrator<A, T>
where
    A: MarketStudyApi + 'static,
    T: TokenSupplier + 'static,
{
    pub fn new(
        api: Arc<A>,
        tokens: Arc<T>,
        board: Arc<StudyBoard>,
        registry: Arc<ActiveJobRegistry>,
        notifier: Arc<dyn Notifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            api,
            tokens,
            board,
            registry,
            notifier,
            settings,
        }
    }

    pub fn board(&self) -> &Arc<StudyBoard> {
        &self.board
    }

    pub fn registry(&self) -> &Arc<ActiveJobRegistry> {
        &self.registry
    }

    /// Fetch app metadata, then keywords, then classify them.
    pub async fn analyze(&self, study_id: Uuid) -> Result<Outcome, OrchestratorError> {
        self.run(study_id, Operation::Analyze).await
    }

    /// Resume a failed study from its recorded `failed_step`.
    pub async fn retry(&self, study_id: Uuid) -> Result<Outcome, OrchestratorError> {
        self.run(study_id, Operation::Retry).await
    }

    pub async fn generate_metadata(&self, study_id: Uuid) -> Result<Outcome, OrchestratorError> {
        self.run(study_id, Operation::GenerateMetadata).await
    }

    /// Stop the poll for one study, if any. The study keeps its last state.
    pub fn cancel(&self, study_id: Uuid) -> bool {
        self.registry.cancel(study_id)
    }

    pub fn shutdown(&self) {
        self.registry.cancel_all();
    }

    async fn run(&self, study_id: Uuid, operation: Operation) -> Result<Outcome, OrchestratorError> {
        let current = self
            .board
            .get(study_id)
            .ok_or(OrchestratorError::UnknownStudy(study_id))?;

        let step = match operation {
            Operation::Analyze => PipelineStep::FetchAppMetadata,
            Operation::GenerateMetadata => PipelineStep::GenerateMetadata,
            Operation::Retry => current
                .failed_step
                .ok_or(OrchestratorError::Refused { study_id })?,
        };

        tracing::info!(study_id = %study_id, operation = operation.as_str(), step = %step, "Starting operation");

        // Claim before touching the board; the running poll owns the record
        let Some(slot) = self.registry.try_claim(study_id) else {
            tracing::info!(study_id = %study_id, "Market study is already being polled");
            return Ok(Outcome::AlreadyPolling);
        };

        let previous = self
            .board
            .update(study_id, |s| {
                s.status = MarketStudyStatus::InProgress;
                if operation == Operation::Retry {
                    s.error_message = None;
                    s.failed_step = None;
                }
            })
            .unwrap_or(current);

        if let Err(e) = self.start(study_id, step).await {
            tracing::error!(study_id = %study_id, error = %e, "Failed to start pipeline step, reverting");
            self.board.apply(&previous);
            return Err(e);
        }

        if operation == Operation::Retry && !self.settings.retry_settle.is_zero() {
            let cancel = slot.cancellation();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                _ = tokio::time::sleep(self.settings.retry_settle) => {}
            }
        }

        Ok(self.track(slot, operation).await)
    }

    async fn start(&self, study_id: Uuid, step: PipelineStep) -> Result<RunTaskResponse, OrchestratorError> {
        let token = self
            .tokens
            .token()
            .await
            .ok_or(OrchestratorError::Unauthenticated)?;

        let response = self
            .api
            .run_background_task(study_id, step, &token)
            .await
            .map_err(|source| OrchestratorError::StartFailed {
                study_id,
                step,
                source,
            })?;

        tracing::debug!(study_id = %study_id, message = %response.message, "Pipeline step accepted");
        Ok(response)
    }

    /// Poll a claimed study to the end and reconcile the board. The slot is
    /// released when this returns, whatever the path.
    async fn track(&self, slot: PollSlot, operation: Operation) -> Outcome {
        let study_id = slot.study_id();
        let board = &self.board;

        let result = poll_until_completed(
            &*self.api,
            study_id,
            &*self.tokens,
            &self.settings.poll,
            |status, study| {
                tracing::debug!(study_id = %study_id, status = %status, "Market study progress");
                board.apply(study);
            },
            slot.cancellation(),
        )
        .await;

        let outcome = match result {
            Ok(study) => {
                self.board.apply(&study);
                self.notifier.notify(Notice::OperationFinished {
                    study_id,
                    operation,
                    status: study.status,
                    error_message: study.error_message.clone(),
                });
                if study.status == MarketStudyStatus::Failed {
                    Outcome::Failed(study)
                } else {
                    Outcome::Completed(study)
                }
            }
            Err(PollError::Cancelled) => {
                tracing::info!(study_id = %study_id, "Polling cancelled");
                Outcome::Cancelled
            }
            Err(e) => {
                tracing::error!(study_id = %study_id, error = %e, "Polling failed, verifying actual status");
                self.verify(study_id, e).await
            }
        };

        metrics::counter!(
            "poll_outcomes_total",
            "operation" => operation.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);
        tracing::info!(study_id = %study_id, outcome = outcome.label(), "Finished polling market study");

        drop(slot);
        outcome
    }

    /// One authoritative read after polling gave up. A successful read is
    /// trusted whatever its status.
    async fn verify(&self, study_id: Uuid, poll_error: PollError) -> Outcome {
        let read = match self.tokens.token().await {
            Some(token) => self.api.get_market_study(study_id, &token).await,
            None => Ok(None),
        };

        match read {
            Ok(Some(study)) => {
                tracing::info!(study_id = %study_id, status = %study.status, "Verified actual status");
                self.board.apply(&study);
                Outcome::Verified(study)
            }
            Ok(None) => self.unverified(study_id, poll_error, "no record returned"),
            Err(e) => self.unverified(study_id, poll_error, &e.to_string()),
        }
    }

    fn unverified(&self, study_id: Uuid, poll_error: PollError, read_error: &str) -> Outcome {
        tracing::warn!(
            study_id = %study_id,
            error = %read_error,
            "Could not verify status - keeping as in_progress"
        );
        self.notifier.notify(Notice::ReloadToCheckStatus { study_id });
        Outcome::Unverified {
            reason: poll_error.to_string(),
        }
    }

    /// Load a project's studies onto the board and resume polling every
    /// `in_progress` study that is not already polled.
    pub async fn resume_in_progress(
        self: &Arc<Self>,
        project_id: Uuid,
    ) -> Result<Vec<(Uuid, JoinHandle<Outcome>)>, OrchestratorError> {
        let token = self
            .tokens
            .token()
            .await
            .ok_or(OrchestratorError::Unauthenticated)?;

        let page = self
            .api
            .list_project_market_studies(project_id, 1, self.settings.page_size, &token)
            .await
            .map_err(OrchestratorError::Api)?;

        tracing::info!(project_id = %project_id, count = page.items.len(), "Loaded market studies");

        let in_progress: Vec<Uuid> = page
            .items
            .iter()
            .filter(|s| s.status == MarketStudyStatus::InProgress)
            .map(|s| s.id)
            .collect();
        self.board.replace_all(page.items);

        let mut handles = Vec::new();
        for study_id in in_progress {
            let Some(slot) = self.registry.try_claim(study_id) else {
                continue;
            };
            let this = Arc::clone(self);
            handles.push((
                study_id,
                tokio::spawn(async move { this.track(slot, Operation::Analyze).await }),
            ));
        }

        Ok(handles)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Market study {0} is not loaded")]
    UnknownStudy(Uuid),

    #[error("Cannot retry market study {study_id}: no failed step recorded")]
    Refused { study_id: Uuid },

    #[error("Authentication failed - unable to get valid token")]
    Unauthenticated,

    #[error("Failed to start {step} for market study {study_id}: {source}")]
    StartFailed {
        study_id: Uuid,
        step: PipelineStep,
        #[source]
        source: ApiError,
    },

    #[error("Failed to load market studies: {0}")]
    Api(#[source] ApiError),
}
