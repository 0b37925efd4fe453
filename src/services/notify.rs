use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::market_study::MarketStudyStatus;
use crate::services::orchestrator::Operation;

/// User-visible notices. Failures surface as a status label plus an optional
/// message, never as a raw error.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    SessionExpired,
    ReloadToCheckStatus {
        study_id: Uuid,
    },
    OperationFinished {
        study_id: Uuid,
        operation: Operation,
        status: MarketStudyStatus,
        error_message: Option<String>,
    },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::SessionExpired => "Session expired. Please log in again.".to_string(),
            Notice::ReloadToCheckStatus { .. } => {
                "Could not confirm the study status. Reload to check its actual status.".to_string()
            }
            Notice::OperationFinished {
                operation,
                status: MarketStudyStatus::Failed,
                error_message,
                ..
            } => format!(
                "{} failed: {}",
                operation.label(),
                error_message.as_deref().unwrap_or("Unknown error")
            ),
            Notice::OperationFinished { operation, .. } => {
                format!("{} completed successfully", operation.label())
            }
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::SessionExpired => tracing::warn!("{}", notice.message()),
            Notice::ReloadToCheckStatus { study_id } => {
                tracing::warn!(study_id = %study_id, "{}", notice.message())
            }
            Notice::OperationFinished {
                study_id,
                status: MarketStudyStatus::Failed,
                ..
            } => tracing::error!(study_id = %study_id, "{}", notice.message()),
            Notice::OperationFinished { study_id, .. } => {
                tracing::info!(study_id = %study_id, "{}", notice.message())
            }
        }
    }
}

/// Forwards notices to a channel, for front ends that render them.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        // Receiver gone means nobody is rendering notices any more
        let _ = self.tx.send(notice);
    }
}
