use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a market study pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MarketStudyStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MarketStudyStatus {
    /// `completed` and `failed` end a run; only a new explicit run leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Named stages of the server-side pipeline.
///
/// `FetchAppMetadata → FetchKeywords → ClassifyKeywords` form the analysis
/// chain; `GenerateMetadata` runs on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStep {
    FetchAppMetadata,
    FetchKeywords,
    ClassifyKeywords,
    GenerateMetadata,
}

/// A market study as returned by the backend.
///
/// Only the fields the polling core reasons about are typed; app metadata,
/// keywords and generated copy ride along untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketStudy {
    pub id: Uuid,
    pub status: MarketStudyStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failed_step: Option<PipelineStep>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MarketStudy {
    /// A bare record with no payload, mostly useful for fakes and tests.
    pub fn new(id: Uuid, status: MarketStudyStatus) -> Self {
        Self {
            id,
            status,
            error_message: None,
            failed_step: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Response of `POST /api/market-studies/{id}/run-background-task/{step}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub message: String,
    pub market_study_id: Uuid,
    pub step: String,
    pub status: String,
}

/// One page of a project's market studies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn empty(page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page: 1,
            page_size,
            total_pages: 0,
            has_next: false,
            has_previous: false,
        }
    }
}
