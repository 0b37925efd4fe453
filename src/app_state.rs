use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    api::{ApiError, AsoApiClient},
    auth::TokenManager,
    board::StudyBoard,
    notify::Notifier,
    orchestrator::PipelineOrchestrator,
    registry::ActiveJobRegistry,
    session::FileSessionStore,
};

pub type Tokens = TokenManager<FileSessionStore, AsoApiClient>;
pub type Orchestrator = PipelineOrchestrator<AsoApiClient, Tokens>;

/// Shared services for one signed-in session.
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<AsoApiClient>,
    pub tokens: Arc<Tokens>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: &AppConfig, notifier: Arc<dyn Notifier>) -> Result<Self, ApiError> {
        let api = Arc::new(AsoApiClient::new(&config.api_url)?);
        let store = FileSessionStore::open(&config.session_file);

        let tokens = Arc::new(
            TokenManager::new(store, Arc::clone(&api), Arc::clone(&notifier))
                .with_refresh_buffer(config.refresh_buffer()),
        );

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&api),
            Arc::clone(&tokens),
            Arc::new(StudyBoard::default()),
            ActiveJobRegistry::new(),
            notifier,
            config.orchestrator_settings(),
        ));

        Ok(Self {
            api,
            tokens,
            orchestrator,
        })
    }
}
