//! In-memory doubles for the backend, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use uuid::Uuid;

use crate::models::auth::{JwtClaims, LoginResponse, RefreshResponse};
use crate::models::market_study::{MarketStudy, MarketStudyStatus, Page, PipelineStep, RunTaskResponse};
use crate::services::api::{ApiError, AuthApi, MarketStudyApi};

/// Mint an HS256 access token expiring `expires_in` seconds from now.
pub(crate) fn token_expiring_in(expires_in: i64) -> String {
    let claims = JwtClaims {
        sub: "user-1".to_string(),
        exp: chrono::Utc::now().timestamp() + expires_in,
        token_type: Some("access".to_string()),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

/// Auth endpoints issuing tokens with a fixed lifetime, or always failing.
pub(crate) struct FakeAuthApi {
    pub lifetime_secs: i64,
    pub fail: bool,
    pub refresh_delay: Duration,
    pub refresh_calls: AtomicUsize,
}

impl FakeAuthApi {
    pub(crate) fn issuing(lifetime_secs: i64) -> Self {
        Self {
            lifetime_secs,
            fail: false,
            refresh_delay: Duration::ZERO,
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            lifetime_secs: 0,
            fail: true,
            refresh_delay: Duration::ZERO,
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// Answer refreshes only after `delay`.
    pub(crate) fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl AuthApi for FakeAuthApi {
    async fn login(&self, _email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        if password != "hunter2" {
            return Err(ApiError::Status {
                status: 401,
                detail: "Incorrect email or password".to_string(),
            });
        }
        Ok(LoginResponse {
            access_token: token_expiring_in(self.lifetime_secs),
            refresh_token: "refresh-token".to_string(),
            token_type: "bearer".to_string(),
            expires_in: self.lifetime_secs,
            is_superuser: true,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if self.fail {
            return Err(ApiError::Status {
                status: 401,
                detail: "Refresh token expired".to_string(),
            });
        }
        Ok(RefreshResponse {
            access_token: token_expiring_in(self.lifetime_secs),
            token_type: "bearer".to_string(),
            expires_in: self.lifetime_secs,
        })
    }
}

/// One scripted answer to `GET /api/market-studies/{id}`.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Study(MarketStudy),
    Missing,
    Down,
}

impl Reply {
    pub(crate) fn status(id: Uuid, status: MarketStudyStatus) -> Self {
        Reply::Study(MarketStudy::new(id, status))
    }

    fn into_result(self) -> Result<Option<MarketStudy>, ApiError> {
        match self {
            Reply::Study(study) => Ok(Some(study)),
            Reply::Missing => Ok(None),
            Reply::Down => Err(ApiError::Status {
                status: 503,
                detail: "Service Unavailable".to_string(),
            }),
        }
    }
}

/// Market study backend that plays back a script of replies. Once the script
/// runs out the last reply repeats.
pub(crate) struct ScriptedStudyApi {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    accepted_token: Option<String>,
    start_fails: bool,
    listing: Vec<MarketStudy>,
    pub get_calls: AtomicUsize,
    pub tokens_seen: Mutex<Vec<String>>,
    pub started: Mutex<Vec<PipelineStep>>,
}

impl ScriptedStudyApi {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            last: Mutex::new(Reply::Down),
            accepted_token: None,
            start_fails: false,
            listing: Vec::new(),
            get_calls: AtomicUsize::new(0),
            tokens_seen: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Reject every other token with a 401.
    pub(crate) fn accepting_only(mut self, token: &str) -> Self {
        self.accepted_token = Some(token.to_string());
        self
    }

    pub(crate) fn with_failing_start(mut self) -> Self {
        self.start_fails = true;
        self
    }

    pub(crate) fn with_listing(mut self, studies: Vec<MarketStudy>) -> Self {
        self.listing = studies;
        self
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn started_steps(&self) -> Vec<PipelineStep> {
        self.started.lock().unwrap().clone()
    }
}

impl MarketStudyApi for ScriptedStudyApi {
    async fn get_market_study(&self, _id: Uuid, token: &str) -> Result<Option<MarketStudy>, ApiError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().unwrap().push(token.to_string());

        let reply = {
            let mut script = self.script.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = script.pop_front() {
                *last = next;
            }
            last.clone()
        };

        if let Some(accepted) = &self.accepted_token {
            if accepted != token {
                return Err(ApiError::Status {
                    status: 401,
                    detail: "Token expired".to_string(),
                });
            }
        }

        reply.into_result()
    }

    async fn run_background_task(
        &self,
        id: Uuid,
        step: PipelineStep,
        _token: &str,
    ) -> Result<RunTaskResponse, ApiError> {
        if self.start_fails {
            return Err(ApiError::Status {
                status: 500,
                detail: "Failed to queue background task".to_string(),
            });
        }
        self.started.lock().unwrap().push(step);
        Ok(RunTaskResponse {
            message: "Background task started".to_string(),
            market_study_id: id,
            step: step.to_string(),
            status: "in_progress".to_string(),
        })
    }

    async fn list_project_market_studies(
        &self,
        _project_id: Uuid,
        _page: u32,
        page_size: u32,
        _token: &str,
    ) -> Result<Page<MarketStudy>, ApiError> {
        let mut page = Page::empty(page_size);
        page.total = self.listing.len() as u64;
        page.total_pages = 1;
        page.items = self.listing.clone();
        Ok(page)
    }
}
