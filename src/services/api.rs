use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::models::auth::{ErrorBody, LoginResponse, RefreshResponse};
use crate::models::market_study::{MarketStudy, Page, PipelineStep, RunTaskResponse};

/// Market study endpoints the polling core depends on.
pub trait MarketStudyApi: Send + Sync {
    /// `GET /api/market-studies/{id}`. `Ok(None)` when the backend has no record.
    fn get_market_study(
        &self,
        id: Uuid,
        token: &str,
    ) -> impl Future<Output = Result<Option<MarketStudy>, ApiError>> + Send;

    /// `POST /api/market-studies/{id}/run-background-task/{step}`.
    fn run_background_task(
        &self,
        id: Uuid,
        step: PipelineStep,
        token: &str,
    ) -> impl Future<Output = Result<RunTaskResponse, ApiError>> + Send;

    /// `GET /api/market-studies/project/{project_id}`.
    fn list_project_market_studies(
        &self,
        project_id: Uuid,
        page: u32,
        page_size: u32,
        token: &str,
    ) -> impl Future<Output = Result<Page<MarketStudy>, ApiError>> + Send;
}

/// Authentication endpoints.
pub trait AuthApi: Send + Sync {
    fn login(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<LoginResponse, ApiError>> + Send;

    /// Mint a new access token. The refresh token itself is not rotated.
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<RefreshResponse, ApiError>> + Send;
}

/// HTTP client for the ASO backend.
pub struct AsoApiClient {
    http: Client,
    base_url: String,
}

impl AsoApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("aso-pipeline-client/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Decode a success body, or turn an error status into `ApiError::Status`
    /// carrying the backend's `detail` when it sent one.
    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.detail)
                .unwrap_or(body);
            return Err(ApiError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        serde_json::from_str(&body).map_err(ApiError::Decode)
    }
}

impl MarketStudyApi for AsoApiClient {
    async fn get_market_study(&self, id: Uuid, token: &str) -> Result<Option<MarketStudy>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/api/market-studies/{id}")))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::read_json(response).await.map(Some)
    }

    async fn run_background_task(
        &self,
        id: Uuid,
        step: PipelineStep,
        token: &str,
    ) -> Result<RunTaskResponse, ApiError> {
        let response = self
            .http
            .post(self.url(&format!("/api/market-studies/{id}/run-background-task/{step}")))
            .bearer_auth(token)
            .send()
            .await?;

        Self::read_json(response).await
    }

    async fn list_project_market_studies(
        &self,
        project_id: Uuid,
        page: u32,
        page_size: u32,
        token: &str,
    ) -> Result<Page<MarketStudy>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/api/market-studies/project/{project_id}")))
            .query(&[("page", page), ("page_size", page_size)])
            .bearer_auth(token)
            .send()
            .await?;

        Self::read_json(response).await
    }
}

impl AuthApi for AsoApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .form(&[("username", email), ("password", password)])
            .send()
            .await?;

        Self::read_json(response).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let response = self
            .http
            .post(self.url("/api/auth/refresh"))
            .bearer_auth(refresh_token)
            .send()
            .await?;

        Self::read_json(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}
