//! In-process mock of the ASO backend, served over real HTTP with axum

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aso_pipeline_client::models::auth::JwtClaims;
use aso_pipeline_client::services::orchestrator::OrchestratorSettings;
use aso_pipeline_client::services::poller::PollOptions;

use crate::fixtures::{access_token, EMAIL, PASSWORD, SIGNING_SECRET};

/// One scripted answer to a status read
#[derive(Debug, Clone)]
pub enum Scripted {
    Body(Value),
    Error(u16),
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn error(status: StatusCode, detail: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "detail": detail })))
}

#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<Uuid, VecDeque<Scripted>>>,
    last: Mutex<HashMap<Uuid, Scripted>>,
    projects: Mutex<HashMap<Uuid, Vec<Value>>>,
    refresh_tokens: Mutex<HashSet<String>>,
    failing_starts: Mutex<HashSet<Uuid>>,
    pub started: Mutex<Vec<(Uuid, String)>>,
    pub get_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Status reads for `id` play back `replies`; the last one repeats.
    pub fn script(&self, id: Uuid, replies: Vec<Scripted>) {
        self.scripts.lock().unwrap().insert(id, replies.into());
    }

    pub fn add_project(&self, project_id: Uuid, studies: Vec<Value>) {
        self.projects.lock().unwrap().insert(project_id, studies);
    }

    pub fn fail_start(&self, id: Uuid) {
        self.failing_starts.lock().unwrap().insert(id);
    }

    /// Register a refresh token the backend will honour.
    pub fn issue_refresh_token(&self) -> String {
        let token = format!("refresh-{}", Uuid::new_v4());
        self.refresh_tokens.lock().unwrap().insert(token.clone());
        token
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn started_steps(&self) -> Vec<(Uuid, String)> {
        self.started.lock().unwrap().clone()
    }

    fn next_reply(&self, id: Uuid) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = scripts.get_mut(&id).and_then(|s| s.pop_front()) {
            last.insert(id, next);
        }
        last.get(&id).cloned()
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Reject requests without a live access token.
fn authorize(headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let token = bearer(headers).ok_or_else(|| error(StatusCode::UNAUTHORIZED, "Not authenticated"))?;

    let mut validation = Validation::default();
    validation.validate_exp = false;
    let claims = decode::<JwtClaims>(token, &DecodingKey::from_secret(SIGNING_SECRET), &validation)
        .map_err(|_| error(StatusCode::UNAUTHORIZED, "Could not validate credentials"))?
        .claims;

    if claims.exp <= chrono::Utc::now().timestamp() {
        return Err(error(StatusCode::UNAUTHORIZED, "Token expired"));
    }
    Ok(())
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(State(backend): State<Arc<MockBackend>>, Form(form): Form<LoginForm>) -> ApiResult {
    if form.username != EMAIL || form.password != PASSWORD {
        return Err(error(StatusCode::UNAUTHORIZED, "Incorrect email or password"));
    }
    Ok(Json(json!({
        "access_token": access_token(3600),
        "refresh_token": backend.issue_refresh_token(),
        "token_type": "bearer",
        "expires_in": 3600,
        "is_superuser": true,
    })))
}

async fn refresh(State(backend): State<Arc<MockBackend>>, headers: HeaderMap) -> ApiResult {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let known = bearer(&headers)
        .map(|t| backend.refresh_tokens.lock().unwrap().contains(t))
        .unwrap_or(false);
    if !known {
        return Err(error(StatusCode::UNAUTHORIZED, "Invalid refresh token"));
    }
    Ok(Json(json!({
        "access_token": access_token(3600),
        "token_type": "bearer",
        "expires_in": 3600,
    })))
}

async fn get_study(
    State(backend): State<Arc<MockBackend>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult {
    backend.get_calls.fetch_add(1, Ordering::SeqCst);
    authorize(&headers)?;

    match backend.next_reply(id) {
        Some(Scripted::Body(body)) => Ok(Json(body)),
        Some(Scripted::Error(status)) => Err(error(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "Scripted failure",
        )),
        None => Err(error(StatusCode::NOT_FOUND, "Market study not found")),
    }
}

async fn run_task(
    State(backend): State<Arc<MockBackend>>,
    Path((id, step)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> ApiResult {
    authorize(&headers)?;

    if backend.failing_starts.lock().unwrap().contains(&id) {
        return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue background task"));
    }
    backend.started.lock().unwrap().push((id, step.clone()));

    Ok(Json(json!({
        "message": format!("Background task {step} started"),
        "market_study_id": id,
        "step": step,
        "status": "in_progress",
    })))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_project(
    State(backend): State<Arc<MockBackend>>,
    Path(project_id): Path<Uuid>,
    axum::extract::Query(query): axum::extract::Query<PageQuery>,
    headers: HeaderMap,
) -> ApiResult {
    authorize(&headers)?;

    let items = backend
        .projects
        .lock()
        .unwrap()
        .get(&project_id)
        .cloned()
        .unwrap_or_default();
    let total = items.len();

    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": query.page.unwrap_or(1),
        "page_size": query.page_size.unwrap_or(20),
        "total_pages": 1,
        "has_next": false,
        "has_previous": false,
    })))
}

/// Serve the mock on an ephemeral port and return its base URL.
pub async fn spawn_backend(backend: Arc<MockBackend>) -> String {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/market-studies/{id}", get(get_study))
        .route("/api/market-studies/{id}/run-background-task/{step}", post(run_task))
        .route("/api/market-studies/project/{project_id}", get(list_project))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock backend");
    let addr = listener.local_addr().expect("Mock backend has no address");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Mock backend failed");
    });

    format!("http://{addr}")
}

/// Fast polling so tests finish in milliseconds over real HTTP
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll: PollOptions {
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        },
        retry_settle: Duration::from_millis(10),
        page_size: 50,
    }
}
