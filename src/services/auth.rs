//! Access/refresh token lifecycle.
//!
//! The manager hands out access tokens that are valid at the moment of use.
//! Expired tokens are refreshed on demand (`ensure_valid_token`) and a
//! one-shot timer refreshes them shortly before they expire, re-arming
//! itself with every newly issued token.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::models::auth::{JwtClaims, SessionFlags, TokenPair};
use crate::services::api::{ApiError, AuthApi};
use crate::services::notify::{Notice, Notifier};
use crate::services::poller::TokenSupplier;
use crate::services::session::{SessionError, SessionStore};

/// How long before expiry the proactive refresh fires.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(2 * 60);

/// Read the claims of a JWT without verifying its signature.
///
/// Only the client-side expiry matters here; the backend verifies
/// signatures on every request.
pub fn decode_claims(token: &str) -> Result<JwtClaims, TokenError> {
    let data = jsonwebtoken::dangerous::insecure_decode::<JwtClaims>(token)?;
    Ok(data.claims)
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Whether the token's `exp` claim is in the past. Undecodable tokens count
/// as expired.
pub fn is_expired(token: &str) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.exp < now_epoch(),
        Err(e) => {
            tracing::debug!(error = %e, "Treating undecodable token as expired");
            true
        }
    }
}

/// Time left before the token expires; zero if expired or undecodable.
pub fn time_until_expiration(token: &str) -> Duration {
    match decode_claims(token) {
        Ok(claims) => Duration::from_secs(claims.exp.saturating_sub(now_epoch()).max(0) as u64),
        Err(_) => Duration::ZERO,
    }
}

struct RefreshTimer {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    current: Option<RefreshTimer>,
}

/// Owns the session's token pair.
pub struct TokenManager<S, A> {
    store: S,
    api: Arc<A>,
    notifier: Arc<dyn Notifier>,
    refresh_buffer: Duration,
    /// Serializes read-modify-write of the token pair.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped by every sign-out. A refresh started under an older epoch
    /// must not write its result back.
    epoch: Mutex<u64>,
    timer: Mutex<TimerSlot>,
}

impl<S, A> TokenManager<S, A>
where
    S: SessionStore + 'static,
    A: AuthApi + 'static,
{
    pub fn new(store: S, api: Arc<A>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            api,
            notifier,
            refresh_buffer: REFRESH_BUFFER,
            refresh_lock: tokio::sync::Mutex::new(()),
            epoch: Mutex::new(0),
            timer: Mutex::new(TimerSlot::default()),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.tokens().is_some()
    }

    pub fn flags(&self) -> SessionFlags {
        self.store.flags()
    }

    /// Return the stored access token if still valid, otherwise try exactly
    /// one refresh. `None` means the user must sign in again; in that case
    /// both tokens have been cleared.
    pub async fn ensure_valid_token(&self) -> Option<String> {
        let _guard = self.refresh_lock.lock().await;
        let epoch = self.current_epoch();

        let Some(pair) = self.store.tokens() else {
            self.clear_tokens();
            return None;
        };

        if !is_expired(&pair.access_token) {
            return Some(pair.access_token);
        }

        tracing::debug!("Access token expired, refreshing");
        match self.refresh_pair(&pair, epoch).await {
            Ok(Some(access_token)) => Some(access_token),
            Ok(None) => {
                tracing::debug!("Signed out during token refresh, discarding result");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed, clearing session tokens");
                self.clear_tokens();
                None
            }
        }
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh with the given pair's refresh token and persist the result.
    /// `Ok(None)` if the session was signed out (`epoch` moved on) while the
    /// request was in flight; nothing is stored then. Caller holds
    /// `refresh_lock`.
    async fn refresh_pair(&self, pair: &TokenPair, epoch: u64) -> Result<Option<String>, ApiError> {
        let response = match self.api.refresh(&pair.refresh_token).await {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!("token_refresh_total", "result" => "error").increment(1);
                return Err(e);
            }
        };
        metrics::counter!("token_refresh_total", "result" => "ok").increment(1);

        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            return Ok(None);
        }

        let updated = TokenPair {
            access_token: response.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
        };
        if let Err(e) = self.store.store_tokens(&updated) {
            tracing::warn!(error = %e, "Failed to persist refreshed token");
        }

        Ok(Some(response.access_token))
    }

    /// Arm the proactive refresh timer for `access_token`, replacing any
    /// pending one.
    pub fn schedule_proactive_refresh(self: &Arc<Self>, access_token: &str) {
        let remaining = time_until_expiration(access_token);
        let delay = remaining.saturating_sub(self.refresh_buffer);

        tracing::info!(
            expires_in_secs = remaining.as_secs(),
            refresh_in_secs = delay.as_secs(),
            "Scheduling token refresh"
        );

        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.current.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let epoch = self.current_epoch();

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_refresh_timer(generation, epoch).await;
        });

        slot.current = Some(RefreshTimer {
            generation,
            delay,
            handle,
        });
    }

    async fn on_refresh_timer(self: Arc<Self>, generation: u64, epoch: u64) {
        {
            let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
            let current = slot.current.as_ref().is_some_and(|t| t.generation == generation);
            if !current {
                return;
            }
            // Detach so re-arming below does not abort this task
            slot.current = None;
        }

        tracing::info!("Refreshing token");
        let refreshed = {
            let _guard = self.refresh_lock.lock().await;
            if self.current_epoch() != epoch {
                return;
            }
            match self.store.tokens() {
                Some(pair) => self.refresh_pair(&pair, epoch).await.map_err(|e| e.to_string()),
                None => Err("no refresh token available".to_string()),
            }
        };

        match refreshed {
            Ok(None) => tracing::debug!("Signed out during token refresh, not re-arming"),
            Ok(Some(access_token)) => {
                tracing::info!("Token refreshed successfully");
                self.schedule_proactive_refresh(&access_token);
            }
            Err(_) if self.current_epoch() != epoch => {}
            Err(reason) => {
                tracing::error!(error = %reason, "Proactive token refresh failed, signing out");
                self.sign_out();
                self.notifier.notify(Notice::SessionExpired);
            }
        }
    }

    /// Delay of the pending proactive refresh, if one is armed.
    pub fn scheduled_refresh(&self) -> Option<Duration> {
        let slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        slot.current.as_ref().map(|t| t.delay)
    }

    pub async fn sign_in(self: &Arc<Self>, email: &str, password: &str) -> Result<SessionFlags, AuthError> {
        let response = self.api.login(email, password).await.map_err(|e| match e {
            e if e.is_unauthorized() => AuthError::InvalidCredentials,
            e => AuthError::Api(e),
        })?;

        {
            let _guard = self.refresh_lock.lock().await;
            self.store.store_tokens(&TokenPair {
                access_token: response.access_token.clone(),
                refresh_token: response.refresh_token.clone(),
            })?;
        }

        let flags = SessionFlags {
            email: Some(email.to_string()),
            is_superuser: response.is_superuser,
        };
        self.store.store_flags(&flags)?;

        tracing::info!(email = %email, is_superuser = flags.is_superuser, "Signed in");
        self.schedule_proactive_refresh(&response.access_token);
        Ok(flags)
    }

    /// Resume a persisted session. Returns whether the user is authenticated.
    pub async fn restore_session(self: &Arc<Self>) -> bool {
        if self.store.tokens().is_none() {
            return false;
        }

        match self.ensure_valid_token().await {
            Some(token) => {
                self.schedule_proactive_refresh(&token);
                true
            }
            None => {
                tracing::info!("Persisted session is no longer valid");
                self.sign_out();
                false
            }
        }
    }

    /// Cancel the refresh timer and forget the session. A refresh already
    /// in flight finishes but its result is dropped.
    pub fn sign_out(&self) {
        {
            let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer) = slot.current.take() {
                timer.handle.abort();
            }
        }

        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.clear_tokens();
        if let Err(e) = self.store.clear_flags() {
            tracing::warn!(error = %e, "Failed to clear session flags");
        }
    }

    fn clear_tokens(&self) {
        if let Err(e) = self.store.clear_tokens() {
            tracing::warn!(error = %e, "Failed to clear session tokens");
        }
    }
}

impl<S, A> TokenSupplier for TokenManager<S, A>
where
    S: SessionStore + 'static,
    A: AuthApi + 'static,
{
    fn token(&self) -> impl Future<Output = Option<String>> + Send {
        self.ensure_valid_token()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Failed to decode token: {0}")]
    Decode(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
