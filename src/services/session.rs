use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::models::auth::{SessionFlags, TokenPair};

/// Persistent storage for the single active session.
///
/// Writes are atomic from the caller's point of view; the last writer wins.
pub trait SessionStore: Send + Sync {
    /// Both tokens, or `None` if either is missing.
    fn tokens(&self) -> Option<TokenPair>;

    fn store_tokens(&self, tokens: &TokenPair) -> Result<(), SessionError>;

    fn clear_tokens(&self) -> Result<(), SessionError>;

    fn flags(&self) -> SessionFlags;

    fn store_flags(&self, flags: &SessionFlags) -> Result<(), SessionError>;

    fn clear_flags(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionState {
    #[serde(default)]
    tokens: Option<TokenPair>,
    #[serde(default)]
    flags: SessionFlags,
}

/// Session kept in process memory only.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<SessionState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            state: Mutex::new(SessionState {
                tokens: Some(tokens),
                flags: SessionFlags::default(),
            }),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn tokens(&self) -> Option<TokenPair> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens.clone()
    }

    fn store_tokens(&self, tokens: &TokenPair) -> Result<(), SessionError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens = Some(tokens.clone());
        Ok(())
    }

    fn clear_tokens(&self) -> Result<(), SessionError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens = None;
        Ok(())
    }

    fn flags(&self) -> SessionFlags {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flags.clone()
    }

    fn store_flags(&self, flags: &SessionFlags) -> Result<(), SessionError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flags = flags.clone();
        Ok(())
    }

    fn clear_flags(&self) -> Result<(), SessionError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flags = SessionFlags::default();
        Ok(())
    }
}

/// Session persisted as a JSON file so it survives restarts.
pub struct FileSessionStore {
    path: PathBuf,
    state: Mutex<SessionState>,
}

impl FileSessionStore {
    /// Open the session file, starting empty if it is missing or unreadable.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Discarding malformed session file");
                SessionState::default()
            }),
            Err(_) => SessionState::default(),
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut SessionState)) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = state.clone();
        apply(&mut next);

        // Memory only changes once the file holds the new state
        let payload = serde_json::to_vec_pretty(&next)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, payload)?;
        *state = next;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn tokens(&self) -> Option<TokenPair> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens.clone()
    }

    fn store_tokens(&self, tokens: &TokenPair) -> Result<(), SessionError> {
        self.update(|s| s.tokens = Some(tokens.clone()))
    }

    fn clear_tokens(&self) -> Result<(), SessionError> {
        self.update(|s| s.tokens = None)
    }

    fn flags(&self) -> SessionFlags {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flags.clone()
    }

    fn store_flags(&self, flags: &SessionFlags) -> Result<(), SessionError> {
        self.update(|s| s.flags = flags.clone())
    }

    fn clear_flags(&self) -> Result<(), SessionError> {
        self.update(|s| s.flags = SessionFlags::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
