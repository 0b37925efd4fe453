use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Market studies with a poll in flight. At most one poll per study.
#[derive(Default)]
pub struct ActiveJobRegistry {
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    root: CancellationToken,
}

impl ActiveJobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the poll slot for `study_id`. `None` if a poll already owns it.
    pub fn try_claim(self: &Arc<Self>, study_id: Uuid) -> Option<PollSlot> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&study_id) {
            return None;
        }

        let cancel = self.root.child_token();
        active.insert(study_id, cancel.clone());
        Some(PollSlot {
            registry: Arc::clone(self),
            study_id,
            cancel,
        })
    }

    pub fn is_active(&self, study_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&study_id)
    }

    pub fn active(&self) -> Vec<Uuid> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Ask the poll for `study_id` to stop. Returns whether one was running.
    pub fn cancel(&self, study_id: Uuid) -> bool {
        match self.active.lock().unwrap_or_else(PoisonError::into_inner).get(&study_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every poll, including ones claimed later.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    fn release(&self, study_id: Uuid) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&study_id);
    }
}

/// Ownership of one study's poll. Dropping it frees the slot.
pub struct PollSlot {
    registry: Arc<ActiveJobRegistry>,
    study_id: Uuid,
    cancel: CancellationToken,
}

impl PollSlot {
    pub fn study_id(&self) -> Uuid {
        self.study_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for PollSlot {
    fn drop(&mut self) {
        self.registry.release(self.study_id);
    }
}
