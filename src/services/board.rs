use tokio::sync::watch;
use uuid::Uuid;

use crate::models::market_study::MarketStudy;

/// The caller's in-memory list of market studies.
///
/// Updates replace entries in place by `id`; subscribers see a new snapshot
/// only when something actually changed.
pub struct StudyBoard {
    studies: watch::Sender<Vec<MarketStudy>>,
}

impl Default for StudyBoard {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StudyBoard {
    pub fn new(studies: Vec<MarketStudy>) -> Self {
        Self {
            studies: watch::Sender::new(studies),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<MarketStudy>> {
        self.studies.subscribe()
    }

    pub fn snapshot(&self) -> Vec<MarketStudy> {
        self.studies.borrow().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<MarketStudy> {
        self.studies.borrow().iter().find(|s| s.id == id).cloned()
    }

    pub fn replace_all(&self, studies: Vec<MarketStudy>) {
        self.studies.send_replace(studies);
    }

    /// Replace the entry with the same `id` by `record`. Returns whether the
    /// board changed; re-applying an identical record is a no-op.
    pub fn apply(&self, record: &MarketStudy) -> bool {
        self.studies.send_if_modified(|studies| {
            match studies.iter_mut().find(|s| s.id == record.id) {
                Some(entry) if entry != record => {
                    *entry = record.clone();
                    true
                }
                _ => false,
            }
        })
    }

    /// Mutate one entry in place, returning its state before the change.
    pub fn update(&self, id: Uuid, change: impl FnOnce(&mut MarketStudy)) -> Option<MarketStudy> {
        let mut previous = None;
        self.studies.send_if_modified(|studies| {
            let Some(entry) = studies.iter_mut().find(|s| s.id == id) else {
                return false;
            };
            let before = entry.clone();
            change(entry);
            let changed = *entry != before;
            previous = Some(before);
            changed
        });
        previous
    }
}
