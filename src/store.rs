//! Sync state persistence: the only source of truth for resumption.
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{RecordKind, SyncState};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` on cold start.
    async fn load(&self, kind: RecordKind) -> Result<Option<SyncState>, StoreError>;

    /// Either the new state is visible to the next `load` or the old one still is.
    async fn save(&self, state: &SyncState) -> Result<(), StoreError>;

    /// Forget a kind's state. Returns whether anything was stored.
    async fn reset(&self, kind: RecordKind) -> Result<bool, StoreError>;

    async fn load_or(&self, default: SyncState) -> Result<SyncState, StoreError> {
        Ok(self.load(default.record_kind).await?.unwrap_or(default))
    }
}

/// Process-local store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<RecordKind, SyncState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            states: Mutex::new(HashMap::from([(state.record_kind, state)])),
        }
    }

    pub async fn get(&self, kind: RecordKind) -> Option<SyncState> {
        self.states.lock().await.get(&kind).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, kind: RecordKind) -> Result<Option<SyncState>, StoreError> {
        Ok(self.get(kind).await)
    }

    async fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        self.states
            .lock()
            .await
            .insert(state.record_kind, state.clone());
        Ok(())
    }

    async fn reset(&self, kind: RecordKind) -> Result<bool, StoreError> {
        Ok(self.states.lock().await.remove(&kind).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn load_or_returns_default_on_cold_start() {
        let store = MemoryStateStore::new();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1);
        let default = SyncState::initial(RecordKind::Label, start);
        let loaded = store.load_or(default.clone()).await.unwrap();
        assert_eq!(loaded, default);
        assert!(store.get(RecordKind::Label).await.is_none());
    }

    #[tokio::test]
    async fn saved_state_wins_over_default_and_reset_clears_it() {
        let store = MemoryStateStore::new();
        let mut state = SyncState::initial(RecordKind::Recall, None);
        state.cursor = "20240301:4".parse().unwrap();
        store.save(&state).await.unwrap();

        let loaded = store
            .load_or(SyncState::initial(RecordKind::Recall, None))
            .await
            .unwrap();
        assert_eq!(loaded.cursor.to_string(), "20240301:4");

        assert!(store.reset(RecordKind::Recall).await.unwrap());
        assert!(!store.reset(RecordKind::Recall).await.unwrap());
        assert!(store.load(RecordKind::Recall).await.unwrap().is_none());
    }
}
