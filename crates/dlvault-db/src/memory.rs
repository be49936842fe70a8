//! In-memory [`DownloadIndex`], used by the scheduler's own tests and by
//! embedders (e.g. the CLI demo) that don't need cross-restart durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dlvault_core::{DownloadIndex, DownloadRecord, DownloadState, IndexError};

#[derive(Default)]
pub struct InMemoryDownloadIndex {
    records: Mutex<HashMap<String, DownloadRecord>>,
}

impl InMemoryDownloadIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadIndex for InMemoryDownloadIndex {
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn get_states(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRecord>, IndexError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| states.is_empty() || states.contains(&r.state))
            .cloned()
            .collect())
    }

    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn set_manual_stop_reason(&self, reason: i32) -> Result<(), IndexError> {
        for record in self.records.lock().unwrap().values_mut() {
            record.manual_stop_reason = reason;
        }
        Ok(())
    }

    async fn set_manual_stop_reason_for(&self, id: &str, reason: i32) -> Result<(), IndexError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(id) {
            record.manual_stop_reason = reason;
        }
        Ok(())
    }
}
