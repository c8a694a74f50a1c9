use crate::daemon_client::ImageId;
use crate::error::AppError;
use crate::metadata::{ImageRecord, NewImage};
use crate::store::{clamp_random_limit, MetadataStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Rows {
    next_id: ImageId,
    records: BTreeMap<ImageId, ImageRecord>,
}

/// Process-local metadata, lost on restart.
#[derive(Default)]
pub struct MemoryMetadataStore {
    rows: Mutex<Rows>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(&self, image: &NewImage) -> Result<ImageId, AppError> {
        let mut rows = self.rows.lock();
        rows.next_id = rows
            .next_id
            .checked_add(1)
            .ok_or_else(|| AppError::Generic("metadata id space exhausted".into()))?;
        let id = rows.next_id;
        rows.records.insert(
            id,
            ImageRecord {
                id,
                image: image.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        Ok(id)
    }

    async fn find(&self, id: ImageId) -> Result<Option<ImageRecord>, AppError> {
        Ok(self.rows.lock().records.get(&id).cloned())
    }

    async fn find_many(&self, ids: &[ImageId]) -> Result<HashMap<ImageId, ImageRecord>, AppError> {
        let rows = self.rows.lock();
        Ok(ids
            .iter()
            .filter_map(|id| rows.records.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn random(&self, limit: usize) -> Result<Vec<ImageRecord>, AppError> {
        let rows = self.rows.lock();
        let all: Vec<&ImageRecord> = rows.records.values().collect();
        Ok(all
            .choose_multiple(&mut rand::thread_rng(), clamp_random_limit(limit))
            .map(|r| (*r).clone())
            .collect())
    }

    async fn delete(&self, id: ImageId) -> Result<bool, AppError> {
        Ok(self.rows.lock().records.remove(&id).is_some())
    }

    async fn truncate(&self) -> Result<(), AppError> {
        *self.rows.lock() = Rows::default();
        Ok(())
    }
}
