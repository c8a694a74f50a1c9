use crate::daemon_client::ImageId;
use crate::error::AppError;
use crate::metadata::{ImageRecord, NewImage};
use async_trait::async_trait;
use std::collections::HashMap;

/// Largest number of rows `random` hands back.
pub const MAX_RANDOM_LIMIT: usize = 50;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, image: &NewImage) -> Result<ImageId, AppError>;
    async fn find(&self, id: ImageId) -> Result<Option<ImageRecord>, AppError>;
    async fn find_many(&self, ids: &[ImageId]) -> Result<HashMap<ImageId, ImageRecord>, AppError>;
    async fn random(&self, limit: usize) -> Result<Vec<ImageRecord>, AppError>;
    /// Returns whether a row was deleted.
    async fn delete(&self, id: ImageId) -> Result<bool, AppError>;
    async fn truncate(&self) -> Result<(), AppError>;
}

pub fn clamp_random_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_RANDOM_LIMIT)
}
