//! Add / search / delete workflows spanning the daemon, the metadata store
//! and the upload directory.
//!
//! There is no transaction across those three, so every workflow undoes its
//! own side effects by hand when a later step fails.

use crate::daemon_client::{DaemonClient, ImageId, MatchResult};
use crate::error::AppError;
use crate::metadata::ImageRecord;
use crate::store::MetadataStore;
use crate::uploads::{StoredAsset, UploadRules, UploadStorage, UploadedImage};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// First id of the range reserved for probe images of upload searches.
pub const TEMP_ID_BASE: ImageId = 1_000_000_000;
/// Exclusive end of the temporary id range.
pub const TEMP_ID_LIMIT: ImageId = 2_000_000_000;

#[derive(Debug, Clone, Copy)]
pub struct MatchLimits {
    pub default_count: u32,
    pub max_count: u32,
}

impl MatchLimits {
    /// Absent or non-positive counts fall back to the default.
    pub fn clamp(&self, requested: Option<i64>) -> u32 {
        match requested {
            Some(n) if n > 0 => n.min(i64::from(self.max_count)) as u32,
            _ => self.default_count,
        }
    }
}

pub fn allocate_temp_id() -> ImageId {
    rand::thread_rng().gen_range(TEMP_ID_BASE..TEMP_ID_LIMIT)
}

pub fn is_persistent_id(id: ImageId) -> bool {
    (1..TEMP_ID_BASE).contains(&id)
}

/// Drops the probe's own entry from a neighbour list.
pub fn exclude_probe(matches: Vec<MatchResult>, probe: ImageId) -> Vec<MatchResult> {
    matches.into_iter().filter(|m| m.image_id != probe).collect()
}

fn validate_id(raw: i64) -> Result<ImageId, AppError> {
    ImageId::try_from(raw)
        .ok()
        .filter(|id| is_persistent_id(*id))
        .ok_or_else(|| AppError::Validation(format!("invalid image id {}", raw)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub daemon: &'static str,
    pub db_id: i32,
    pub images_in_db: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub db_id: i32,
    pub created: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub db_id: i32,
    pub reset: bool,
    pub metadata_cleared: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedImage {
    pub image_id: ImageId,
    pub indexed: bool,
    pub saved: bool,
    pub used_path: String,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub id: ImageId,
    pub filename: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub url: String,
}

impl From<&ImageRecord> for ImageView {
    fn from(record: &ImageRecord) -> Self {
        Self {
            id: record.id,
            filename: record.image.filename.clone(),
            mime: record.image.mime.clone(),
            width: record.image.width,
            height: record.image.height,
            url: record.url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMatch {
    pub image_id: ImageId,
    pub score: f64,
    pub image: Option<ImageView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSearchReport {
    pub temp_id: ImageId,
    pub matches: Vec<EnrichedMatch>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchesReport {
    pub image_id: ImageId,
    pub matches: Vec<EnrichedMatch>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub image_id: ImageId,
    pub deleted_from_daemon: bool,
    pub deleted_from_metadata: bool,
    pub file_deleted: bool,
}

#[derive(Debug, Serialize)]
struct IndexAttempt {
    path: String,
    error: String,
}

pub struct IndexOrchestrator {
    daemon: DaemonClient,
    store: Arc<dyn MetadataStore>,
    uploads: UploadStorage,
    rules: UploadRules,
    limits: MatchLimits,
}

impl IndexOrchestrator {
    pub fn new(
        daemon: DaemonClient,
        store: Arc<dyn MetadataStore>,
        uploads: UploadStorage,
        rules: UploadRules,
        limits: MatchLimits,
    ) -> Self {
        Self {
            daemon,
            store,
            uploads,
            rules,
            limits,
        }
    }

    pub fn uploads(&self) -> &UploadStorage {
        &self.uploads
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.rules.max_bytes
    }

    pub async fn health(&self) -> Result<HealthReport, AppError> {
        self.daemon.ensure_database_ready().await?;
        let images_in_db = self.daemon.image_count().await?;
        Ok(HealthReport {
            daemon: "online",
            db_id: self.daemon.db_id(),
            images_in_db,
        })
    }

    pub async fn init(&self) -> Result<InitReport, AppError> {
        let created = self.daemon.create_database().await?;
        self.daemon.save_all_databases().await?;
        Ok(InitReport {
            db_id: self.daemon.db_id(),
            created,
        })
    }

    /// Clears the daemon database, then the metadata rows that described it.
    pub async fn reset(&self) -> Result<ResetReport, AppError> {
        let reset = self.daemon.reset_database().await?;
        self.daemon.save_all_databases().await?;
        self.store.truncate().await?;
        log::info!("Database {} reset (daemon answered {})", self.daemon.db_id(), reset);
        Ok(ResetReport {
            db_id: self.daemon.db_id(),
            reset,
            metadata_cleared: true,
        })
    }

    pub async fn remote_methods(&self) -> Result<Vec<String>, AppError> {
        Ok(self.daemon.list_methods().await?)
    }

    pub async fn image(&self, raw_id: i64) -> Result<ImageView, AppError> {
        let id = validate_id(raw_id)?;
        self.store
            .find(id)
            .await?
            .map(|record| ImageView::from(&record))
            .ok_or_else(|| AppError::NotFound(format!("image {}", id)))
    }

    pub async fn random_images(&self, limit: usize) -> Result<Vec<ImageView>, AppError> {
        let records = self.store.random(limit).await?;
        Ok(records.iter().map(ImageView::from).collect())
    }

    /// Stores the upload, records it and indexes it under its persistent id.
    pub async fn add_image(&self, upload: &UploadedImage) -> Result<AddedImage, AppError> {
        self.daemon.ensure_database_ready().await?;
        let asset = self.uploads.save_uploaded_image(upload, &self.rules).await?;

        let image_id = match self.store.insert(&asset.to_new_image()).await {
            Ok(id) => id,
            Err(e) => {
                self.uploads.discard(&asset.host_path).await;
                return Err(e);
            }
        };
        if !is_persistent_id(image_id) {
            self.rollback_insert(image_id, &asset).await;
            return Err(AppError::partial(
                format!("metadata id {} falls outside the persistent id range", image_id),
                json!({ "imageId": image_id }),
            ));
        }

        let used_path = match self.index_asset(image_id, &asset).await {
            Ok(path) => path,
            Err(attempts) => {
                self.rollback_insert(image_id, &asset).await;
                return Err(AppError::partial(
                    "Daemon could not index the image",
                    attempts_context("imageId", image_id, &asset, &attempts),
                ));
            }
        };

        let saved = match self.daemon.save_all_databases().await {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("Image {} indexed but the daemon did not persist: {}", image_id, e);
                false
            }
        };
        log::info!("Indexed image {} from {}", image_id, used_path);

        Ok(AddedImage {
            image_id,
            indexed: true,
            saved,
            used_path,
            url: format!("/{}", asset.relative_path),
            filename: asset.filename,
        })
    }

    /// Indexes the upload under a temporary id, queries its neighbours and
    /// removes every trace of the probe again.
    pub async fn search_by_upload(
        &self,
        upload: &UploadedImage,
        count: Option<i64>,
    ) -> Result<UploadSearchReport, AppError> {
        let count = self.limits.clamp(count);
        self.daemon.ensure_database_ready().await?;
        let asset = self.uploads.save_uploaded_image(upload, &self.rules).await?;
        let temp_id = allocate_temp_id();
        log::debug!("Searching with probe image {} ({})", temp_id, asset.filename);

        if let Err(attempts) = self.index_asset(temp_id, &asset).await {
            self.uploads.discard(&asset.host_path).await;
            return Err(AppError::partial(
                "Could not add the temporary image",
                attempts_context("tempId", temp_id, &asset, &attempts),
            ));
        }

        let queried = self.daemon.query_neighbors(temp_id, count).await;
        self.discard_probe(temp_id).await;
        self.uploads.discard(&asset.host_path).await;

        let matches = match queried {
            Ok(matches) => exclude_probe(matches, temp_id),
            Err(e) => {
                return Err(AppError::partial(
                    format!("Similarity query failed: {}", e),
                    json!({ "tempId": temp_id }),
                ))
            }
        };
        let matches = self.enrich(matches).await?;
        Ok(UploadSearchReport {
            temp_id,
            count: matches.len(),
            matches,
        })
    }

    pub async fn matches_by_id(&self, raw_id: i64, count: Option<i64>) -> Result<MatchesReport, AppError> {
        let image_id = validate_id(raw_id)?;
        let count = self.limits.clamp(count);
        self.daemon.ensure_database_ready().await?;

        let matches = exclude_probe(self.daemon.query_neighbors(image_id, count).await?, image_id);
        let matches = self.enrich(matches).await?;
        Ok(MatchesReport {
            image_id,
            count: matches.len(),
            matches,
        })
    }

    /// Removes an image everywhere. A daemon failure is reported, not raised,
    /// so the metadata row and the file are still cleaned up.
    pub async fn delete_by_id(&self, raw_id: i64) -> Result<DeleteReport, AppError> {
        let image_id = validate_id(raw_id)?;

        let deleted_from_daemon = match self.daemon.remove_image(image_id).await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("Daemon could not remove image {}: {}", image_id, e);
                false
            }
        };
        if let Err(e) = self.daemon.save_all_databases().await {
            log::warn!("Daemon did not persist after removing image {}: {}", image_id, e);
        }

        let record = self.store.find(image_id).await?;
        let deleted_from_metadata = self.store.delete(image_id).await?;
        let file_deleted = match record {
            Some(record) => self.uploads.discard(Path::new(&record.image.host_path)).await,
            None => false,
        };

        log::info!(
            "Deleted image {} (daemon: {}, metadata: {}, file: {})",
            image_id,
            deleted_from_daemon,
            deleted_from_metadata,
            file_deleted
        );
        Ok(DeleteReport {
            image_id,
            deleted_from_daemon,
            deleted_from_metadata,
            file_deleted,
        })
    }

    /// Tries the daemon-visible path first, then the path relative to the
    /// shared directory.
    async fn index_asset(&self, id: ImageId, asset: &StoredAsset) -> Result<String, Vec<IndexAttempt>> {
        let mut attempts = Vec::new();
        for path in [&asset.remote_path, &asset.relative_path] {
            let error = match self.daemon.add_image(id, path).await {
                Ok(true) => return Ok(path.clone()),
                Ok(false) => "daemon refused the path".to_string(),
                Err(e) => e.to_string(),
            };
            log::warn!("addImg({}, {}) failed: {}", id, path, error);
            attempts.push(IndexAttempt {
                path: path.clone(),
                error,
            });
        }
        Err(attempts)
    }

    async fn rollback_insert(&self, image_id: ImageId, asset: &StoredAsset) {
        if let Err(e) = self.store.delete(image_id).await {
            log::error!("Could not roll back metadata row {}: {}", image_id, e);
        }
        self.uploads.discard(&asset.host_path).await;
    }

    async fn discard_probe(&self, temp_id: ImageId) {
        match self.daemon.remove_image(temp_id).await {
            Ok(true) => {}
            Ok(false) => log::warn!("Probe image {} was already gone from the daemon", temp_id),
            Err(e) => log::warn!("Could not remove probe image {}: {}", temp_id, e),
        }
        if let Err(e) = self.daemon.save_all_databases().await {
            log::warn!("Daemon did not persist after removing probe {}: {}", temp_id, e);
        }
    }

    async fn enrich(&self, matches: Vec<MatchResult>) -> Result<Vec<EnrichedMatch>, AppError> {
        let ids: Vec<ImageId> = matches.iter().map(|m| m.image_id).collect();
        let records = self.store.find_many(&ids).await?;
        Ok(matches
            .into_iter()
            .map(|m| EnrichedMatch {
                image: records.get(&m.image_id).map(ImageView::from),
                image_id: m.image_id,
                score: m.score,
            })
            .collect())
    }
}

fn attempts_context(
    id_key: &str,
    id: ImageId,
    asset: &StoredAsset,
    attempts: &[IndexAttempt],
) -> serde_json::Value {
    let mut context = json!({
        "try1": asset.remote_path,
        "try2": asset.relative_path,
        "attempts": attempts,
    });
    context[id_key] = json!(id);
    context
}
