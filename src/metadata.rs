// src/metadata.rs

use crate::daemon_client::ImageId;
use serde::{Deserialize, Serialize};

/// Fields of a stored upload, as persisted in the metadata store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewImage {
    pub filename: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub sha256: String,
    pub host_path: String,
    pub remote_path: String,
    pub relative_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    #[serde(flatten)]
    pub image: NewImage,
    pub created_at: String,
}

impl ImageRecord {
    /// Public URL the upload is served under.
    pub fn url(&self) -> String {
        format!("/{}", self.image.relative_path.trim_start_matches('/'))
    }
}
