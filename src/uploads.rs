use crate::config::AppConfig;
use crate::error::AppError;
use crate::metadata::NewImage;
use image::{GenericImageView, ImageFormat};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// An image as received from the client, before validation.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub original_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadRules {
    pub max_bytes: usize,
    pub allowed_extensions: HashSet<String>,
}

impl UploadRules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_bytes: config.max_upload_bytes,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }
}

/// A validated upload written to the shared directory.
///
/// `remote_path` is the same file as seen from inside the daemon's container,
/// `relative_path` is relative to the shared directory root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAsset {
    pub filename: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub sha256: String,
    pub host_path: PathBuf,
    pub remote_path: String,
    pub relative_path: String,
}

impl StoredAsset {
    pub fn to_new_image(&self) -> NewImage {
        NewImage {
            filename: self.filename.clone(),
            mime: self.mime.clone(),
            width: self.width,
            height: self.height,
            sha256: self.sha256.clone(),
            host_path: self.host_path.to_string_lossy().to_string(),
            remote_path: self.remote_path.clone(),
            relative_path: self.relative_path.clone(),
        }
    }
}

pub struct UploadStorage {
    host_dir: PathBuf,
    remote_dir: String,
    subdir: String,
}

impl UploadStorage {
    pub fn new(host_dir: impl Into<PathBuf>, remote_dir: impl Into<String>, subdir: impl Into<String>) -> Self {
        Self {
            host_dir: host_dir.into(),
            remote_dir: remote_dir.into(),
            subdir: subdir.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.host_shared_dir,
            config.remote_shared_dir.clone(),
            config.upload_subdir.clone(),
        )
    }

    /// Directory the uploads land in on this host.
    pub fn upload_dir(&self) -> PathBuf {
        self.host_dir.join(&self.subdir)
    }

    pub fn subdir(&self) -> &str {
        &self.subdir
    }

    pub async fn save_uploaded_image(
        &self,
        upload: &UploadedImage,
        rules: &UploadRules,
    ) -> Result<StoredAsset, AppError> {
        let format = validate(upload, rules)?;
        let decoded = image::load_from_memory_with_format(&upload.bytes, format)?;
        let (width, height) = decoded.dimensions();

        let mut hasher = Sha256::new();
        hasher.update(&upload.bytes);
        let sha256 = format!("{:x}", hasher.finalize());

        let ext = format.extensions_str().first().copied().unwrap_or("img");
        let filename = format!(
            "img_{}_{:08x}_full.{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            rand::random::<u32>(),
            ext
        );

        let dir = self.upload_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let host_path = dir.join(&filename);
        tokio::fs::write(&host_path, &upload.bytes).await?;
        log::debug!(
            "Stored upload '{}' ({} bytes, {}x{}) at {:?}",
            upload.original_name,
            upload.bytes.len(),
            width,
            height,
            host_path
        );

        Ok(StoredAsset {
            mime: mime_guess::from_ext(ext).first_or_octet_stream().essence_str().to_string(),
            width,
            height,
            sha256,
            host_path,
            remote_path: format!("{}/{}/{}", self.remote_dir.trim_end_matches('/'), self.subdir, filename),
            relative_path: format!("{}/{}", self.subdir, filename),
            filename,
        })
    }

    /// Deletes a stored file. Returns whether a file was removed; failures are
    /// logged and never raised.
    pub async fn discard(&self, host_path: &Path) -> bool {
        match tokio::fs::remove_file(host_path).await {
            Ok(()) => {
                log::debug!("Removed stored file {:?}", host_path);
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("Could not remove stored file {:?}: {}", host_path, e);
                false
            }
        }
    }
}

fn validate(upload: &UploadedImage, rules: &UploadRules) -> Result<ImageFormat, AppError> {
    if upload.bytes.is_empty() {
        return Err(AppError::Validation("uploaded image is empty".into()));
    }
    if upload.bytes.len() > rules.max_bytes {
        return Err(AppError::Validation(format!(
            "uploaded image is {} bytes, the limit is {}",
            upload.bytes.len(),
            rules.max_bytes
        )));
    }

    let ext = Path::new(&upload.original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !rules.allowed_extensions.contains(&ext) {
        let mut allowed: Vec<&str> = rules.allowed_extensions.iter().map(String::as_str).collect();
        allowed.sort_unstable();
        return Err(AppError::Validation(format!(
            "only {} files are accepted, got '.{}'",
            allowed.join("/"),
            ext
        )));
    }

    if let Some(declared) = upload.content_type.as_deref() {
        let declared_ok = declared
            .parse::<mime::Mime>()
            .map(|m| m.type_() == mime::IMAGE || m == mime::APPLICATION_OCTET_STREAM)
            .unwrap_or(false);
        if !declared_ok {
            return Err(AppError::Validation(format!(
                "content type '{}' is not an image",
                declared
            )));
        }
    }

    let format = image::guess_format(&upload.bytes)
        .map_err(|_| AppError::Validation("upload is not a recognizable image".into()))?;
    if !format.extensions_str().iter().any(|e| *e == ext) {
        return Err(AppError::Validation(format!(
            "file content is {:?}, which does not match extension '.{}'",
            format, ext
        )));
    }
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jpeg_bytes, png_bytes};
    use tempfile::TempDir;

    fn rules(exts: &[&str]) -> UploadRules {
        UploadRules {
            max_bytes: 1 << 20,
            allowed_extensions: exts.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn upload(name: &str, bytes: Vec<u8>) -> UploadedImage {
        UploadedImage {
            original_name: name.to_string(),
            content_type: Some("image/jpeg".to_string()),
            bytes,
        }
    }

    #[tokio::test]
    async fn stores_jpeg_with_three_paths() {
        let dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(dir.path(), "/opt/isk/data/", "upload");
        let asset = storage
            .save_uploaded_image(&upload("Cat.JPG", jpeg_bytes(32, 24)), &rules(&["jpg", "jpeg"]))
            .await
            .unwrap();

        assert_eq!((asset.width, asset.height), (32, 24));
        assert_eq!(asset.mime, "image/jpeg");
        assert!(asset.filename.starts_with("img_") && asset.filename.ends_with("_full.jpg"));
        assert_eq!(asset.host_path, dir.path().join("upload").join(&asset.filename));
        assert_eq!(asset.remote_path, format!("/opt/isk/data/upload/{}", asset.filename));
        assert_eq!(asset.relative_path, format!("upload/{}", asset.filename));
        assert_eq!(asset.sha256.len(), 64);
        assert!(asset.host_path.is_file());

        assert!(storage.discard(&asset.host_path).await);
        assert!(!asset.host_path.exists());
        assert!(!storage.discard(&asset.host_path).await);
    }

    #[tokio::test]
    async fn rejects_invalid_uploads() {
        let dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(dir.path(), "/remote", "upload");
        let jpg = rules(&["jpg", "jpeg"]);

        let cases = vec![
            (upload("a.jpg", Vec::new()), jpg.clone()),
            (upload("a.png", png_bytes(4, 4)), jpg.clone()),
            (upload("a.jpg", png_bytes(4, 4)), rules(&["jpg", "png"])),
            (upload("a.jpg", b"definitely not an image".to_vec()), jpg.clone()),
            (upload("a.jpg", jpeg_bytes(64, 64)), UploadRules { max_bytes: 10, ..jpg.clone() }),
            (
                UploadedImage {
                    content_type: Some("text/plain".into()),
                    ..upload("a.jpg", jpeg_bytes(4, 4))
                },
                jpg.clone(),
            ),
        ];
        for (upload, rules) in cases {
            let err = storage.save_uploaded_image(&upload, &rules).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{}: {:?}", upload.original_name, err);
        }
        assert!(!storage.upload_dir().exists());
    }

    #[tokio::test]
    async fn truncated_image_fails_to_decode() {
        let dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(dir.path(), "/remote", "upload");
        let mut bytes = jpeg_bytes(64, 64);
        bytes.truncate(40);
        let err = storage
            .save_uploaded_image(&upload("a.jpg", bytes), &rules(&["jpg"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Image(_)), "{:?}", err);
    }
}
