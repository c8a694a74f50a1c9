use crate::daemon_client::ImageId;
use crate::error::AppError;
use crate::metadata::{ImageRecord, NewImage};
use crate::store::{clamp_random_limit, MetadataStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    filename      TEXT NOT NULL,
    mime          TEXT NOT NULL,
    width         INTEGER NOT NULL,
    height        INTEGER NOT NULL,
    sha256        TEXT NOT NULL,
    host_path     TEXT NOT NULL,
    remote_path   TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    created_at    TEXT NOT NULL
);";

const COLUMNS: &str =
    "id, filename, mime, width, height, sha256, host_path, remote_path, relative_path, created_at";

/// Metadata rows in a single SQLite file. The connection is opened once and
/// shared; every query runs on the blocking pool.
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        log::debug!("Opening SQLite metadata store at {:?}", path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::info!("SQLite metadata store ready at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await?;
        Ok(result?)
    }
}

fn row_to_record(row: &Row<'_>) -> Result<ImageRecord, rusqlite::Error> {
    Ok(ImageRecord {
        id: row.get(0)?,
        image: NewImage {
            filename: row.get(1)?,
            mime: row.get(2)?,
            width: row.get(3)?,
            height: row.get(4)?,
            sha256: row.get(5)?,
            host_path: row.get(6)?,
            remote_path: row.get(7)?,
            relative_path: row.get(8)?,
        },
        created_at: row.get(9)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, image: &NewImage) -> Result<ImageId, AppError> {
        let image = image.clone();
        let created_at = chrono::Utc::now().to_rfc3339();
        let rowid = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO images (filename, mime, width, height, sha256, host_path, remote_path, relative_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        image.filename,
                        image.mime,
                        image.width,
                        image.height,
                        image.sha256,
                        image.host_path,
                        image.remote_path,
                        image.relative_path,
                        created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        log::debug!("Inserted metadata row {}", rowid);
        ImageId::try_from(rowid)
            .map_err(|_| AppError::Generic(format!("metadata id {} exceeds the 32-bit id range", rowid)))
    }

    async fn find(&self, id: ImageId) -> Result<Option<ImageRecord>, AppError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM images WHERE id = ?1", COLUMNS),
                params![id],
                row_to_record,
            )
            .optional()
        })
        .await
    }

    async fn find_many(&self, ids: &[ImageId]) -> Result<HashMap<ImageId, ImageRecord>, AppError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images WHERE id IN ({})",
                COLUMNS, placeholders
            ))?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_record)?;
            let mut out = HashMap::new();
            for row in rows {
                let record = row?;
                out.insert(record.id, record);
            }
            Ok(out)
        })
        .await
    }

    async fn random(&self, limit: usize) -> Result<Vec<ImageRecord>, AppError> {
        let limit = clamp_random_limit(limit) as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images ORDER BY RANDOM() LIMIT ?1",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], row_to_record)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn delete(&self, id: ImageId) -> Result<bool, AppError> {
        let deleted = self
            .with_conn(move |conn| conn.execute("DELETE FROM images WHERE id = ?1", params![id]))
            .await?;
        log::debug!("Deleted {} metadata rows for id {}", deleted, id);
        Ok(deleted > 0)
    }

    async fn truncate(&self) -> Result<(), AppError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM images", [])?;
            tx.execute("DELETE FROM sqlite_sequence WHERE name = 'images'", [])?;
            tx.commit()
        })
        .await?;
        log::info!("Metadata store truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(name: &str) -> NewImage {
        NewImage {
            filename: name.to_string(),
            mime: "image/jpeg".to_string(),
            width: 64,
            height: 48,
            sha256: "ab".repeat(32),
            host_path: format!("/data/upload/{}", name),
            remote_path: format!("/opt/isk/upload/{}", name),
            relative_path: format!("upload/{}", name),
        }
    }

    fn open_temp() -> (TempDir, SqliteMetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteMetadataStore::open(dir.path().join("db/meta.sqlite")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn ids_start_at_one_and_increase() {
        let (_dir, store) = open_temp();
        assert_eq!(store.insert(&sample("a.jpg")).await.unwrap(), 1);
        assert_eq!(store.insert(&sample("b.jpg")).await.unwrap(), 2);

        let found = store.find(2).await.unwrap().unwrap();
        assert_eq!(found.image, sample("b.jpg"));
        assert_eq!(found.url(), "/upload/b.jpg");
        assert!(store.find(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_many_maps_known_ids() {
        let (_dir, store) = open_temp();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            store.insert(&sample(name)).await.unwrap();
        }
        let found = store.find_many(&[3, 1, 1, 99]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&1].image.filename, "a.jpg");
        assert_eq!(found[&3].image.filename, "c.jpg");
        assert!(store.find_many(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() {
        let (_dir, store) = open_temp();
        let id = store.insert(&sample("a.jpg")).await.unwrap();
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn truncate_restarts_ids() {
        let (_dir, store) = open_temp();
        store.insert(&sample("a.jpg")).await.unwrap();
        store.insert(&sample("b.jpg")).await.unwrap();
        store.truncate().await.unwrap();
        assert!(store.random(10).await.unwrap().is_empty());
        assert_eq!(store.insert(&sample("c.jpg")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn random_is_clamped() {
        let (_dir, store) = open_temp();
        for i in 0..3 {
            store.insert(&sample(&format!("{}.jpg", i))).await.unwrap();
        }
        assert_eq!(store.random(0).await.unwrap().len(), 1);
        assert_eq!(store.random(500).await.unwrap().len(), 3);
    }
}
