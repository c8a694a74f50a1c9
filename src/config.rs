use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use config::{Config, ConfigError, Environment, File};
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub web_port: u16,
    pub static_directory: String,

    pub daemon_host: String,
    pub daemon_port: u16,
    pub daemon_rpc_path: String,
    pub daemon_timeout_secs: u64,
    pub daemon_db_id: i32,

    pub host_shared_dir: String,
    pub remote_shared_dir: String,
    pub upload_subdir: String,
    pub allowed_extensions: HashSet<String>,
    pub max_upload_bytes: usize,

    pub metadata_engine: String,
    pub sqlite_path: String,

    pub default_match_count: u32,
    pub max_match_count: u32,
}

impl AppConfig {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let layer = |name: &str| dir.join(name).to_string_lossy().to_string();

        let s = Config::builder()
            .add_source(File::with_name(&layer("default")))
            .add_source(File::with_name(&layer(&env)).required(false))
            .add_source(File::with_name(&layer("local")).required(false))
            .add_source(
                Environment::with_prefix("ISK_GATEWAY")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_extensions"),
            )
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.default_match_count == 0 || self.max_match_count < self.default_match_count {
            return Err(ConfigError::Message(format!(
                "match counts must satisfy 0 < default_match_count ({}) <= max_match_count ({})",
                self.default_match_count, self.max_match_count
            )));
        }
        if self.daemon_timeout_secs == 0 {
            return Err(ConfigError::Message("daemon_timeout_secs must be positive".into()));
        }
        self.daemon_endpoint()?;
        Ok(())
    }

    pub fn daemon_endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&format!("http://{}:{}", self.daemon_host, self.daemon_port))
            .map_err(|e| ConfigError::Message(format!("invalid daemon address: {}", e)))?;
        url.set_path(&self.daemon_rpc_path);
        Ok(url)
    }

    pub fn daemon_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon_timeout_secs)
    }
}
