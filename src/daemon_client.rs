use crate::rpc::codec;
use crate::rpc::transport::Transport;
use crate::rpc::{MethodResponse, RpcError, RpcValue};
use serde::Serialize;
use std::sync::Arc;

/// Remote image identifier, always inside the 32-bit signed range.
pub type ImageId = i32;

/// Spellings of the database creation method across daemon builds.
const CREATE_DB_METHODS: &[&str] = &["createdb", "createDb"];
/// Spellings of the persistence method across daemon builds.
const SAVE_ALL_METHODS: &[&str] = &["saveAllDbs", "savealldbs"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub image_id: ImageId,
    pub score: f64,
}

/// Typed operations of isk-daemon for one database id.
pub struct DaemonClient {
    transport: Arc<dyn Transport>,
    db_id: i32,
}

impl DaemonClient {
    pub fn new(transport: Arc<dyn Transport>, db_id: i32) -> Self {
        Self { transport, db_id }
    }

    pub fn db_id(&self) -> i32 {
        self.db_id
    }

    pub async fn list_methods(&self) -> Result<Vec<String>, RpcError> {
        let value = self.call("system.listMethods", Vec::new()).await?;
        let items = expect_array("system.listMethods", value.as_ref())?;
        Ok(items
            .iter()
            .filter_map(RpcValue::as_str)
            .map(str::to_string)
            .collect())
    }

    pub async fn create_database(&self) -> Result<bool, RpcError> {
        let value = self
            .call_first_available(CREATE_DB_METHODS, vec![RpcValue::Int(self.db_id)])
            .await?;
        expect_bool("createdb", value.as_ref())
    }

    pub async fn reset_database(&self) -> Result<bool, RpcError> {
        let value = self.call("resetdb", vec![RpcValue::Int(self.db_id)]).await?;
        expect_bool("resetdb", value.as_ref())
    }

    pub async fn save_all_databases(&self) -> Result<bool, RpcError> {
        let value = self.call_first_available(SAVE_ALL_METHODS, Vec::new()).await?;
        expect_bool("saveAllDbs", value.as_ref())
    }

    pub async fn image_count(&self) -> Result<u64, RpcError> {
        let value = self.call("getDbImgCount", vec![RpcValue::Int(self.db_id)]).await?;
        value
            .as_ref()
            .and_then(RpcValue::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| unexpected("getDbImgCount", "a non-negative integer", value.as_ref()))
    }

    pub async fn add_image(&self, id: ImageId, path: &str) -> Result<bool, RpcError> {
        let params = vec![RpcValue::Int(self.db_id), RpcValue::Int(id), RpcValue::from(path)];
        let value = self.call("addImg", params).await?;
        expect_bool("addImg", value.as_ref())
    }

    /// Removes an image; `false` means the daemon did not know the id.
    pub async fn remove_image(&self, id: ImageId) -> Result<bool, RpcError> {
        let value = self
            .call("removeImg", vec![RpcValue::Int(self.db_id), RpcValue::Int(id)])
            .await?;
        expect_bool("removeImg", value.as_ref())
    }

    /// Nearest neighbours of an indexed image, in daemon order. Entries that
    /// are not `[id, score]` pairs are skipped.
    pub async fn query_neighbors(&self, id: ImageId, count: u32) -> Result<Vec<MatchResult>, RpcError> {
        let count = i32::try_from(count).unwrap_or(i32::MAX);
        let params = vec![RpcValue::Int(self.db_id), RpcValue::Int(id), RpcValue::Int(count)];
        let value = self.call("queryImgID", params).await?;
        let pairs = expect_array("queryImgID", value.as_ref())?;

        let matches: Vec<MatchResult> = pairs.iter().filter_map(decode_match).collect();
        if matches.len() != pairs.len() {
            log::debug!(
                "Dropped {} malformed match entries for image {}",
                pairs.len() - matches.len(),
                id
            );
        }
        Ok(matches)
    }

    /// Makes sure the database exists, creating and persisting it when the
    /// image count cannot be read.
    pub async fn ensure_database_ready(&self) -> Result<(), RpcError> {
        match self.image_count().await {
            Ok(count) => {
                log::trace!("Database {} ready with {} images", self.db_id, count);
                Ok(())
            }
            Err(e) => {
                log::info!("Database {} not readable ({}). Creating it.", self.db_id, e);
                if !self.create_database().await? {
                    return Err(RpcError::Protocol(format!(
                        "createdb returned false, database {} was not created",
                        self.db_id
                    )));
                }
                self.save_all_databases().await?;
                let count = self.image_count().await?;
                log::info!("Database {} created ({} images)", self.db_id, count);
                Ok(())
            }
        }
    }

    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<Option<RpcValue>, RpcError> {
        log::debug!("XML-RPC call {} ({} params)", method, params.len());
        let request = codec::encode_request(method, &params)?;
        log::trace!("XML-RPC request: {}", request);

        let body = self.transport.send(request).await?;
        log::trace!("XML-RPC response: {}", body);

        match codec::decode_response(&body)? {
            MethodResponse::Success(value) => Ok(value),
            MethodResponse::Fault(fault) => {
                log::debug!("XML-RPC call {} faulted: {}", method, fault);
                Err(RpcError::Fault(fault))
            }
        }
    }

    /// Tries each spelling in order. Only a "method not found" fault moves on
    /// to the next one.
    async fn call_first_available(
        &self,
        methods: &[&str],
        params: Vec<RpcValue>,
    ) -> Result<Option<RpcValue>, RpcError> {
        for method in methods {
            match self.call(method, params.clone()).await {
                Err(RpcError::Fault(fault)) if fault.is_method_not_found() => {
                    log::debug!("Daemon has no method '{}', trying next spelling", method);
                }
                result => return result,
            }
        }
        Err(RpcError::MethodUnavailable(methods.join("/")))
    }
}

fn decode_match(entry: &RpcValue) -> Option<MatchResult> {
    let pair = entry.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let image_id = pair[0].as_int().and_then(|n| ImageId::try_from(n).ok())?;
    let score = pair[1].as_f64()?;
    Some(MatchResult { image_id, score })
}

fn expect_bool(method: &str, value: Option<&RpcValue>) -> Result<bool, RpcError> {
    value
        .and_then(RpcValue::as_bool)
        .ok_or_else(|| unexpected(method, "a boolean", value))
}

fn expect_array<'a>(method: &str, value: Option<&'a RpcValue>) -> Result<&'a [RpcValue], RpcError> {
    value
        .and_then(RpcValue::as_array)
        .ok_or_else(|| unexpected(method, "an array", value))
}

fn unexpected(method: &str, wanted: &str, got: Option<&RpcValue>) -> RpcError {
    let got = match got {
        Some(v) => format!("{} {:?}", v.type_name(), v),
        None => "no value".to_string(),
    };
    RpcError::Protocol(format!("{} returned {}, expected {}", method, got, wanted))
}
