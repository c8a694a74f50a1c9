//! In-process stand-in for isk-daemon, speaking the real wire format.

use crate::daemon_client::DaemonClient;
use crate::orchestrator::{IndexOrchestrator, MatchLimits};
use crate::rpc::codec;
use crate::rpc::transport::Transport;
use crate::rpc::{RpcError, RpcFault, RpcValue};
use crate::store::MetadataStore;
use crate::uploads::{UploadRules, UploadStorage};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Failure {
    Fault(i32, &'static str),
    Network,
    Garbage,
}

#[derive(Default)]
struct State {
    dbs: HashMap<i32, BTreeMap<i32, String>>,
    calls: Vec<String>,
    failures: HashMap<String, Failure>,
}

pub struct FakeDaemon {
    state: Mutex<State>,
    create_names: Vec<&'static str>,
    save_names: Vec<&'static str>,
    path_root: PathBuf,
    count_as_string: bool,
    malformed_pairs: bool,
}

impl FakeDaemon {
    pub fn new(path_root: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            create_names: vec!["createdb"],
            save_names: vec!["saveAllDbs"],
            path_root: path_root.into(),
            count_as_string: false,
            malformed_pairs: false,
        }
    }

    pub fn with_create_names(mut self, names: Vec<&'static str>) -> Self {
        self.create_names = names;
        self
    }

    pub fn with_save_names(mut self, names: Vec<&'static str>) -> Self {
        self.save_names = names;
        self
    }

    pub fn with_count_as_string(mut self) -> Self {
        self.count_as_string = true;
        self
    }

    pub fn with_malformed_pairs(mut self) -> Self {
        self.malformed_pairs = true;
        self
    }

    pub fn with_database(self, db_id: i32) -> Self {
        self.state.lock().dbs.insert(db_id, BTreeMap::new());
        self
    }

    pub fn fail(&self, method: &str, failure: Failure) {
        self.state.lock().failures.insert(method.to_string(), failure);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn image_ids(&self, db_id: i32) -> Vec<i32> {
        self.state
            .lock()
            .dbs
            .get(&db_id)
            .map(|db| db.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn insert_image(&self, db_id: i32, id: i32, path: &str) {
        self.state
            .lock()
            .dbs
            .entry(db_id)
            .or_default()
            .insert(id, path.to_string());
    }

    fn dispatch(&self, method: &str, params: &[RpcValue]) -> Result<Option<RpcValue>, RpcFault> {
        let mut state = self.state.lock();
        let int_at = |i: usize| params.get(i).and_then(RpcValue::as_int).map(|n| n as i32);

        if method == "system.listMethods" {
            let mut names: Vec<RpcValue> = ["addImg", "removeImg", "queryImgID", "getDbImgCount", "resetdb"]
                .iter()
                .chain(self.create_names.iter())
                .chain(self.save_names.iter())
                .map(|n| RpcValue::from(*n))
                .collect();
            names.push(RpcValue::Int(0));
            return Ok(Some(RpcValue::Array(names)));
        }
        if self.create_names.iter().any(|n| *n == method) {
            let db_id = int_at(0).ok_or_else(|| bad_args(method))?;
            state.dbs.entry(db_id).or_default();
            return Ok(Some(RpcValue::Bool(true)));
        }
        if self.save_names.iter().any(|n| *n == method) {
            return Ok(Some(RpcValue::Int(state.dbs.len() as i32)));
        }

        match method {
            "getDbImgCount" => {
                let db = db_mut(&mut state, int_at(0))?;
                let count = db.len() as i32;
                Ok(Some(if self.count_as_string {
                    RpcValue::Str(count.to_string())
                } else {
                    RpcValue::Int(count)
                }))
            }
            "resetdb" => {
                db_mut(&mut state, int_at(0))?.clear();
                Ok(Some(RpcValue::Bool(true)))
            }
            "addImg" => {
                let id = int_at(1).ok_or_else(|| bad_args(method))?;
                let path = params
                    .get(2)
                    .and_then(RpcValue::as_str)
                    .ok_or_else(|| bad_args(method))?
                    .to_string();
                if !self.path_root.join(&path).is_file() {
                    return Ok(Some(RpcValue::Int(0)));
                }
                db_mut(&mut state, int_at(0))?.insert(id, path);
                Ok(Some(RpcValue::Int(1)))
            }
            "removeImg" => {
                let id = int_at(1).ok_or_else(|| bad_args(method))?;
                let removed = db_mut(&mut state, int_at(0))?.remove(&id).is_some();
                Ok(Some(RpcValue::Bool(removed)))
            }
            "queryImgID" => {
                let id = int_at(1).ok_or_else(|| bad_args(method))?;
                let count = int_at(2).unwrap_or(10).max(0) as usize;
                let db = db_mut(&mut state, int_at(0))?;
                if !db.contains_key(&id) {
                    return Err(RpcFault::new(Some(1), format!("image {} not found", id)));
                }
                let mut pairs = vec![RpcValue::Array(vec![RpcValue::Int(id), RpcValue::Double(100.0)])];
                pairs.extend(db.keys().filter(|k| **k != id).map(|k| {
                    RpcValue::Array(vec![RpcValue::Int(*k), RpcValue::Double(42.5)])
                }));
                pairs.truncate(count);
                if self.malformed_pairs {
                    pairs.push(RpcValue::Array(vec![RpcValue::Int(77)]));
                    pairs.push(RpcValue::from("junk"));
                }
                Ok(Some(RpcValue::Array(pairs)))
            }
            other => Err(RpcFault::new(Some(8001), format!("procedure {} not found", other))),
        }
    }
}

fn db_mut(state: &mut State, db_id: Option<i32>) -> Result<&mut BTreeMap<i32, String>, RpcFault> {
    let db_id = db_id.ok_or_else(|| RpcFault::new(Some(2), "missing database id"))?;
    state
        .dbs
        .get_mut(&db_id)
        .ok_or_else(|| RpcFault::new(Some(1), format!("database {} not found", db_id)))
}

fn bad_args(method: &str) -> RpcFault {
    RpcFault::new(Some(2), format!("bad arguments for {}", method))
}

#[async_trait]
impl Transport for FakeDaemon {
    async fn send(&self, request: String) -> Result<String, RpcError> {
        let (method, params) = codec::decode_request(&request)?;
        let failure = {
            let mut state = self.state.lock();
            state.calls.push(method.clone());
            state.failures.get(&method).cloned()
        };

        match failure {
            Some(Failure::Network) => return Err(RpcError::Network("connection refused".into())),
            Some(Failure::Garbage) => return Ok("<html>oops".into()),
            Some(Failure::Fault(code, message)) => {
                return codec::encode_fault(&RpcFault::new(Some(code), message))
            }
            None => {}
        }

        match self.dispatch(&method, &params) {
            Ok(value) => codec::encode_response(value.as_ref()),
            Err(fault) => codec::encode_fault(&fault),
        }
    }
}

pub const TEST_DB: i32 = 2008;

/// Orchestrator over `shared_dir` whose daemon-visible paths never resolve,
/// so indexing always lands on the relative path.
pub fn orchestrator(
    shared_dir: &Path,
    daemon: Arc<FakeDaemon>,
    store: Arc<dyn MetadataStore>,
) -> IndexOrchestrator {
    IndexOrchestrator::new(
        DaemonClient::new(daemon, TEST_DB),
        store,
        UploadStorage::new(shared_dir, "/container/data", "upload"),
        UploadRules {
            max_bytes: 1 << 20,
            allowed_extensions: ["jpg", "jpeg"].iter().map(|e| e.to_string()).collect(),
        },
        MatchLimits {
            default_count: 10,
            max_count: 100,
        },
    )
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 128]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(85))
        .expect("encode test jpeg");
    bytes
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_fn(width, height, |x, _| Rgb([x as u8, 0, 0]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .expect("encode test png");
    bytes
}
