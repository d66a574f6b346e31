//! Persistence + load boundary for Grantboard: key-value state, the discard
//! ledger, the admin toggle and the opportunity document sources.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use grantboard_core::{DiscardSet, DuplicateId, Opportunity, OpportunityId, OpportunityStore};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "grantboard-storage";

/// Key holding the JSON array of discarded ids.
pub const DISCARDED_KEY: &str = "discarded_opportunities";
/// Key holding the admin capability flag.
pub const ADMIN_KEY: &str = "admin";

const STATE_FILE_NAME: &str = "storage.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding stored value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// String key-value facility scoped to one user profile.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: BTreeMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key-value store kept as one JSON object on disk, rewritten on every mutation.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileKeyValueStore {
    /// Opens (or creates) the state file under `root`. An unreadable or corrupt
    /// file is treated as empty.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("creating state directory {}", root.display()))?;
        let path = root.join(STATE_FILE_NAME);

        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "state file is not a JSON object; starting empty");
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "state file unreadable; starting empty");
                BTreeMap::new()
            }
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the whole map via a temp file and rename so readers never see a torn file.
    fn flush(&self) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        let temp_path = self.path.with_extension(format!("{}.tmp", std::process::id()));

        let write_temp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        if let Err(err) = write_temp() {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(err));
        }
        fs::rename(&temp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            io_err(err)
        })
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Ordered, grow-only set of permanently hidden ids.
#[derive(Debug, Clone, Default)]
pub struct DiscardLedger {
    ids: Vec<OpportunityId>,
    index: HashSet<OpportunityId>,
}

impl DiscardLedger {
    /// Reads the ledger; absent or unparsable state yields an empty ledger.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let Some(raw) = store.get(DISCARDED_KEY) else {
            return Self::default();
        };
        match serde_json::from_str::<Vec<OpportunityId>>(&raw) {
            Ok(ids) => {
                let mut ledger = Self::default();
                for id in ids {
                    ledger.insert(id);
                }
                ledger
            }
            Err(err) => {
                warn!(%err, "discard ledger is corrupt; treating as empty");
                Self::default()
            }
        }
    }

    pub fn contains(&self, id: &OpportunityId) -> bool {
        self.index.contains(id)
    }

    pub fn ids(&self) -> &[OpportunityId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn insert(&mut self, id: OpportunityId) -> bool {
        if self.index.insert(id.clone()) {
            self.ids.push(id);
            true
        } else {
            false
        }
    }

    /// Records `id` and persists the full ledger. Returns `false` when the id
    /// was already present, in which case nothing is written.
    ///
    /// The id stays in memory even if the write fails.
    pub fn add(
        &mut self,
        id: OpportunityId,
        store: &mut dyn KeyValueStore,
    ) -> Result<bool, StorageError> {
        if !self.insert(id) {
            return Ok(false);
        }
        let json = serde_json::to_string(&self.ids)?;
        store.set(DISCARDED_KEY, &json)?;
        Ok(true)
    }
}

impl DiscardSet for DiscardLedger {
    fn is_discarded(&self, id: &OpportunityId) -> bool {
        self.contains(id)
    }
}

/// Requested change to the admin flag, as carried by an `admin=` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminToggle {
    Grant,
    Revoke,
    Keep,
}

impl AdminToggle {
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            Some("true") => Self::Grant,
            Some("false") => Self::Revoke,
            _ => Self::Keep,
        }
    }
}

/// Applies `toggle` to the persisted flag and returns the resulting capability.
///
/// This is a UI toggle, not authentication.
pub fn resolve_admin(
    store: &mut dyn KeyValueStore,
    toggle: AdminToggle,
) -> Result<bool, StorageError> {
    match toggle {
        AdminToggle::Grant => store.set(ADMIN_KEY, "true")?,
        AdminToggle::Revoke => store.remove(ADMIN_KEY)?,
        AdminToggle::Keep => {}
    }
    Ok(is_admin(store))
}

pub fn is_admin(store: &dyn KeyValueStore) -> bool {
    store.get(ADMIN_KEY).as_deref() == Some("true")
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed opportunity document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed opportunity document: {0}")]
    Duplicate(#[from] DuplicateId),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Where the opportunity document comes from.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<u8>, LoadError>;
}

/// Single-attempt HTTP GET; any non-success status is a load failure.
#[derive(Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, config: &HttpClientConfig) -> Result<Self, LoadError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OpportunitySource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<u8>, LoadError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(http_status_error(status, final_url));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

fn http_status_error(status: StatusCode, url: String) -> LoadError {
    LoadError::HttpStatus {
        status: status.as_u16(),
        url,
    }
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OpportunitySource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>, LoadError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| LoadError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Picks an HTTP source for `http(s)://` locations and a file source otherwise.
pub fn source_for_location(
    location: &str,
    config: &HttpClientConfig,
) -> Result<Box<dyn OpportunitySource>, LoadError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpSource::new(location, config)?))
    } else {
        Ok(Box::new(FileSource::new(location)))
    }
}

pub fn parse_opportunities(bytes: &[u8]) -> Result<OpportunityStore, LoadError> {
    let records: Vec<Opportunity> = serde_json::from_slice(bytes)?;
    Ok(OpportunityStore::new(records)?)
}

/// Fetches and parses the document once. No retry on failure.
pub async fn load_opportunities(
    source: &dyn OpportunitySource,
) -> Result<OpportunityStore, LoadError> {
    let location = source.describe();
    let span = info_span!("load_opportunities", source = %location);
    async move {
        let bytes = source.fetch().await?;
        debug!(bytes = bytes.len(), "fetched opportunity document");
        let store = parse_opportunities(&bytes)?;
        info!(records = store.len(), "loaded opportunities");
        Ok(store)
    }
    .instrument(span)
    .await
}
