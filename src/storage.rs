//! Object storage for segments and clips.
//!
//! Every backend sits behind `ObjectStore`; the pipeline never branches on
//! which one is configured. A location returned by `put` is the key itself, so
//! any store configured on the same bucket or root can resolve it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use crate::config::{StorageMode, StorageSettings};

/// Upper bound for a single object read back into memory.
pub const MAX_OBJECT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub trait ObjectStore: Send + Sync {
    /// Durably write `bytes` under `key` and return its location.
    ///
    /// The object must be fully readable by the time this returns.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    fn get(&self, location: &str) -> Result<Vec<u8>>;

    fn exists(&self, location: &str) -> Result<bool>;

    fn describe(&self) -> String;
}

pub fn captured_key(event_id: &str, segment_id: &str) -> String {
    format!("events/{event_id}/captured/{segment_id}")
}

pub fn clip_key(event_id: &str, clip_id: &str) -> String {
    format!("events/{event_id}/clips/{clip_id}")
}

/// Keys are `/`-separated and every component must be a plain file name.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 512 {
        return Err(anyhow!("object key length must be 1..=512"));
    }
    for component in key.split('/') {
        let plain = !component.is_empty()
            && component != "."
            && component != ".."
            && component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !plain {
            return Err(anyhow!("invalid object key component in {key:?}"));
        }
    }
    Ok(())
}

pub fn open_object_store(settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
    match settings.mode {
        StorageMode::Local => Ok(Arc::new(LocalObjectStore::new(&settings.root)?)),
        StorageMode::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        StorageMode::Http => {
            #[cfg(feature = "storage-http")]
            {
                let base_url = settings
                    .base_url
                    .clone()
                    .ok_or_else(|| anyhow!("storage.base_url is required for http storage"))?;
                Ok(Arc::new(HttpObjectStore::new(
                    base_url,
                    settings.token.clone(),
                )))
            }
            #[cfg(not(feature = "storage-http"))]
            {
                anyhow::bail!("http storage requires the storage-http feature")
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Local filesystem
// ----------------------------------------------------------------------------

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("create storage root {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        write_atomic(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(key.to_string())
    }

    fn get(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.path_for(location)?;
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut buf = Vec::new();
        file.take(MAX_OBJECT_BYTES)
            .read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(buf)
    }

    fn exists(&self, location: &str) -> Result<bool> {
        Ok(self.path_for(location)?.is_file())
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Readers never observe a partially written object.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("object path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    // The rename lives in the directory entry; flush it too.
    if let Some(parent) = path.parent() {
        sync_dir(parent).with_context(|| format!("sync directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

// ----------------------------------------------------------------------------
// In-memory (tests, single-process demos)
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("in-memory object store is unavailable"));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.check_available()?;
        validate_key(key)?;
        self.objects
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    fn get(&self, location: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        self.objects
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?
            .get(location)
            .cloned()
            .ok_or_else(|| anyhow!("object {location} not found"))
    }

    fn exists(&self, location: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?
            .contains_key(location))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ----------------------------------------------------------------------------
// HTTP object storage (PUT/GET/HEAD against a bucket endpoint)
// ----------------------------------------------------------------------------

#[cfg(feature = "storage-http")]
pub struct HttpObjectStore {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

#[cfg(feature = "storage-http")]
impl HttpObjectStore {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(60))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            agent,
        }
    }

    fn url_for(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }
}

#[cfg(feature = "storage-http")]
impl ObjectStore for HttpObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let url = self.url_for(key)?;
        self.authorize(self.agent.put(&url))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(bytes)
            .map_err(|e| anyhow!("PUT {url} failed: {e}"))?;
        Ok(key.to_string())
    }

    fn get(&self, location: &str) -> Result<Vec<u8>> {
        let url = self.url_for(location)?;
        let response = self
            .authorize(self.agent.get(&url))
            .call()
            .map_err(|e| anyhow!("GET {url} failed: {e}"))?;
        let mut buf = Vec::new();
        response
            .into_reader()
            .take(MAX_OBJECT_BYTES)
            .read_to_end(&mut buf)
            .with_context(|| format!("read body of {url}"))?;
        Ok(buf)
    }

    fn exists(&self, location: &str) -> Result<bool> {
        let url = self.url_for(location)?;
        match self.authorize(self.agent.head(&url)).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(anyhow!("HEAD {url} failed: {e}")),
        }
    }

    fn describe(&self) -> String {
        format!("http:{}", self.base_url)
    }
}
