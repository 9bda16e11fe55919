//! Cold tier backends.
//!
//! The cold tier is an external, network-accessible byte store. Backends
//! report failures as [`CacheError::StoreUnavailable`]; the
//! [`CacheStore`](crate::cache::store::CacheStore) absorbs them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::cache::entry::CacheKey;
use crate::error::{CacheError, Result};

const FILE_EXTENSION: &str = "cold";

/// Cold storage backend trait.
#[async_trait]
pub trait ColdStore: Send + Sync {
    /// Get the payload stored for `key`.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Store a payload, replacing any previous one.
    async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<()>;

    /// Delete a payload. Returns whether one existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// List every stored key. Used by invalidation, never on the hot path.
    async fn keys(&self) -> Result<Vec<CacheKey>>;
}

fn unavailable(op: &'static str, reason: impl ToString) -> CacheError {
    CacheError::StoreUnavailable {
        op,
        reason: reason.to_string(),
    }
}

/// In-memory cold backend for tests and single-node deployments.
///
/// `set_available(false)` makes every call fail, to exercise degradation.
#[derive(Default)]
pub struct InMemoryColdStore {
    storage: DashMap<CacheKey, Bytes>,
    offline: AtomicBool,
}

impl InMemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(unavailable(op, "store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ColdStore for InMemoryColdStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.check("get")?;
        Ok(self.storage.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        self.check("put")?;
        self.storage.insert(key.clone(), payload);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.check("delete")?;
        Ok(self.storage.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.check("keys")?;
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }
}

/// File-backed cold store on a shared (NFS/SMB) mount.
///
/// Layout: `<base>/<first 2 hex chars>/<hex sha256(key)>.cold`. Each file
/// starts with a `u32` little-endian key length and the key itself, so
/// `keys()` needs no index and file names stay short for any key.
pub struct FileColdStore {
    base: PathBuf,
}

fn frame(key: &CacheKey, payload: &[u8]) -> Bytes {
    let key = key.as_str().as_bytes();
    let mut buf = BytesMut::with_capacity(4 + key.len() + payload.len());
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a stored file into its key and payload.
fn unframe(mut data: Bytes) -> Option<(String, Bytes)> {
    if data.len() < 4 {
        return None;
    }
    let key_len = data.get_u32_le() as usize;
    if data.len() < key_len {
        return None;
    }
    let key = String::from_utf8(data.split_to(key_len).to_vec()).ok()?;
    Some((key, data))
}

impl FileColdStore {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)
            .await
            .map_err(|e| unavailable("init", e))?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        self.base
            .join(&digest[..2])
            .join(format!("{digest}.{FILE_EXTENSION}"))
    }

    async fn read_key(path: &Path) -> std::io::Result<Option<String>> {
        let mut file = File::open(path).await?;
        let key_len = file.read_u32_le().await? as usize;
        let mut key = vec![0u8; key_len];
        file.read_exact(&mut key).await?;
        Ok(String::from_utf8(key).ok())
    }
}

#[async_trait]
impl ColdStore for FileColdStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let path = self.path_for(key);
        let data = match fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("get", e)),
        };
        match unframe(data) {
            Some((stored, payload)) if stored == key.as_str() => Ok(Some(payload)),
            Some(_) => Ok(None),
            None => Err(unavailable("get", format!("corrupt frame in {}", path.display()))),
        }
    }

    async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable("put", e))?;
        }

        // Write then rename so readers never see a torn payload.
        let tmp = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        fs::write(&tmp, frame(key, &payload))
            .await
            .map_err(|e| unavailable("put", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable("put", e))?;

        debug!(
            key = %key,
            path = %path.display(),
            size = payload.len(),
            "Wrote cold entry"
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable("delete", e)),
        }
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys = Vec::new();
        let mut shards = fs::read_dir(&self.base)
            .await
            .map_err(|e| unavailable("keys", e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| unavailable("keys", e))?
        {
            if !shard.path().is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path())
                .await
                .map_err(|e| unavailable("keys", e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| unavailable("keys", e))?
            {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                    continue;
                }
                match Self::read_key(&path).await {
                    Ok(Some(key)) => keys.push(CacheKey::from(key)),
                    Ok(None) => {}
                    // Deleted since the listing.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(unavailable("keys", e)),
                }
            }
        }

        Ok(keys)
    }
}
