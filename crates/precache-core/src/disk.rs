//! Persistent cache storage on the local filesystem.
//!
//! Layout: one directory per generation (hex-encoded name) under the root,
//! one file per entry named by the sha256 of its key. An entry file is a JSON
//! metadata line followed by the raw body. Every write goes to a temp file
//! first and is renamed into place, so readers see either the old snapshot or
//! the new one, never a mix. Leftovers of interrupted writes and deletes are
//! swept when the store is opened.

use crate::error::{Error, Result};
use crate::request::RequestKey;
use crate::traits::{Cache, CacheStorage, ResponseSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";
const TRASH_PREFIX: &str = ".trash-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
}

/// Cache storage rooted at a directory.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Use `root` as the store, creating it if needed.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let swept = sweep_leftovers(&root).await?;
        tracing::info!(root = %root.display(), swept, "disk cache storage ready");
        Ok(Self { root })
    }

    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(hex::encode(generation.as_bytes()))
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, generation: &str) -> Result<Arc<dyn Cache>> {
        let dir = self.generation_dir(generation);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Arc::new(DiskCache {
            name: generation.to_string(),
            dir,
        }))
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        match tokio::fs::metadata(self.generation_dir(generation)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name.to_str() else {
                continue;
            };
            if encoded.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            match hex::decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(name) => names.push(name),
                None => tracing::warn!(dir = encoded, "ignoring unrecognised directory in cache root"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        let dir = self.generation_dir(generation);
        let trash = self.root.join(format!(
            "{TRASH_PREFIX}{}-{}",
            hex::encode(generation.as_bytes()),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        // Renaming first takes the generation out of `keys()` in one step.
        match tokio::fs::rename(&dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        // The generation is gone once renamed; a failed removal only leaves
        // trash for the next sweep.
        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            tracing::warn!(generation, trash = %trash.display(), error = %e, "failed to remove deleted generation");
        }
        Ok(true)
    }
}

/// Remove trash directories left by interrupted deletes and temp files left
/// by interrupted writes. Returns how many were removed.
async fn sweep_leftovers(root: &Path) -> Result<usize> {
    let mut swept = 0;
    let mut dir = tokio::fs::read_dir(root).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let is_trash = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TRASH_PREFIX));
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if is_trash {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => swept += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to sweep trash"),
            }
            continue;
        }

        let mut generation = tokio::fs::read_dir(&path).await?;
        while let Some(file) = generation.next_entry().await? {
            let file_path = file.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(TMP_EXT) {
                continue;
            }
            match tokio::fs::remove_file(&file_path).await {
                Ok(()) => swept += 1,
                Err(e) => {
                    tracing::warn!(path = %file_path.display(), error = %e, "failed to sweep temp file")
                }
            }
        }
    }
    Ok(swept)
}

/// One generation directory.
pub struct DiskCache {
    name: String,
    dir: PathBuf,
}

impl DiskCache {
    fn entry_path(&self, key: &RequestKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        self.dir
            .join(format!("{}.{ENTRY_EXT}", hex::encode(hasher.finalize())))
    }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(
            ".{}.{TMP_EXT}",
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        PathBuf::from(name)
    }

    fn orphaned(&self, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::Store(format!("generation {} was deleted", self.name))
        } else {
            e.into()
        }
    }

    /// Write an entry to a temp file next to its final path. Returns both paths.
    async fn stage(
        &self,
        key: &RequestKey,
        response: &ResponseSnapshot,
    ) -> Result<(PathBuf, PathBuf)> {
        let meta = EntryMeta {
            url: key.url().to_string(),
            status: response.status,
            headers: response.headers.clone(),
        };
        let mut contents = serde_json::to_vec(&meta).map_err(|e| Error::Store(e.to_string()))?;
        contents.push(b'\n');
        contents.extend_from_slice(&response.body);

        let path = self.entry_path(key);
        let tmp = self.tmp_path(&path);
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| self.orphaned(e))?;
        Ok((tmp, path))
    }

    async fn commit(&self, tmp: &Path, path: &Path) -> Result<()> {
        if let Err(e) = tokio::fs::rename(tmp, path).await {
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(self.orphaned(e));
        }
        Ok(())
    }
}

fn parse_entry(raw: Vec<u8>) -> Result<(EntryMeta, Bytes)> {
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::Corrupt("missing metadata line".to_string()))?;
    let meta: EntryMeta =
        serde_json::from_slice(&raw[..split]).map_err(|e| Error::Corrupt(e.to_string()))?;
    let body = Bytes::from(raw).slice(split + 1..);
    Ok((meta, body))
}

#[async_trait]
impl Cache for DiskCache {
    fn generation(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
        let raw = match tokio::fs::read(self.entry_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (meta, body) = parse_entry(raw)?;
        if meta.url != key.url() {
            return Ok(None);
        }
        Ok(Some(ResponseSnapshot {
            status: meta.status,
            headers: meta.headers,
            body,
        }))
    }

    async fn put(&self, key: RequestKey, response: ResponseSnapshot) -> Result<()> {
        let (tmp, path) = self.stage(&key, &response).await?;
        self.commit(&tmp, &path).await
    }

    async fn put_all(&self, entries: Vec<(RequestKey, ResponseSnapshot)>) -> Result<()> {
        // Stage everything before the first rename so a failed write leaves
        // no new entry behind.
        let mut staged = Vec::with_capacity(entries.len());
        for (key, response) in &entries {
            match self.stage(key, response).await {
                Ok(paths) => staged.push(paths),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = tokio::fs::remove_file(tmp).await;
                    }
                    return Err(e);
                }
            }
        }
        for (i, (tmp, path)) in staged.iter().enumerate() {
            if let Err(e) = self.commit(tmp, path).await {
                for (rest, _) in &staged[i + 1..] {
                    let _ = tokio::fs::remove_file(rest).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| self.orphaned(e))?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let file = tokio::fs::File::open(&path).await?;
            let mut line = String::new();
            tokio::io::BufReader::new(file).read_line(&mut line).await?;
            let meta: EntryMeta =
                serde_json::from_str(line.trim_end()).map_err(|e| Error::Corrupt(e.to_string()))?;
            keys.push(RequestKey::get(meta.url));
        }
        keys.sort();
        Ok(keys)
    }
}
