//! In-memory doubles for the network and for a misbehaving store.

use crate::error::{Error, Result};
use crate::memory::MemoryStorage;
use crate::request::{FetchRequest, RequestKey};
use crate::traits::{Cache, CacheStorage, Network, ResponseSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct FakeNetwork {
    routes: Arc<Mutex<HashMap<String, (u16, Bytes)>>>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, status: u16, body: &'static str) {
        self.routes
            .lock()
            .insert(url.to_string(), (status, Bytes::from_static(body.as_bytes())));
    }

    /// Make one URL unreachable.
    pub fn unroute(&self, url: &str) {
        self.routes.lock().remove(url);
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::network(&request.url, "offline"));
        }
        let routes = self.routes.lock();
        match routes.get(&request.url) {
            Some((status, body)) => Ok(ResponseSnapshot::new(*status, vec![], body.clone())),
            None => Err(Error::network(&request.url, "connection refused")),
        }
    }
}

/// Wraps [`MemoryStorage`] and fails chosen operations.
#[derive(Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    pub failing_deletes: Mutex<HashSet<String>>,
    pub fail_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

struct FlakyCache {
    inner: Arc<dyn Cache>,
    fail_writes: bool,
}

#[async_trait]
impl Cache for FlakyCache {
    fn generation(&self) -> &str {
        self.inner.generation()
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
        self.inner.match_request(key).await
    }

    async fn put(&self, key: RequestKey, response: ResponseSnapshot) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.put(key, response).await
    }

    async fn put_all(&self, entries: Vec<(RequestKey, ResponseSnapshot)>) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.put_all(entries).await
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        self.inner.keys().await
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, generation: &str) -> Result<Arc<dyn Cache>> {
        Ok(Arc::new(FlakyCache {
            inner: self.inner.open(generation).await?,
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
        }))
    }

    async fn has(&self, generation: &str) -> Result<bool> {
        self.inner.has(generation).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        if self.failing_deletes.lock().contains(generation) {
            return Err(Error::Store(format!("cannot delete {generation}")));
        }
        self.inner.delete(generation).await
    }
}
