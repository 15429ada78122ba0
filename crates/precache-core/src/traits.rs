use crate::error::Result;
use crate::request::{FetchRequest, RequestKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// A complete HTTP response: status, headers and the fully read body.
///
/// Not `Clone`. A response handed to a caller and a response written to the
/// store must be two separate values obtained from [`ResponseSnapshot::duplicate`].
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Split one response into two independent copies: one for the caller,
    /// one for the store. Consumes `self` so the original can't be read again.
    pub fn duplicate(self) -> (ResponseSnapshot, ResponseSnapshot) {
        let copy = self.copy();
        (self, copy)
    }

    /// Independent copy of a stored snapshot, for stores handing out reads.
    pub(crate) fn copy(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the store may hold this response at all. Partial content is
    /// refused: a 206 body is not the resource named by the key.
    pub fn is_storable(&self) -> bool {
        self.status != 206
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub entries: usize,
    pub generations: usize,
}

/// One cache generation: request-key → response snapshot.
///
/// Writes replace a whole snapshot atomically; a snapshot is never patched.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Name of the generation this handle belongs to.
    fn generation(&self) -> &str;

    async fn match_request(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>>;

    async fn put(&self, key: RequestKey, response: ResponseSnapshot) -> Result<()>;

    /// Write several entries. Either every entry lands or the call errors.
    async fn put_all(&self, entries: Vec<(RequestKey, ResponseSnapshot)>) -> Result<()>;

    async fn keys(&self) -> Result<Vec<RequestKey>>;
}

/// The persistent store of named cache generations.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if absent.
    async fn open(&self, generation: &str) -> Result<Arc<dyn Cache>>;

    async fn has(&self, generation: &str) -> Result<bool>;

    /// Names of every generation currently in the store.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a generation. Returns whether it existed. Handles opened before
    /// the delete become orphaned: writes through them never bring it back.
    async fn delete(&self, generation: &str) -> Result<bool>;

    /// Store-level statistics, when the backend keeps any.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

/// The live network, as reached from the worker.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform exactly one fetch. HTTP error statuses are responses, not
    /// failures; only a missing response is an `Err`.
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot>;
}
