//! Offline caching layer for a static site.
//!
//! A [`Registration`] owns versioned [`ServiceWorker`]s. Each worker precaches
//! its [`PrecacheManifest`] into one cache generation on install, evicts every
//! other generation on activate, and then answers fetch events: static assets
//! cache-first, documents network-first with a cached fallback, everything
//! else passed through.

pub mod classify;
pub mod clients;
pub mod disk;
pub mod error;
pub mod lifecycle;
pub mod lifetime;
pub mod manifest;
pub mod memory;
pub mod registration;
pub mod request;
pub mod strategy;
pub mod traits;

#[cfg(test)]
mod testing;

pub use classify::{route, Route};
pub use error::{Error, Result};
pub use lifecycle::{FetchOutcome, ServiceWorker, WorkerState};
pub use manifest::PrecacheManifest;
pub use registration::{Registration, UpdateOutcome};
pub use request::{Destination, FetchRequest, RequestKey};
pub use strategy::{Served, Source};
pub use traits::{Cache, CacheStats, CacheStorage, Network, ResponseSnapshot};
