//! Worker lifecycle: an explicit state machine plus the install and activate
//! handlers that drive it.
//!
//! ```text
//! Installing ──install ok──▶ Installed ──activate──▶ Activating ──▶ Activated
//!     ▲  │                                                              │
//!     └──┘ install failed (retry later)          replaced by newer ──▶ Redundant
//! ```

use crate::classify::{route, Route};
use crate::clients::Clients;
use crate::error::{Error, Result};
use crate::lifetime::Lifetime;
use crate::manifest::PrecacheManifest;
use crate::request::{Destination, FetchRequest, RequestKey};
use crate::strategy::{cache_first, network_first, Served};
use crate::traits::{Cache, CacheStorage, Network, ResponseSnapshot};
use futures_util::future::{join_all, try_join_all};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WorkerState {
    Installing,
    /// Installed and waiting to be activated.
    Installed,
    Activating,
    Activated,
    Redundant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    InstallSucceeded,
    InstallFailed,
    ActivateStarted,
    ActivateFinished,
    /// A newer worker finished activating.
    Replaced,
}

impl WorkerState {
    pub fn transition(self, event: LifecycleEvent) -> Result<WorkerState> {
        use LifecycleEvent::*;
        use WorkerState::*;

        match (self, event) {
            (Installing, InstallSucceeded) => Ok(Installed),
            // Install failure is fatal to the attempt, not the worker: the
            // host may retry on a later load.
            (Installing, InstallFailed) => Ok(Installing),
            (Installed, ActivateStarted) => Ok(Activating),
            (Activating, ActivateFinished) => Ok(Activated),
            (Installing | Installed | Activating | Activated, Replaced) => Ok(Redundant),
            (from, event) => Err(Error::InvalidTransition { from, event }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub generation: String,
    pub entries: usize,
    /// The worker asked to skip the waiting phase.
    pub skip_waiting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale generations removed from the store.
    pub deleted: Vec<String>,
    /// Stale generations whose deletion failed; left behind.
    pub failed: Vec<String>,
    /// Clients newly taken over.
    pub claimed: usize,
}

/// What the interceptor decided for one fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    Served(Served),
    /// Not intercepted; the host performs its default network request.
    Passthrough,
}

/// One version of the worker, bound to one cache generation.
pub struct ServiceWorker {
    manifest: PrecacheManifest,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    lifetime: Lifetime,
    skip_waiting: bool,
    state: Mutex<WorkerState>,
    cache: OnceLock<Arc<dyn Cache>>,
}

impl ServiceWorker {
    pub fn new(
        manifest: PrecacheManifest,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            manifest,
            storage,
            network,
            lifetime,
            skip_waiting: true,
            state: Mutex::new(WorkerState::Installing),
            cache: OnceLock::new(),
        }
    }

    /// Whether a successful install asks to activate immediately instead of
    /// waiting for pages controlled by the previous worker to go away.
    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    pub fn generation(&self) -> &str {
        self.manifest.version()
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.manifest
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn apply(&self, event: LifecycleEvent) -> Result<WorkerState> {
        let mut state = self.state.lock();
        let next = state.transition(event)?;
        if next != *state {
            tracing::info!(
                generation = self.generation(),
                from = ?*state,
                to = ?next,
                "worker state changed"
            );
        }
        *state = next;
        Ok(next)
    }

    /// Populate this worker's generation from the manifest.
    ///
    /// All or nothing: every URL is fetched before anything is written, and a
    /// generation created by a failed write is deleted again.
    pub async fn install(&self) -> Result<InstallOutcome> {
        let state = self.state();
        if state != WorkerState::Installing {
            return Err(Error::InvalidTransition {
                from: state,
                event: LifecycleEvent::InstallSucceeded,
            });
        }

        match self.populate().await {
            Ok((cache, entries)) => {
                let _ = self.cache.set(cache);
                self.apply(LifecycleEvent::InstallSucceeded)?;
                tracing::info!(
                    generation = self.generation(),
                    entries,
                    skip_waiting = self.skip_waiting,
                    "precache install complete"
                );
                Ok(InstallOutcome {
                    generation: self.generation().to_string(),
                    entries,
                    skip_waiting: self.skip_waiting,
                })
            }
            Err(e) => {
                self.apply(LifecycleEvent::InstallFailed)?;
                tracing::error!(generation = self.generation(), error = %e, "precache install failed");
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<(Arc<dyn Cache>, usize)> {
        let fetches = self.manifest.urls().iter().map(|url| async move {
            let request = FetchRequest::get(url.as_str(), Destination::Other);
            let response = self.network.fetch(&request).await?;
            if !response.is_ok() {
                return Err(Error::BadStatus {
                    url: url.clone(),
                    status: response.status,
                });
            }
            Ok::<(RequestKey, ResponseSnapshot), Error>((RequestKey::get(url.as_str()), response))
        });
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        let generation = self.generation();
        let existed = self.storage.has(generation).await?;
        let cache = self.storage.open(generation).await?;
        if let Err(e) = cache.put_all(entries).await {
            if !existed {
                if let Err(del) = self.storage.delete(generation).await {
                    tracing::warn!(generation, error = %del, "failed to remove partial generation");
                }
            }
            return Err(e);
        }
        Ok((cache, count))
    }

    /// Evict every other generation, then take control of open pages.
    ///
    /// Deletions are best-effort: a failure is logged and reported but never
    /// stops activation. Calling this again on an activated worker repeats the
    /// cleanup without changing state.
    pub async fn activate(&self, clients: &Clients) -> Result<ActivateReport> {
        let first_run = match self.state() {
            WorkerState::Installed => {
                self.apply(LifecycleEvent::ActivateStarted)?;
                true
            }
            WorkerState::Activated => false,
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    event: LifecycleEvent::ActivateStarted,
                })
            }
        };

        let mut report = self.evict_stale().await;
        report.claimed = clients.claim(self.generation());

        if first_run {
            self.apply(LifecycleEvent::ActivateFinished)?;
        }
        tracing::info!(
            generation = self.generation(),
            deleted = ?report.deleted,
            failed = ?report.failed,
            claimed = report.claimed,
            "worker activated"
        );
        Ok(report)
    }

    async fn evict_stale(&self) -> ActivateReport {
        let mut report = ActivateReport::default();
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "could not list cache generations, skipping cleanup");
                return report;
            }
        };

        let current = self.generation();
        let stale: Vec<String> = names.into_iter().filter(|n| n != current).collect();
        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    tracing::warn!(generation = %name, error = %e, "failed to delete stale generation");
                    report.failed.push(name);
                }
            }
        }
        report
    }

    pub fn mark_redundant(&self) -> Result<()> {
        self.apply(LifecycleEvent::Replaced).map(|_| ())
    }

    /// Handle one fetch event.
    ///
    /// `Err` is a failed resource load to be surfaced to the page as-is.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let state = self.state();
        let cache = match (state, self.cache.get()) {
            (WorkerState::Activated, Some(cache)) => cache,
            _ => {
                return Err(Error::NotActive {
                    generation: self.generation().to_string(),
                    state,
                })
            }
        };

        let route = route(request);
        let served = match route {
            Route::Passthrough => return Ok(FetchOutcome::Passthrough),
            Route::CacheFirst => {
                cache_first(cache, self.network.as_ref(), &self.lifetime, request).await?
            }
            Route::NetworkFirstWithFallback => {
                network_first(cache, self.network.as_ref(), &self.lifetime, request).await?
            }
        };
        Ok(FetchOutcome::Served(served))
    }
}
