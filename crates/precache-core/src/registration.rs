use crate::clients::Clients;
use crate::error::{Error, Result};
use crate::lifecycle::{ActivateReport, FetchOutcome, ServiceWorker, WorkerState};
use crate::lifetime::Lifetime;
use crate::manifest::PrecacheManifest;
use crate::request::{Destination, FetchRequest};
use crate::traits::{CacheStorage, Network};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The active (or waiting) worker already serves this version.
    Unchanged,
    /// Installed, but waiting for pages controlled by the old worker.
    Waiting { generation: String },
    /// Installed and activated; now serving fetches.
    Activated {
        generation: String,
        report: ActivateReport,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
    pub active: Option<String>,
    pub active_state: Option<WorkerState>,
    pub waiting: Option<String>,
    pub clients: usize,
    /// Version of the last failed install, retried on the next page load.
    pub retry: Option<String>,
}

/// Host-side owner of the worker versions for one site.
///
/// Holds at most one active and one waiting worker. Updates are serialised;
/// fetches read the active pointer without locking, so a fetch dispatched
/// before a swap finishes against the worker it started with.
///
/// A manifest whose install failed is kept and installed again on the next
/// document load.
pub struct Registration {
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    lifetime: Lifetime,
    clients: Clients,
    active: ArcSwapOption<ServiceWorker>,
    waiting: Mutex<Option<Arc<ServiceWorker>>>,
    update_lock: tokio::sync::Mutex<()>,
    failed: Mutex<Option<(PrecacheManifest, bool)>>,
    retrying: AtomicBool,
}

impl Registration {
    pub fn new(storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
        Self {
            storage,
            network,
            lifetime: Lifetime::new(),
            clients: Clients::new(),
            active: ArcSwapOption::empty(),
            waiting: Mutex::new(None),
            update_lock: tokio::sync::Mutex::new(()),
            failed: Mutex::new(None),
            retrying: AtomicBool::new(false),
        }
    }

    /// Treat clients quiet for longer than `timeout` as closed.
    pub fn with_client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.clients = Clients::with_idle_timeout(timeout);
        self
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.active.load_full()
    }

    pub fn active_generation(&self) -> Option<String> {
        self.active
            .load()
            .as_ref()
            .map(|w| w.generation().to_string())
    }

    pub fn status(&self) -> RegistrationStatus {
        let active = self.active.load_full();
        RegistrationStatus {
            active: active.as_ref().map(|w| w.generation().to_string()),
            active_state: active.as_ref().map(|w| w.state()),
            waiting: self
                .waiting
                .lock()
                .as_ref()
                .map(|w| w.generation().to_string()),
            clients: self.clients.len(),
            retry: self
                .failed
                .lock()
                .as_ref()
                .map(|(m, _)| m.version().to_string()),
        }
    }

    /// Install a worker for `manifest` and activate it when allowed.
    ///
    /// Runs as registered work on the registration's [`Lifetime`], so the
    /// install and activation finish even if the caller goes away.
    pub async fn register(
        self: &Arc<Self>,
        manifest: PrecacheManifest,
        skip_waiting: bool,
    ) -> Result<UpdateOutcome> {
        let this = Arc::clone(self);
        self.lifetime
            .wait_until(async move { this.install_or_remember(manifest, skip_waiting).await })
            .await
            .map_err(|e| Error::Aborted(e.to_string()))?
    }

    /// Activate the waiting worker now, regardless of controlled pages.
    pub async fn activate_waiting(self: &Arc<Self>) -> Result<UpdateOutcome> {
        let this = Arc::clone(self);
        self.lifetime
            .wait_until(async move {
                let _guard = this.update_lock.lock().await;
                this.promote().await
            })
            .await
            .map_err(|e| Error::Aborted(e.to_string()))?
    }

    /// Run an update. A failed install keeps its manifest for the next retry;
    /// any successful update clears it.
    async fn install_or_remember(
        &self,
        manifest: PrecacheManifest,
        skip_waiting: bool,
    ) -> Result<UpdateOutcome> {
        let pending = manifest.clone();
        let result = self.update(manifest, skip_waiting).await;
        let mut failed = self.failed.lock();
        match &result {
            Ok(_) => *failed = None,
            Err(_) => *failed = Some((pending, skip_waiting)),
        }
        result
    }

    /// Start a background install of the last failed manifest, unless one is
    /// already running.
    fn retry_failed_install(self: &Arc<Self>) {
        let Some((manifest, skip_waiting)) = self.failed.lock().clone() else {
            return;
        };
        if self
            .retrying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::info!(generation = manifest.version(), "retrying failed precache install");
        let this = Arc::clone(self);
        drop(self.lifetime.wait_until(async move {
            let version = manifest.version().to_string();
            match this.install_or_remember(manifest, skip_waiting).await {
                Ok(outcome) => {
                    tracing::info!(generation = %version, outcome = ?outcome, "precache install retry succeeded")
                }
                Err(e) => {
                    tracing::warn!(generation = %version, error = %e, "precache install retry failed")
                }
            }
            this.retrying.store(false, Ordering::Release);
        }));
    }

    /// Drop idle clients, then activate the waiting worker if the active one
    /// no longer controls any page. Returns the activation, if one happened.
    pub async fn expire_clients(self: &Arc<Self>) -> Result<Option<UpdateOutcome>> {
        self.clients.expire_idle();
        let nothing_waiting = self.waiting.lock().is_none();
        if nothing_waiting {
            return Ok(None);
        }

        let this = Arc::clone(self);
        self.lifetime
            .wait_until(async move {
                let _guard = this.update_lock.lock().await;
                let still_controlled = this
                    .active
                    .load()
                    .as_ref()
                    .is_some_and(|w| this.clients.controlled_by(w.generation()) > 0);
                let nothing_waiting = this.waiting.lock().is_none();
                if still_controlled || nothing_waiting {
                    return Ok(None);
                }
                tracing::info!("controlled pages closed, activating waiting worker");
                this.promote().await.map(Some)
            })
            .await
            .map_err(|e| Error::Aborted(e.to_string()))?
    }

    async fn update(&self, manifest: PrecacheManifest, skip_waiting: bool) -> Result<UpdateOutcome> {
        let _guard = self.update_lock.lock().await;

        let current = self.active.load_full();
        let pending = self.waiting.lock().clone();
        for existing in current.iter().chain(pending.iter()) {
            if existing.generation() == manifest.version() {
                if existing.manifest() != &manifest {
                    tracing::warn!(
                        generation = manifest.version(),
                        "manifest changed without a version bump, keeping the installed generation"
                    );
                }
                return Ok(UpdateOutcome::Unchanged);
            }
        }

        let worker = Arc::new(
            ServiceWorker::new(
                manifest,
                Arc::clone(&self.storage),
                Arc::clone(&self.network),
                self.lifetime.clone(),
            )
            .with_skip_waiting(skip_waiting),
        );
        let outcome = worker.install().await?;

        if let Some(superseded) = self.waiting.lock().replace(Arc::clone(&worker)) {
            let _ = superseded.mark_redundant();
        }

        let must_wait = !outcome.skip_waiting
            && current
                .as_ref()
                .is_some_and(|w| self.clients.controlled_by(w.generation()) > 0);
        if must_wait {
            tracing::info!(
                generation = %outcome.generation,
                "new worker installed, waiting for controlled pages to close"
            );
            return Ok(UpdateOutcome::Waiting {
                generation: outcome.generation,
            });
        }

        self.promote().await
    }

    /// Activate the waiting worker and make it the one fetches go to.
    /// Caller holds `update_lock`.
    async fn promote(&self) -> Result<UpdateOutcome> {
        let waiting = self.waiting.lock().take();
        let Some(worker) = waiting else {
            return Ok(UpdateOutcome::Unchanged);
        };

        // Cleanup must finish before the new generation sees any fetch.
        let report = worker.activate(&self.clients).await?;
        let previous = self.active.swap(Some(Arc::clone(&worker)));
        if let Some(previous) = previous {
            if let Err(e) = previous.mark_redundant() {
                tracing::warn!(generation = previous.generation(), error = %e, "could not retire previous worker");
            }
        }

        Ok(UpdateOutcome::Activated {
            generation: worker.generation().to_string(),
            report,
        })
    }

    /// Route one fetch event through the active worker. With no active worker
    /// every request passes through.
    ///
    /// A document load also retries a previously failed install.
    pub async fn dispatch_fetch(
        self: &Arc<Self>,
        request: &FetchRequest,
        client: Option<&str>,
    ) -> Result<FetchOutcome> {
        if request.destination == Destination::Document {
            self.retry_failed_install();
        }

        let mut worker = self.active.load_full();
        if let Some(client) = client {
            self.clients
                .observe(client, worker.as_ref().map(|w| w.generation()));
        }

        loop {
            let Some(current) = worker else {
                return Ok(FetchOutcome::Passthrough);
            };
            match current.handle_fetch(request).await {
                // Lost a race with activation of a newer worker: go to that one.
                Err(Error::NotActive { .. }) => {
                    let latest = self.active.load_full();
                    if latest.as_ref().is_some_and(|l| Arc::ptr_eq(l, &current)) {
                        return Err(Error::NotActive {
                            generation: current.generation().to_string(),
                            state: current.state(),
                        });
                    }
                    worker = latest;
                }
                other => return other,
            }
        }
    }

    /// Wait for every in-flight install, activation and cache write.
    pub async fn shutdown(&self) {
        tracing::info!(pending = self.lifetime.pending(), "waiting for pending cache work");
        self.lifetime.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::request::{Destination, RequestKey};
    use crate::strategy::Source;
    use crate::testing::FakeNetwork;

    fn manifest(version: &str) -> PrecacheManifest {
        PrecacheManifest::new(version, vec!["/".into(), "/css/style.min.css".into()]).unwrap()
    }

    fn setup() -> (Arc<Registration>, Arc<MemoryStorage>, FakeNetwork) {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::new();
        network.serve("/", 200, "home");
        network.serve("/css/style.min.css", 200, "css");
        let registration = Arc::new(Registration::new(
            storage.clone(),
            Arc::new(network.clone()),
        ));
        (registration, storage, network)
    }

    #[tokio::test]
    async fn passthrough_until_first_activation() {
        let (registration, _, _) = setup();
        let req = FetchRequest::get("/css/style.min.css", Destination::Style);
        assert!(matches!(
            registration.dispatch_fetch(&req, None).await.unwrap(),
            FetchOutcome::Passthrough
        ));

        let outcome = registration.register(manifest("v1"), true).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Activated { ref generation, .. } if generation == "v1"));
        match registration.dispatch_fetch(&req, None).await.unwrap() {
            FetchOutcome::Served(s) => assert_eq!(s.source, Source::Cache),
            other => panic!("expected served, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_version_is_unchanged() {
        let (registration, _, network) = setup();
        registration.register(manifest("v1"), true).await.unwrap();
        let calls = network.calls();

        let outcome = registration.register(manifest("v1"), true).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(network.calls(), calls);
    }

    #[tokio::test]
    async fn new_version_replaces_old_generation() {
        let (registration, storage, _) = setup();
        registration.register(manifest("v1"), true).await.unwrap();
        let first = registration.active().unwrap();
        registration
            .dispatch_fetch(&FetchRequest::get("/", Destination::Document), Some("tab-1"))
            .await
            .unwrap();

        let outcome = registration.register(manifest("v2"), true).await.unwrap();
        match outcome {
            UpdateOutcome::Activated { generation, report } => {
                assert_eq!(generation, "v2");
                assert_eq!(report.deleted, vec!["v1".to_string()]);
                assert_eq!(report.claimed, 1);
            }
            other => panic!("expected activation, got {other:?}"),
        }

        assert_eq!(first.state(), WorkerState::Redundant);
        assert_eq!(registration.active_generation().as_deref(), Some("v2"));
        let css = FetchRequest::get("/css/style.min.css", Destination::Style);
        match registration.dispatch_fetch(&css, None).await.unwrap() {
            FetchOutcome::Served(s) => assert_eq!(s.generation, "v2"),
            other => panic!("expected served, got {other:?}"),
        }
        registration.shutdown().await;
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn failed_install_keeps_serving_old_version() {
        let (registration, storage, network) = setup();
        registration.register(manifest("v1"), true).await.unwrap();

        network.unroute("/css/style.min.css");
        assert!(registration.register(manifest("v2"), true).await.is_err());

        assert_eq!(registration.active_generation().as_deref(), Some("v1"));
        assert_eq!(storage.keys().await.unwrap(), vec!["v1".to_string()]);
        assert!(registration.status().waiting.is_none());
    }

    #[tokio::test]
    async fn waits_for_controlled_clients_without_skip_waiting() {
        let (registration, storage, _) = setup();
        registration.register(manifest("v1"), true).await.unwrap();
        registration
            .dispatch_fetch(&FetchRequest::get("/", Destination::Document), Some("tab-1"))
            .await
            .unwrap();

        let outcome = registration.register(manifest("v2"), false).await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Waiting {
                generation: "v2".into()
            }
        );
        assert_eq!(registration.active_generation().as_deref(), Some("v1"));
        assert_eq!(registration.status().waiting.as_deref(), Some("v2"));
        // Both generations coexist until activation.
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["v1".to_string(), "v2".to_string()]
        );

        let outcome = registration.activate_waiting().await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Activated { .. }));
        assert_eq!(registration.active_generation().as_deref(), Some("v2"));
        assert_eq!(registration.clients().controller_of("tab-1").as_deref(), Some("v2"));
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn no_controlled_clients_means_no_wait() {
        let (registration, _, _) = setup();
        registration.register(manifest("v1"), true).await.unwrap();

        let outcome = registration.register(manifest("v2"), false).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Activated { .. }));
    }

    #[tokio::test]
    async fn offline_document_falls_back_through_registration() {
        let (registration, _, network) = setup();
        registration.register(manifest("v1"), true).await.unwrap();
        network.go_offline();

        let req = FetchRequest::get("/", Destination::Document);
        match registration.dispatch_fetch(&req, None).await.unwrap() {
            FetchOutcome::Served(s) => {
                assert_eq!(s.source, Source::Fallback);
                assert_eq!(s.response.body, "home");
            }
            other => panic!("expected fallback, got {other:?}"),
        }

        let missing = FetchRequest::get("/about.html", Destination::Document);
        assert!(registration.dispatch_fetch(&missing, None).await.is_err());
        network.go_online();
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_writes() {
        let (registration, storage, network) = setup();
        registration.register(manifest("v1"), true).await.unwrap();
        network.serve("/js/late.js", 200, "late()");

        let req = FetchRequest::get("/js/late.js", Destination::Script);
        registration.dispatch_fetch(&req, None).await.unwrap();
        registration.shutdown().await;

        let cache = storage.open("v1").await.unwrap();
        assert!(cache
            .match_request(&RequestKey::get("/js/late.js"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn document_load_retries_failed_install() {
        let (registration, storage, network) = setup();
        network.unroute("/css/style.min.css");
        assert!(registration.register(manifest("v1"), true).await.is_err());
        assert_eq!(registration.status().retry.as_deref(), Some("v1"));

        // Assets load normally without triggering a retry.
        let asset = FetchRequest::get("/css/style.min.css", Destination::Style);
        registration.dispatch_fetch(&asset, None).await.unwrap();
        registration.lifetime().settle().await;
        assert!(storage.keys().await.unwrap().is_empty());

        // Origin recovers; the next page load installs in the background.
        network.serve("/css/style.min.css", 200, "css");
        let doc = FetchRequest::get("/", Destination::Document);
        assert!(matches!(
            registration.dispatch_fetch(&doc, None).await.unwrap(),
            FetchOutcome::Passthrough
        ));
        registration.lifetime().settle().await;

        assert_eq!(storage.keys().await.unwrap(), vec!["v1".to_string()]);
        assert_eq!(registration.active_generation().as_deref(), Some("v1"));
        assert!(registration.status().retry.is_none());

        match registration.dispatch_fetch(&asset, None).await.unwrap() {
            FetchOutcome::Served(s) => assert_eq!(s.source, Source::Cache),
            other => panic!("expected served, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_that_fails_again_stays_pending() {
        let (registration, storage, network) = setup();
        network.go_offline();
        assert!(registration.register(manifest("v1"), true).await.is_err());

        let doc = FetchRequest::get("/", Destination::Document);
        for _ in 0..3 {
            registration.dispatch_fetch(&doc, None).await.unwrap();
        }
        registration.lifetime().settle().await;

        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(registration.status().retry.as_deref(), Some("v1"));
        network.go_online();
    }

    #[tokio::test]
    async fn waiting_worker_activates_once_controlled_client_goes_idle() {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::new();
        network.serve("/", 200, "home");
        network.serve("/css/style.min.css", 200, "css");
        let registration = Arc::new(
            Registration::new(storage.clone(), Arc::new(network.clone()))
                .with_client_idle_timeout(Duration::from_millis(30)),
        );

        registration.register(manifest("v1"), true).await.unwrap();
        registration
            .dispatch_fetch(&FetchRequest::get("/", Destination::Document), Some("10.0.0.7"))
            .await
            .unwrap();
        let outcome = registration.register(manifest("v2"), false).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Waiting { .. }));

        // The page is still open: nothing changes.
        assert_eq!(registration.expire_clients().await.unwrap(), None);
        assert_eq!(registration.active_generation().as_deref(), Some("v1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let outcome = registration.expire_clients().await.unwrap();
        assert!(matches!(
            outcome,
            Some(UpdateOutcome::Activated { ref generation, .. }) if generation == "v2"
        ));
        assert_eq!(registration.active_generation().as_deref(), Some("v2"));
        assert!(registration.clients().is_empty());
        assert!(registration.status().waiting.is_none());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
    }
}
