//! The cache controller: one service worker instance.
//!
//! Owns the name of the authoritative bucket, serves intercepted fetches,
//! and polls the version descriptor once active.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::{join_all, try_join_all};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method};
use pwakit_common::with_timeout;
use pwakit_core::{AppConfig, PageMessage, VersionDescriptor, WorkerMessage};
use pwakit_net::{CacheMode, Fetcher, NetError, Request, Response};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientMatchOptions, Clients};
use crate::routing::{Fallback, RoutingTable, Strategy};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

/// Result of one version check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Nothing cached yet; the descriptor was stored, nobody was notified.
    FirstRun { version: String },
    /// Same version as the cached descriptor.
    UpToDate { version: String },
    /// A different version was found and applied.
    Updated {
        old_version: String,
        new_version: String,
        notified: usize,
    },
    /// Another check is applying an update right now.
    AlreadyApplying,
    /// The descriptor could not be fetched or parsed.
    Failed(ServiceWorkerError),
}

impl CheckOutcome {
    pub fn is_update(&self) -> bool {
        matches!(self, CheckOutcome::Updated { .. })
    }
}

/// A response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    /// Served from a cache bucket rather than the network.
    pub from_cache: bool,
}

impl FetchResponse {
    fn network(response: Response) -> Self {
        Self {
            response,
            from_cache: false,
        }
    }

    fn cached(response: Response) -> Self {
        Self {
            response,
            from_cache: true,
        }
    }
}

/// A single service worker instance.
pub struct CacheController {
    id: ServiceWorkerId,
    config: Arc<AppConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    routes: RoutingTable,

    /// Pages under this prefix are claimed on activation.
    scope: Url,
    version_url: Url,
    metadata_url: Url,
    assets: Vec<Url>,

    /// Authoritative bucket. Lock order: `caches` before `cache_name`.
    cache_name: Arc<RwLock<String>>,
    state: RwLock<ServiceWorkerState>,
    skip_waiting: AtomicBool,

    /// Held while a check reads, compares and rewrites the caches.
    update_guard: Mutex<()>,
    /// Newest descriptor fetched while `update_guard` was held elsewhere.
    pending: StdMutex<Option<VersionDescriptor>>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    timer_arms: AtomicUsize,
    background: StdMutex<JoinSet<()>>,
}

impl CacheController {
    /// Create a controller. Nothing is fetched until [`install`](Self::install).
    pub fn new(
        config: Arc<AppConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
    ) -> Result<Arc<Self>, ServiceWorkerError> {
        config.validate()?;
        let routes = RoutingTable::for_config(&config)?;
        let scope = config.resolve(&config.script_path)?.join("./")?;
        let version_url = config.resolve(&config.version_path)?;
        let metadata_url = config.resolve(&config.metadata_path)?;
        let assets = config
            .static_assets
            .iter()
            .map(|asset| config.resolve(asset))
            .collect::<Result<Vec<_>, _>>()?;
        let cache_name = config.cache_name(&config.default_version);

        Ok(Arc::new(Self {
            id: ServiceWorkerId::new(),
            config,
            fetcher,
            caches,
            clients,
            routes,
            scope,
            version_url,
            metadata_url,
            assets,
            cache_name: Arc::new(RwLock::new(cache_name)),
            state: RwLock::new(ServiceWorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            update_guard: Mutex::new(()),
            pending: StdMutex::new(None),
            poll_task: StdMutex::new(None),
            timer_arms: AtomicUsize::new(0),
            background: StdMutex::new(JoinSet::new()),
        }))
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ServiceWorkerState) {
        debug!(worker = %self.id, ?state, "Worker state");
        *self.state.write().await = state;
    }

    /// Name of the authoritative bucket.
    pub async fn cache_name(&self) -> String {
        self.cache_name.read().await.clone()
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    // ==================== Lifecycle ====================

    /// Install: name the bucket after the live version and pre-cache the
    /// static manifest in one batch. Any failed asset fails the install and
    /// leaves no bucket behind.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        info!(worker = %self.id, "Installing new version");
        self.set_state(ServiceWorkerState::Installing).await;

        match self.fetch_descriptor().await {
            Ok(descriptor) => {
                let name = self.config.cache_name(&descriptor.version);
                info!(cache = %name, "Using cache name");
                *self.cache_name.write().await = name;
            }
            Err(err) => {
                warn!(error = %err, "Failed to fetch version, using default cache name");
            }
        }

        let name = self.cache_name().await;
        info!(cache = %name, assets = self.assets.len(), "Pre-caching offline data");

        let fetched = match try_join_all(self.assets.iter().map(|url| self.fetch_asset(url))).await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(error = %err, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(err);
            }
        };

        {
            let mut caches = self.caches.write().await;
            let cache = caches.open(&name);
            for (url, response) in fetched {
                cache.put(url.as_str(), response);
            }
        }

        if self.config.worker.skip_waiting_on_install {
            self.skip_waiting();
        }
        self.set_state(ServiceWorkerState::Installed).await;
        Ok(())
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(Url, Response), ServiceWorkerError> {
        let install_failed = |reason: String| ServiceWorkerError::InstallFailed {
            url: url.to_string(),
            reason,
        };
        let response = self
            .fetcher
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|e| install_failed(e.to_string()))?;
        if !response.ok() {
            return Err(install_failed(format!("status {}", response.status)));
        }
        Ok((url.clone(), response))
    }

    /// Ask to be promoted without waiting for controlled pages to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Activate: drop every other bucket, claim the pages in scope, run one check and
    /// (re)arm the poll timer.
    pub async fn activate(self: &Arc<Self>) {
        info!(worker = %self.id, "Activating new version");
        self.set_state(ServiceWorkerState::Activating).await;

        {
            let mut caches = self.caches.write().await;
            let current = self.cache_name.read().await.clone();
            for name in caches.retain_only(&current) {
                info!(cache = %name, "Deleting old cache");
            }
        }

        let claimed = self.clients.write().await.claim(self.id, &self.scope);
        debug!(claimed, "Claimed clients");

        self.stop_polling();
        let outcome = self.check_for_updates().await;
        debug!(?outcome, "Activation check finished");
        self.arm_polling();

        self.set_state(ServiceWorkerState::Activated).await;
        info!("Update checker initialized");
    }

    /// Retire this worker.
    pub async fn mark_redundant(&self) {
        self.stop_polling();
        self.set_state(ServiceWorkerState::Redundant).await;
    }

    // ==================== Polling ====================

    fn poll_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poll_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_polling(self: &Arc<Self>) {
        let period = self.config.worker.poll_interval();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.check_for_updates().await;
            }
        });

        if let Some(previous) = self.poll_task().replace(handle) {
            previous.abort();
        }
        self.timer_arms.fetch_add(1, Ordering::SeqCst);
    }

    /// Cancel the poll timer, if armed.
    pub fn stop_polling(&self) {
        if let Some(handle) = self.poll_task().take() {
            handle.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poll_task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// How many times the poll timer has been armed.
    pub fn timer_arms(&self) -> usize {
        self.timer_arms.load(Ordering::SeqCst)
    }

    // ==================== Version check ====================

    async fn fetch_descriptor(&self) -> Result<VersionDescriptor, ServiceWorkerError> {
        let request = Request::get(self.version_url.clone()).cache(CacheMode::NoCache);
        let fetcher = Arc::clone(&self.fetcher);
        let response = with_timeout(self.config.worker.fetch_timeout(), || async move {
            fetcher.fetch(request).await
        })
        .await??;

        if !response.ok() {
            return Err(ServiceWorkerError::HttpStatus {
                url: self.version_url.to_string(),
                status: response.status.as_u16(),
            });
        }

        VersionDescriptor::from_slice(&response.bytes())
            .map_err(|e| ServiceWorkerError::BadDescriptor(e.to_string()))
    }

    /// The descriptor stored in the authoritative bucket, if any.
    pub async fn cached_descriptor(&self) -> Option<VersionDescriptor> {
        let caches = self.caches.read().await;
        let name = self.cache_name.read().await;
        let entry = caches.match_in(&name, self.version_url.as_str())?;
        match VersionDescriptor::from_slice(&entry.response.bytes()) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                warn!(error = %err, "Cached version descriptor is unreadable");
                None
            }
        }
    }

    async fn store_descriptor(&self, descriptor: &VersionDescriptor) {
        let body = match descriptor.to_vec() {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "Failed to serialize version descriptor");
                return;
            }
        };
        let response = Response::json_body(self.version_url.clone(), body);
        let mut caches = self.caches.write().await;
        let name = self.cache_name.read().await.clone();
        caches.open(&name).put(self.version_url.as_str(), response);
    }

    /// Poll the version descriptor and apply a change if there is one.
    ///
    /// Never fails: problems are logged and reported as
    /// [`CheckOutcome::Failed`]; the next tick retries.
    pub async fn check_for_updates(&self) -> CheckOutcome {
        debug!("Checking for updates...");

        let fresh = match self.fetch_descriptor().await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(error = %err, "Failed to fetch version info");
                return CheckOutcome::Failed(err);
            }
        };

        let outcome = match self.update_guard.try_lock() {
            Ok(_guard) => self.compare_and_apply(fresh).await,
            Err(_) => {
                debug!(version = %fresh.version, "Update already in progress, handing descriptor over");
                *self.pending() = Some(fresh);
                CheckOutcome::AlreadyApplying
            }
        };

        self.drain_pending().await;
        outcome
    }

    fn pending(&self) -> MutexGuard<'_, Option<VersionDescriptor>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Compare descriptors handed over by checks that found `update_guard`
    /// held. Every check drains after releasing the guard, so the last
    /// holder sees every hand-over.
    async fn drain_pending(&self) {
        while self.has_pending() {
            let Ok(_guard) = self.update_guard.try_lock() else {
                return;
            };
            loop {
                let Some(next) = self.pending().take() else {
                    break;
                };
                let followup = self.compare_and_apply(next).await;
                debug!(?followup, "Handed-over check finished");
            }
        }
    }

    /// Compare `fresh` with the cached descriptor, apply a change and store
    /// `fresh`. Caller holds `update_guard`.
    async fn compare_and_apply(&self, fresh: VersionDescriptor) -> CheckOutcome {
        let outcome = match self.cached_descriptor().await {
            None => {
                info!(version = %fresh.version, "First run, caching version");
                CheckOutcome::FirstRun {
                    version: fresh.version.clone(),
                }
            }
            Some(cached) if cached.same_version(&fresh) => {
                info!(version = %cached.version, "App is up to date");
                CheckOutcome::UpToDate {
                    version: cached.version,
                }
            }
            Some(cached) => {
                let notified = self.apply_update(&cached, &fresh).await;
                CheckOutcome::Updated {
                    old_version: cached.version,
                    new_version: fresh.version.clone(),
                    notified,
                }
            }
        };

        self.store_descriptor(&fresh).await;
        outcome
    }

    /// Switch to the bucket for `fresh`, re-cache, patch metadata and tell
    /// every page. Caller holds `update_guard`.
    async fn apply_update(&self, cached: &VersionDescriptor, fresh: &VersionDescriptor) -> usize {
        info!(version = %fresh.version, current = %cached.version, "New version available");

        let new_name = self.config.cache_name(&fresh.version);
        {
            let mut caches = self.caches.write().await;
            for name in caches.retain_only(&new_name) {
                info!(cache = %name, "Deleting old cache");
            }
            *self.cache_name.write().await = new_name.clone();
        }

        info!(cache = %new_name, "Pre-caching assets for new version");
        let cached_count = self.precache_best_effort(&new_name).await;
        debug!(cached_count, total = self.assets.len(), "Re-cached assets");

        self.patch_metadata_version(&fresh.version).await;

        let message = WorkerMessage::UpdateAvailable {
            version: fresh.version.clone(),
            old_version: cached.version.clone(),
            description: fresh.description.clone(),
        };
        let clients = self.clients.read().await;
        let targets = clients.match_all(ClientMatchOptions {
            include_uncontrolled: true,
            controller: Some(self.id),
        });
        info!(count = targets.len(), "Notifying clients about update");
        targets
            .into_iter()
            .filter(|client| client.post_message(message.clone()).is_ok())
            .count()
    }

    /// Fetch every static asset into `name`; failures are logged and skipped.
    async fn precache_best_effort(&self, name: &str) -> usize {
        let results = join_all(self.assets.iter().map(|url| async move {
            let result = self.fetcher.fetch(Request::get(url.clone())).await;
            (url, result)
        }))
        .await;

        let mut caches = self.caches.write().await;
        let cache = caches.open(name);
        let mut stored = 0;
        for (url, result) in results {
            match result {
                Ok(response) if response.ok() => {
                    cache.put(url.as_str(), response);
                    stored += 1;
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status, "Asset failed to cache, will retry on demand");
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "Asset failed to cache, will retry on demand");
                }
            }
        }
        stored
    }

    /// Fetch the live metadata document, set its `version` and cache it.
    /// Other fields are preserved as served.
    async fn patch_metadata_version(&self, version: &str) {
        let request = Request::get(self.metadata_url.clone()).cache(CacheMode::NoCache);
        let response = match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => response,
            Ok(response) => {
                info!(status = %response.status, "Failed to fetch manifest");
                return;
            }
            Err(err) => {
                error!(error = %err, "Error updating manifest");
                return;
            }
        };

        let mut manifest: Value = match response.json() {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "Error updating manifest");
                return;
            }
        };
        let Some(fields) = manifest.as_object_mut() else {
            warn!("Manifest is not a JSON object, leaving it untouched");
            return;
        };
        fields.insert("version".to_string(), Value::String(version.to_string()));

        let body = match serde_json::to_vec(&manifest) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "Error updating manifest");
                return;
            }
        };
        let patched = Response::new(self.metadata_url.clone(), response.status, body)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut caches = self.caches.write().await;
        let name = self.cache_name.read().await.clone();
        caches.open(&name).put(self.metadata_url.as_str(), patched);
        info!(version, "Updated cached manifest version");
    }

    // ==================== Messages ====================

    /// Handle a message from a page. Safe to call from any number of callers.
    pub async fn handle_message(&self, message: PageMessage) -> Option<CheckOutcome> {
        match message {
            PageMessage::SkipWaiting => {
                info!(worker = %self.id, "Received SKIP_WAITING message");
                self.skip_waiting();
                None
            }
            PageMessage::CheckForUpdates => {
                info!(worker = %self.id, "Manually checking for updates");
                Some(self.check_for_updates().await)
            }
        }
    }

    // ==================== Fetch ====================

    /// Serve an intercepted request according to the routing table.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        let strategy = self.routes.route(&request).strategy.clone();
        match strategy {
            Strategy::NetworkFirst(fallback) => self.network_first(request, fallback).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn network_first(
        &self,
        request: Request,
        fallback: Fallback,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let err = match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                self.store_in_background(&request, &response);
                return Ok(FetchResponse::network(response));
            }
            Err(err) => err,
        };

        debug!(url = %request.url, error = %err, "Network fetch failed");
        match fallback {
            Fallback::CachedCopy => match self.lookup(&request.cache_key()).await {
                Some(response) => Ok(FetchResponse::cached(response)),
                None => Err(err.into()),
            },
            Fallback::OfflineShell(shell) => match self.lookup(&shell).await {
                Some(response) => Ok(FetchResponse::cached(response)),
                None => Err(self.unavailable(&request, &err)),
            },
            Fallback::CachedOrUnavailable => match self.lookup(&request.cache_key()).await {
                Some(response) => {
                    debug!(url = %request.url, "Serving from cache");
                    Ok(FetchResponse::cached(response))
                }
                None => Err(self.unavailable(&request, &err)),
            },
        }
    }

    async fn cache_first(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        if let Some(response) = self.lookup(&request.cache_key()).await {
            return Ok(FetchResponse::cached(response));
        }
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                self.store_in_background(&request, &response);
                Ok(FetchResponse::network(response))
            }
            Err(err) => Err(self.unavailable(&request, &err)),
        }
    }

    fn unavailable(&self, request: &Request, cause: &NetError) -> ServiceWorkerError {
        let err = ServiceWorkerError::ResourceUnavailable {
            url: request.url.to_string(),
        };
        error!(cause = %cause, "{err}");
        err
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        let caches = self.caches.read().await;
        let name = self.cache_name.read().await;
        caches
            .match_request(&name, key)
            .map(|entry| entry.response.clone())
    }

    fn background(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a clone of a successful GET response without delaying the page.
    fn store_in_background(&self, request: &Request, response: &Response) {
        if request.method != Method::GET || !response.ok() {
            return;
        }

        let caches = Arc::clone(&self.caches);
        let cache_name = Arc::clone(&self.cache_name);
        let key = request.cache_key();
        let response = response.clone();

        let mut tasks = self.background();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let mut caches = caches.write().await;
            let name = cache_name.read().await.clone();
            caches.open(&name).put(&key, response);
        });
    }

    /// Wait for every pending background cache write. Returns how many were awaited.
    pub async fn flush_background_writes(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.background());
        let mut flushed = 0;
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "Background cache write failed");
            }
            flushed += 1;
        }
        flushed
    }
}

impl Drop for CacheController {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_task().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("id", &self.id)
            .field("version_url", &self.version_url)
            .field("assets", &self.assets.len())
            .finish()
    }
}
