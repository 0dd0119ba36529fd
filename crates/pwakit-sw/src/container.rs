//! Registration host: one registration per origin scope.
//!
//! The container fetches the worker script, installs a new
//! [`CacheController`] when the script changed, and moves workers through
//! the installing, waiting and active slots.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pwakit_core::{AppConfig, PageMessage};
use pwakit_net::{CacheMode, Fetcher, Request};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientId, Clients, PageEvent};
use crate::controller::{CacheController, CheckOutcome, FetchResponse};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

/// Which registration slot a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSlot {
    Installing,
    Waiting,
    Active,
}

#[derive(Debug, Clone)]
struct RegisteredWorker {
    controller: Arc<CacheController>,
    script: Bytes,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<RegisteredWorker>,
    waiting: Option<RegisteredWorker>,
    active: Option<RegisteredWorker>,

    /// Last time the script was fetched.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    fn slot(&self, slot: WorkerSlot) -> Option<&RegisteredWorker> {
        match slot {
            WorkerSlot::Installing => self.installing.as_ref(),
            WorkerSlot::Waiting => self.waiting.as_ref(),
            WorkerSlot::Active => self.active.as_ref(),
        }
    }

    /// Worker in `slot`, if any.
    pub fn get(&self, slot: WorkerSlot) -> Option<Arc<CacheController>> {
        self.slot(slot).map(|w| Arc::clone(&w.controller))
    }

    /// Newest known worker: installing, then waiting, then active.
    fn newest(&self) -> Option<&RegisteredWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Check if update is needed.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }
}

/// Service worker container (`navigator.serviceWorker`) for one app.
pub struct ServiceWorkerContainer {
    config: Arc<AppConfig>,
    fetcher: Arc<dyn Fetcher>,
    script_url: Url,

    /// Cache storage shared by every worker.
    pub caches: Arc<RwLock<CacheStorage>>,

    /// Attached pages.
    pub clients: Arc<RwLock<Clients>>,

    registration: RwLock<ServiceWorkerRegistration>,

    /// Serializes install and activation.
    lifecycle: Mutex<()>,
}

impl ServiceWorkerContainer {
    /// Create a container for the app described by `config`.
    pub fn new(
        config: Arc<AppConfig>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Arc<Self>, ServiceWorkerError> {
        config.validate()?;
        let script_url = config.resolve(&config.script_path)?;
        let scope = script_url.join("./")?;

        Ok(Arc::new(Self {
            config,
            fetcher,
            script_url,
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            clients: Arc::new(RwLock::new(Clients::new())),
            registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
            lifecycle: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub async fn scope(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    pub async fn last_update_check(&self) -> Option<Instant> {
        self.registration.read().await.last_update_check
    }

    pub async fn worker(&self, slot: WorkerSlot) -> Option<Arc<CacheController>> {
        self.registration.read().await.get(slot)
    }

    pub async fn installing(&self) -> Option<Arc<CacheController>> {
        self.worker(WorkerSlot::Installing).await
    }

    pub async fn waiting(&self) -> Option<Arc<CacheController>> {
        self.worker(WorkerSlot::Waiting).await
    }

    pub async fn active(&self) -> Option<Arc<CacheController>> {
        self.worker(WorkerSlot::Active).await
    }

    // ==================== Pages ====================

    /// Attach a page. It is controlled by the active worker if the URL is in scope.
    pub async fn connect(&self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<PageEvent>) {
        let controller = {
            let registration = self.registration.read().await;
            registration
                .active
                .as_ref()
                .filter(|_| registration.in_scope(&url))
                .map(|w| w.controller.id())
        };
        self.clients.write().await.connect(url, controller)
    }

    /// Detach a page. A waiting worker may become active as a result.
    pub async fn disconnect(&self, id: ClientId) {
        if self.clients.write().await.remove(id).is_some() {
            debug!(client = %id, "Client disconnected");
            self.activate_if_ready().await;
        }
    }

    /// Worker controlling `client`.
    pub async fn controller_for(&self, client: ClientId) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client).and_then(|c| c.controller)
    }

    async fn broadcast(&self, event: PageEvent) {
        self.clients.read().await.broadcast(event);
    }

    async fn broadcast_state(&self, worker: ServiceWorkerId, state: ServiceWorkerState) {
        self.broadcast(PageEvent::StateChange { worker, state }).await;
    }

    // ==================== Registration ====================

    /// Register the worker script.
    ///
    /// Fetches the script bypassing the HTTP cache. When its bytes match the
    /// newest known worker nothing happens; otherwise a new controller is
    /// installed and, if possible, activated. Returns the newest worker's id.
    pub async fn register(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let request = Request::get(self.script_url.clone()).cache(CacheMode::NoCache);
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if !response.ok() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "{} answered {}",
                self.script_url, response.status
            )));
        }
        let script = response.bytes();

        {
            let mut registration = self.registration.write().await;
            registration.last_update_check = Some(Instant::now());
            if let Some(current) = registration.newest() {
                if current.script == script {
                    debug!(worker = %current.controller.id(), "Worker script unchanged");
                    return Ok(current.controller.id());
                }
            }
        }

        let controller = CacheController::new(
            Arc::clone(&self.config),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.caches),
            Arc::clone(&self.clients),
        )?;
        let id = controller.id();
        info!(worker = %id, script = %self.script_url, "Service worker found");

        self.registration.write().await.installing = Some(RegisteredWorker {
            controller: Arc::clone(&controller),
            script,
        });
        self.broadcast(PageEvent::UpdateFound { worker: id }).await;
        self.broadcast_state(id, ServiceWorkerState::Installing).await;

        if let Err(err) = controller.install().await {
            warn!(worker = %id, error = %err, "Service worker install failed");
            self.registration.write().await.installing = None;
            controller.mark_redundant().await;
            self.broadcast_state(id, ServiceWorkerState::Redundant).await;
            return Err(err);
        }

        let replaced = {
            let mut registration = self.registration.write().await;
            let installed = registration.installing.take();
            std::mem::replace(&mut registration.waiting, installed)
        };
        if let Some(old) = replaced {
            old.controller.mark_redundant().await;
            self.broadcast_state(old.controller.id(), ServiceWorkerState::Redundant)
                .await;
        }
        self.broadcast_state(id, ServiceWorkerState::Installed).await;

        self.activate_waiting_locked().await;
        Ok(id)
    }

    /// Re-run registration against the same script.
    pub async fn update(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        self.register().await
    }

    /// Promote the waiting worker if nothing holds it back.
    pub async fn activate_if_ready(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.activate_waiting_locked().await
    }

    /// Caller holds `lifecycle`.
    async fn activate_waiting_locked(&self) -> bool {
        let (incoming, outgoing) = {
            let mut registration = self.registration.write().await;
            let Some(waiting) = registration.waiting.as_ref() else {
                return false;
            };

            let ready = waiting.controller.skip_waiting_requested()
                || match registration.active.as_ref() {
                    None => true,
                    Some(active) => {
                        self.clients
                            .read()
                            .await
                            .controlled_by(active.controller.id())
                            == 0
                    }
                };
            if !ready {
                debug!(worker = %waiting.controller.id(), "Worker waiting for pages to close");
                return false;
            }

            let incoming = registration.waiting.take();
            let outgoing = std::mem::replace(&mut registration.active, incoming.clone());
            (incoming, outgoing)
        };

        let Some(incoming) = incoming else {
            return false;
        };
        if let Some(old) = outgoing {
            old.controller.mark_redundant().await;
            self.broadcast_state(old.controller.id(), ServiceWorkerState::Redundant)
                .await;
        }

        let id = incoming.controller.id();
        self.broadcast_state(id, ServiceWorkerState::Activating).await;
        incoming.controller.activate().await;
        self.broadcast_state(id, ServiceWorkerState::Activated).await;
        info!(worker = %id, "Service worker active");
        true
    }

    // ==================== Messaging ====================

    /// Deliver a message to the worker in `slot` and wait for it to be handled.
    pub async fn dispatch_message(
        &self,
        slot: WorkerSlot,
        message: PageMessage,
    ) -> Result<Option<CheckOutcome>, ServiceWorkerError> {
        let controller = self
            .worker(slot)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no {slot:?} worker")))?;

        let outcome = controller.handle_message(message).await;
        if message == PageMessage::SkipWaiting {
            self.activate_if_ready().await;
        }
        Ok(outcome)
    }

    /// Fire-and-forget variant of [`dispatch_message`](Self::dispatch_message).
    pub fn post_message(self: &Arc<Self>, slot: WorkerSlot, message: PageMessage) {
        let container = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = container.dispatch_message(slot, message).await {
                debug!(error = %err, ?message, "Message dropped");
            }
        });
    }

    /// Post a message in its JSON wire form. Unknown types are ignored.
    pub fn post_raw_message(self: &Arc<Self>, slot: WorkerSlot, data: &Value) -> bool {
        match PageMessage::from_value(data) {
            Some(message) => {
                self.post_message(slot, message);
                true
            }
            None => {
                debug!(%data, "Ignoring unknown message");
                false
            }
        }
    }

    // ==================== Fetch ====================

    /// Serve a page request through the active worker, or straight from the
    /// network when there is none.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        match self.active().await {
            Some(controller) => controller.handle_fetch(request).await,
            None => {
                let response = self.fetcher.fetch(request).await?;
                Ok(FetchResponse {
                    response,
                    from_cache: false,
                })
            }
        }
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer")
            .field("script_url", &self.script_url)
            .finish()
    }
}
