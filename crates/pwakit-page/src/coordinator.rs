//! Update coordinator.
//!
//! Two paths lead to a reload and may run at the same time:
//!
//! - a new worker is found, installs and waits; the user picks
//!   "update now" and the page reloads once the worker has taken over;
//! - the active worker posts `UPDATE_AVAILABLE`; the version banner is shown
//!   and the page reloads after a fixed delay.
//!
//! [`UpdateCoordinator::reload`] is idempotent, so the page reloads once
//! whichever path gets there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use pwakit_core::{PageConfig, PageMessage, WorkerMessage};
use pwakit_sw::{
    ClientId, PageEvent, ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerId,
    ServiceWorkerState, WorkerSlot,
};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::ui::{Banner, BannerKind, PageUi};

/// Where the coordinator is in its update flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorPhase {
    Idle,
    /// A new worker started installing.
    WorkerFound,
    /// The new worker is installed and waiting; the waiting banner is up.
    Waiting,
    /// The new worker took over.
    Activated,
    /// The version banner is up and the reload is scheduled.
    BannerShown,
    Reloading,
}

#[derive(Debug)]
struct State {
    phase: CoordinatorPhase,
    client: Option<ClientId>,
    /// Controller as seen by this page, in event order.
    controller: Option<ServiceWorkerId>,
    found: Option<ServiceWorkerId>,
    waiting_banner: bool,
    version_banner: bool,
    countdown: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Page-side half of the update protocol.
pub struct UpdateCoordinator {
    container: Arc<ServiceWorkerContainer>,
    ui: Arc<dyn PageUi>,
    config: PageConfig,
    page_url: Url,
    state: Mutex<State>,
    reloading: AtomicBool,
}

impl UpdateCoordinator {
    pub fn new(
        container: Arc<ServiceWorkerContainer>,
        ui: Arc<dyn PageUi>,
        page_url: Url,
    ) -> Arc<Self> {
        let config = container.config().page.clone();
        Arc::new(Self {
            container,
            ui,
            config,
            page_url,
            state: Mutex::new(State {
                phase: CoordinatorPhase::Idle,
                client: None,
                controller: None,
                found: None,
                waiting_banner: false,
                version_banner: false,
                countdown: None,
                tasks: Vec::new(),
            }),
            reloading: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.state().phase
    }

    fn set_phase(&self, phase: CoordinatorPhase) {
        let mut state = self.state();
        if state.phase != CoordinatorPhase::Reloading {
            state.phase = phase;
        }
    }

    pub fn client(&self) -> Option<ClientId> {
        self.state().client
    }

    pub fn banner_visible(&self, kind: BannerKind) -> bool {
        let state = self.state();
        match kind {
            BannerKind::Waiting => state.waiting_banner,
            BannerKind::Version => state.version_banner,
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut state = self.state();
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
    }

    /// Attach the page, register the worker and ask for an update check.
    ///
    /// Registration problems are logged and returned; the page keeps
    /// listening either way.
    pub async fn start(self: &Arc<Self>) -> Result<ClientId, ServiceWorkerError> {
        let (client, events) = self.container.connect(self.page_url.clone()).await;
        let controller = self.container.controller_for(client).await;
        {
            let mut state = self.state();
            state.client = Some(client);
            state.controller = controller;
        }
        self.track(tokio::spawn(Self::event_loop(Arc::downgrade(self), events)));

        match self.container.register().await {
            Ok(worker) => info!(%worker, "[Service Worker] Registered successfully"),
            Err(err) => {
                warn!(error = %err, "[Service Worker] Registration failed");
                return Err(err);
            }
        }

        if let Err(err) = self.container.update().await {
            warn!(error = %err, "[Service Worker] Update check failed");
        }
        Ok(client)
    }

    /// Stop listening and detach the page.
    pub async fn shutdown(&self) {
        let (client, tasks, countdown) = {
            let mut state = self.state();
            (
                state.client.take(),
                std::mem::take(&mut state.tasks),
                state.countdown.take(),
            )
        };
        for task in tasks.into_iter().chain(countdown) {
            task.abort();
        }
        if let Some(client) = client {
            self.container.disconnect(client).await;
        }
    }

    async fn event_loop(this: Weak<Self>, mut events: UnboundedReceiver<PageEvent>) {
        while let Some(event) = events.recv().await {
            let Some(coordinator) = this.upgrade() else {
                break;
            };
            coordinator.handle_event(event);
        }
        debug!("Page event stream closed");
    }

    /// React to one event from the container.
    pub fn handle_event(self: &Arc<Self>, event: PageEvent) {
        match event {
            PageEvent::UpdateFound { worker } => {
                info!(%worker, "[Service Worker] New worker found");
                let mut state = self.state();
                state.found = Some(worker);
                if state.phase != CoordinatorPhase::Reloading {
                    state.phase = CoordinatorPhase::WorkerFound;
                }
            }
            PageEvent::StateChange { worker, state } => {
                if self.state().found != Some(worker) {
                    return;
                }
                match state {
                    ServiceWorkerState::Installed => self.on_worker_installed(),
                    ServiceWorkerState::Activated => self.set_phase(CoordinatorPhase::Activated),
                    _ => {}
                }
            }
            PageEvent::Message(WorkerMessage::UpdateAvailable {
                version,
                old_version,
                description,
            }) => {
                info!(%version, %old_version, "[App] Update available");
                self.show_version_banner(Banner::version(version, old_version, description));
            }
            PageEvent::ControllerChange { controller } => {
                info!(%controller, "[Service Worker] Controller changed");
                self.state().controller = Some(controller);
                self.reload();
            }
        }
    }

    fn on_worker_installed(&self) {
        {
            let mut state = self.state();
            if state.controller.is_none() {
                debug!("First install, nothing to replace");
                return;
            }
            if state.waiting_banner || state.phase == CoordinatorPhase::Reloading {
                return;
            }
            state.waiting_banner = true;
            state.phase = CoordinatorPhase::Waiting;
        }
        self.ui.show_banner(&Banner::Waiting);
    }

    fn show_version_banner(self: &Arc<Self>, banner: Banner) {
        {
            let mut state = self.state();
            if state.version_banner || state.phase == CoordinatorPhase::Reloading {
                return;
            }
            state.version_banner = true;
            state.phase = CoordinatorPhase::BannerShown;
        }
        self.ui.show_banner(&banner);

        let delay = self.config.version_reload_delay();
        let countdown = tokio::spawn(countdown(Arc::clone(&self.ui), delay));
        if let Some(previous) = self.state().countdown.replace(countdown) {
            previous.abort();
        }

        // The reload is not tied to the banner: dismissing only stops the countdown.
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = weak.upgrade() {
                info!("[App] Reloading to apply update");
                coordinator.reload();
            }
        }));
    }

    /// "Update now" on the waiting banner.
    pub fn update_now(self: &Arc<Self>) {
        info!("[App] Activating waiting worker");
        self.container
            .post_message(WorkerSlot::Waiting, PageMessage::SkipWaiting);
        self.hide(BannerKind::Waiting);

        let weak = Arc::downgrade(self);
        let delay = self.config.update_reload_delay();
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = weak.upgrade() {
                coordinator.reload();
            }
        }));
    }

    /// "Dismiss" on either banner. Clears the shown-flag so a later update
    /// can show the banner again.
    pub fn dismiss(&self, kind: BannerKind) {
        debug!(?kind, "Banner dismissed");
        self.hide(kind);
    }

    fn hide(&self, kind: BannerKind) {
        {
            let mut state = self.state();
            match kind {
                BannerKind::Waiting => state.waiting_banner = false,
                BannerKind::Version => {
                    state.version_banner = false;
                    if let Some(countdown) = state.countdown.take() {
                        countdown.abort();
                    }
                }
            }
        }
        self.ui.hide_banner(kind);
    }

    /// Ask the active worker to poll now.
    pub fn check_now(&self) {
        debug!("Requesting update check");
        self.container
            .post_message(WorkerSlot::Active, PageMessage::CheckForUpdates);
    }

    pub fn on_visibility_change(&self, visible: bool) {
        if visible {
            self.check_now();
        }
    }

    pub fn on_online(&self) {
        info!("[App] Connection restored");
        self.check_now();
    }

    /// Reload the page once. Returns `false` if a reload already happened.
    pub fn reload(&self) -> bool {
        if self.reloading.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state().phase = CoordinatorPhase::Reloading;
        self.ui.reload();
        true
    }
}

async fn countdown(ui: Arc<dyn PageUi>, total: Duration) {
    let mut remaining = total.as_secs();
    while remaining > 0 {
        ui.update_countdown(remaining);
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in state.tasks.drain(..).chain(state.countdown.take()) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("page_url", &self.page_url)
            .field("phase", &self.phase())
            .finish()
    }
}
