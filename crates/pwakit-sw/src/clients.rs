//! Pages attached to a container.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use pwakit_core::WorkerMessage;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

/// Unique identifier for a page context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What a page observes from the worker side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// A new worker started installing.
    UpdateFound { worker: ServiceWorkerId },
    /// A worker changed lifecycle state.
    StateChange {
        worker: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// The page is now controlled by a different worker.
    ControllerChange { controller: ServiceWorkerId },
    /// A `postMessage` from a worker.
    Message(WorkerMessage),
}

/// A page context.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently controlling this page.
    pub controller: Option<ServiceWorkerId>,
    tx: mpsc::UnboundedSender<PageEvent>,
}

impl Client {
    /// Deliver an event. Fails only if the page has gone away.
    pub fn send(&self, event: PageEvent) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(event)
            .map_err(|_| ServiceWorkerError::StateError(format!("{} is closed", self.id)))
    }

    /// Post a worker message to the page.
    pub fn post_message(&self, message: WorkerMessage) -> Result<(), ServiceWorkerError> {
        self.send(PageEvent::Message(message))
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    /// Include pages not controlled by `controller`.
    pub include_uncontrolled: bool,
    /// Worker asking; pages it controls always match.
    pub controller: Option<ServiceWorkerId>,
}

/// Registry of page contexts.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a page. Returns its id and the receiving end of its event stream.
    pub fn connect(
        &mut self,
        url: Url,
        controller: Option<ServiceWorkerId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<PageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = %id, url = %url, controller = ?controller, "Client connected");
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller,
                tx,
            },
        );
        (id, rx)
    }

    /// Detach a page.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match pages.
    pub fn match_all(&self, options: ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| {
                options.include_uncontrolled
                    || (options.controller.is_some() && c.controller == options.controller)
            })
            .collect()
    }

    /// Number of pages controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Make `worker` the controller of every page under `scope`. Returns how
    /// many pages changed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller == Some(worker)
                || !client.url.as_str().starts_with(scope.as_str())
            {
                continue;
            }
            client.controller = Some(worker);
            changed += 1;
            if client
                .send(PageEvent::ControllerChange { controller: worker })
                .is_err()
            {
                trace!(client = %client.id, "Client gone before controllerchange");
            }
        }
        changed
    }

    /// Send `event` to every page. Returns how many received it.
    pub fn broadcast(&self, event: PageEvent) -> usize {
        self.clients
            .values()
            .filter(|client| client.send(event.clone()).is_ok())
            .count()
    }
}
