//! # pwakit service worker
//!
//! A versioned cache controller modelled on the service worker lifecycle.
//!
//! ## Features
//!
//! - **Cache buckets**: named `<app>-cache-v<version>`, one authoritative at a time
//! - **Lifecycle**: install (atomic pre-cache), activate (purge, claim, poll)
//! - **Fetch interception**: first-match routing table, network-first by default
//! - **Version polling**: string-equality comparison of `version.json`
//! - **Messaging**: `SKIP_WAITING` / `CHECK_FOR_UPDATES` in, `UPDATE_AVAILABLE` out
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per origin scope)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (CacheController)
//!     │       ├── waiting    (CacheController)
//!     │       └── active     (CacheController) ── poll timer
//!     │
//!     ├── CacheStorage (shared by every controller)
//!     │       └── Cache (bucket) ── url → Response
//!     │
//!     └── Clients (pages) ◄── PageEvent ── UpdateFound / StateChange /
//!                                          ControllerChange / Message
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use pwakit_common::TimedOut;
use pwakit_core::PwaError;
use pwakit_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod controller;
pub mod routing;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use clients::{Client, ClientId, ClientMatchOptions, Clients, PageEvent};
pub use container::{ServiceWorkerContainer, ServiceWorkerRegistration, WorkerSlot};
pub use controller::{CacheController, CheckOutcome, FetchResponse};
pub use routing::{Fallback, RoutingEntry, RoutingTable, Strategy, UrlPattern};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed while caching {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Timeout(#[from] TimedOut),

    #[error("Unexpected status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid version descriptor: {0}")]
    BadDescriptor(String),

    #[error("Failed to fetch resource: {url}. No cached version available.")]
    ResourceUnavailable { url: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<PwaError> for ServiceWorkerError {
    fn from(err: PwaError) -> Self {
        ServiceWorkerError::Config(err.to_string())
    }
}

impl From<url::ParseError> for ServiceWorkerError {
    fn from(err: url::ParseError) -> Self {
        ServiceWorkerError::InvalidUrl(err.to_string())
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Pre-caching the static manifest.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Purging stale buckets and claiming pages.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl ServiceWorkerState {
    pub fn is_active(&self) -> bool {
        *self == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        *self == ServiceWorkerState::Redundant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        let a = ServiceWorkerId::new();
        let b = ServiceWorkerId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sw-"));
    }

    #[test]
    fn test_state_helpers() {
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
        assert!(ServiceWorkerState::Activated.is_active());
        assert!(ServiceWorkerState::Redundant.is_redundant());
        assert!(!ServiceWorkerState::Installed.is_active());
    }

    #[test]
    fn test_resource_unavailable_message() {
        let err = ServiceWorkerError::ResourceUnavailable {
            url: "https://app.test/missing.js".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to fetch resource: https://app.test/missing.js. No cached version available."
        );
    }
}
