//! In-memory origin for tests and offline demos.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use tracing::trace;
use url::Url;

use crate::{CacheMode, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Fail(String),
    /// Never answers.
    Stall,
}

/// A request as seen by the [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub url: Url,
    pub cache: CacheMode,
    pub navigation: bool,
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<String, Route>,
    offline: bool,
    seen: Vec<SeenRequest>,
}

/// A fake origin keyed by absolute URL.
///
/// Unknown URLs answer `404 Not Found`, like a static file server.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    state: Mutex<State>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `body` with the given status at `url`.
    pub fn serve(&self, url: &Url, status: StatusCode, body: impl Into<Bytes>) {
        let response = Response::new(url.clone(), status, body);
        self.state()
            .routes
            .insert(url.as_str().to_string(), Route::Respond(response));
    }

    /// Serve a 200 text body at `url`.
    pub fn serve_text(&self, url: &Url, body: impl Into<Bytes>) {
        self.serve(url, StatusCode::OK, body);
    }

    /// Serve a 200 JSON body at `url`.
    pub fn serve_json(&self, url: &Url, body: impl Into<Bytes>) {
        let response = Response::json_body(url.clone(), body);
        self.state()
            .routes
            .insert(url.as_str().to_string(), Route::Respond(response));
    }

    /// Make requests to `url` fail at the transport level.
    pub fn fail(&self, url: &Url) {
        self.state().routes.insert(
            url.as_str().to_string(),
            Route::Fail(format!("connection reset fetching {url}")),
        );
    }

    /// Make requests to `url` hang forever.
    pub fn stall(&self, url: &Url) {
        self.state()
            .routes
            .insert(url.as_str().to_string(), Route::Stall);
    }

    /// Forget whatever was configured for `url`.
    pub fn remove(&self, url: &Url) {
        self.state().routes.remove(url.as_str());
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Number of requests seen for `url`.
    pub fn hits(&self, url: &Url) -> usize {
        self.state()
            .seen
            .iter()
            .filter(|r| r.url == *url)
            .count()
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state().seen.clone()
    }

    /// Total number of requests seen.
    pub fn total_requests(&self) -> usize {
        self.state().seen.len()
    }
}

#[async_trait]
impl Fetcher for MemoryNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let route = {
            let mut state = self.state();
            state.seen.push(SeenRequest {
                url: request.url.clone(),
                cache: request.cache,
                navigation: request.is_navigation(),
            });
            if state.offline {
                return Err(NetError::Offline(request.url.to_string()));
            }
            state.routes.get(request.url.as_str()).cloned()
        };

        trace!(url = %request.url, "Memory fetch");

        match route {
            Some(Route::Respond(response)) => Ok(response),
            Some(Route::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            Some(Route::Stall) => std::future::pending().await,
            None => Ok(Response::new(
                request.url,
                StatusCode::NOT_FOUND,
                Bytes::from_static(b"Not Found"),
            )),
        }
    }
}
