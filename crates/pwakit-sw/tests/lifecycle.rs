//! Install, activation and promotion of cache controllers.

mod common;

use std::sync::Arc;

use common::{Site, ASSETS};
use http::StatusCode;
use pwakit_core::PageMessage;
use pwakit_net::{Request, Response};
use pwakit_sw::{
    CacheController, CacheStorage, Clients, PageEvent, ServiceWorkerState, WorkerSlot,
};
use tokio::sync::RwLock;

#[tokio::test]
async fn install_caches_every_manifest_entry() {
    let site = Site::new("1.0.8");
    let container = site.container();

    container.register().await.unwrap();

    let caches = container.caches.read().await;
    assert_eq!(caches.keys(), vec!["app-cache-v1.0.8"]);
    for asset in ASSETS {
        let url = site.url(asset);
        assert!(
            caches.match_in("app-cache-v1.0.8", url.as_str()).is_some(),
            "{url} missing after install"
        );
    }
}

#[tokio::test]
async fn activation_purges_stale_buckets() {
    let site = Site::new("3");
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    {
        let mut storage = caches.write().await;
        for stale in ["app-cache-v1", "app-cache-v2"] {
            let url = site.url("./index.html");
            storage
                .open(stale)
                .put(url.as_str(), Response::new(url.clone(), StatusCode::OK, "old"));
        }
    }
    let controller = CacheController::new(
        Arc::clone(&site.config),
        site.net.clone(),
        Arc::clone(&caches),
        Arc::new(RwLock::new(Clients::new())),
    )
    .unwrap();

    controller.install().await.unwrap();
    controller.activate().await;

    assert_eq!(caches.read().await.keys(), vec!["app-cache-v3"]);
    controller.mark_redundant().await;
}

#[tokio::test]
async fn skip_waiting_promotes_waiting_worker_with_open_pages() {
    let site = Site::with_config("1.0.8", |config| {
        config.worker.skip_waiting_on_install = false;
    });
    let container = site.container();
    let first = container.register().await.unwrap();

    let (page_a, mut rx_a) = container.connect(site.url("./index.html")).await;
    let (_page_b, _rx_b) = container.connect(site.url("./")).await;

    site.deploy_worker("// worker v2");
    let second = container.update().await.unwrap();
    assert_eq!(container.waiting().await.unwrap().id(), second);
    assert_eq!(container.controller_for(page_a).await, Some(first));

    container
        .dispatch_message(WorkerSlot::Waiting, PageMessage::SkipWaiting)
        .await
        .unwrap();

    let active = container.active().await.unwrap();
    assert_eq!(active.id(), second);
    assert_eq!(active.state().await, ServiceWorkerState::Activated);
    assert_eq!(container.controller_for(page_a).await, Some(second));

    let mut states = Vec::new();
    while let Ok(event) = rx_a.try_recv() {
        match event {
            PageEvent::StateChange { worker, state } if worker == second => states.push(state),
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );
}

#[tokio::test]
async fn activation_keeps_only_new_bucket_across_worker_versions() {
    let site = Site::new("1.0.8");
    let container = site.container();
    container.register().await.unwrap();

    site.publish(pwakit_core::VersionDescriptor::new("1.1.0"));
    site.deploy_worker("// worker v2");
    container.update().await.unwrap();

    assert_eq!(container.caches.read().await.keys(), vec!["app-cache-v1.1.0"]);
    let served = container
        .handle_fetch(Request::get(site.url("./app.js")))
        .await
        .unwrap();
    assert!(!served.from_cache);
}
