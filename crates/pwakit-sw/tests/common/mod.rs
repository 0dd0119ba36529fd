//! Shared fixture for the controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pwakit_core::{AppConfig, VersionDescriptor, WorkerMessage};
use pwakit_net::MemoryNetwork;
use pwakit_sw::{PageEvent, ServiceWorkerContainer};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const ASSETS: &[&str] = &[
    "./",
    "./index.html",
    "./styles.css",
    "./app.js",
    "./manifest.json",
    "./version.json",
    "./cv.txt",
    "./cover letter.txt",
];

/// A fake deployment of the app on an in-memory origin.
pub struct Site {
    pub net: Arc<MemoryNetwork>,
    pub config: Arc<AppConfig>,
}

impl Site {
    pub fn new(version: &str) -> Self {
        Self::with_config(version, |_| {})
    }

    pub fn with_config(version: &str, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        init_tracing();

        let mut config = AppConfig::for_origin(Url::parse("https://demo.test/app/").unwrap());
        config.app_name = "app".to_string();
        config.static_assets = ASSETS.iter().map(|s| s.to_string()).collect();
        tweak(&mut config);

        let site = Self {
            net: Arc::new(MemoryNetwork::new()),
            config: Arc::new(config),
        };
        site.net.serve_text(&site.url("./service-worker.js"), "// worker v1");
        for asset in ASSETS {
            site.net
                .serve_text(&site.url(asset), format!("contents of {asset}"));
        }
        site.net.serve_json(
            &site.url("./manifest.json"),
            r#"{"name":"Demo","short_name":"Demo","version":"0.0.0"}"#,
        );
        site.publish(VersionDescriptor::new(version));
        site
    }

    pub fn url(&self, path: &str) -> Url {
        self.config.resolve(path).unwrap()
    }

    pub fn publish(&self, descriptor: VersionDescriptor) {
        self.net
            .serve_json(&self.url("./version.json"), descriptor.to_vec().unwrap());
    }

    pub fn deploy_worker(&self, body: &str) {
        self.net
            .serve_text(&self.url("./service-worker.js"), body.to_string());
    }

    pub fn container(&self) -> Arc<ServiceWorkerContainer> {
        ServiceWorkerContainer::new(Arc::clone(&self.config), self.net.clone()).unwrap()
    }
}

/// Route controller logs to the test harness. `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Drain the `UPDATE_AVAILABLE` messages a page has received so far.
pub fn update_messages(rx: &mut UnboundedReceiver<PageEvent>) -> Vec<WorkerMessage> {
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PageEvent::Message(message) = event {
            messages.push(message);
        }
    }
    messages
}
