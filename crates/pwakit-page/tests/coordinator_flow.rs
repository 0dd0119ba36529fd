//! End-to-end flows between a page coordinator and the cache controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pwakit_core::{AppConfig, VersionDescriptor};
use pwakit_net::MemoryNetwork;
use pwakit_page::{Banner, BannerKind, CoordinatorPhase, PageUi, UpdateCoordinator};
use pwakit_sw::ServiceWorkerContainer;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
enum UiEvent {
    Shown(Banner),
    Countdown(u64),
    Hidden(BannerKind),
    Reloaded,
}

#[derive(Default)]
struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    fn reloads(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == UiEvent::Reloaded)
            .count()
    }

    fn banners(&self) -> Vec<Banner> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Shown(banner) => Some(banner),
                _ => None,
            })
            .collect()
    }
}

impl PageUi for RecordingUi {
    fn show_banner(&self, banner: &Banner) {
        self.events.lock().unwrap().push(UiEvent::Shown(banner.clone()));
    }

    fn update_countdown(&self, seconds_left: u64) {
        self.events
            .lock()
            .unwrap()
            .push(UiEvent::Countdown(seconds_left));
    }

    fn hide_banner(&self, kind: BannerKind) {
        self.events.lock().unwrap().push(UiEvent::Hidden(kind));
    }

    fn reload(&self) {
        self.events.lock().unwrap().push(UiEvent::Reloaded);
    }
}

struct Harness {
    net: Arc<MemoryNetwork>,
    config: Arc<AppConfig>,
    container: Arc<ServiceWorkerContainer>,
}

impl Harness {
    /// A deployed app whose worker is already active, as on a second visit.
    async fn returning_visit(skip_waiting_on_install: bool) -> Self {
        let mut config = AppConfig::for_origin(Url::parse("https://demo.test/").unwrap());
        config.app_name = "app".to_string();
        config.static_assets = vec!["./index.html".to_string(), "./version.json".to_string()];
        config.worker.skip_waiting_on_install = skip_waiting_on_install;
        let config = Arc::new(config);

        let net = Arc::new(MemoryNetwork::new());
        net.serve_text(&config.resolve("./service-worker.js").unwrap(), "// v1");
        net.serve_text(&config.resolve("./index.html").unwrap(), "<html></html>");
        let harness = Self {
            container: ServiceWorkerContainer::new(Arc::clone(&config), net.clone()).unwrap(),
            net,
            config,
        };
        harness.publish(VersionDescriptor::new("1.0.8"));
        harness.container.register().await.unwrap();
        harness
    }

    fn url(&self, path: &str) -> Url {
        self.config.resolve(path).unwrap()
    }

    fn publish(&self, descriptor: VersionDescriptor) {
        self.net
            .serve_json(&self.url("./version.json"), descriptor.to_vec().unwrap());
    }

    async fn open_page(&self) -> (Arc<RecordingUi>, Arc<UpdateCoordinator>) {
        let ui = Arc::new(RecordingUi::default());
        let coordinator =
            UpdateCoordinator::new(Arc::clone(&self.container), ui.clone(), self.url("./"));
        coordinator.start().await.unwrap();
        settle().await;
        (ui, coordinator)
    }

    async fn deploy_worker(&self, body: &str) {
        self.net
            .serve_text(&self.url("./service-worker.js"), body.to_string());
        self.container.update().await.unwrap();
        settle().await;
    }
}

/// Let spawned tasks run without moving the paused clock noticeably.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn first_visit_reloads_when_worker_claims_page() {
    let mut config = AppConfig::for_origin(Url::parse("https://demo.test/").unwrap());
    config.static_assets = vec!["./version.json".to_string()];
    let config = Arc::new(config);
    let net = Arc::new(MemoryNetwork::new());
    net.serve_text(&config.resolve("./service-worker.js").unwrap(), "// v1");
    net.serve_json(
        &config.resolve("./version.json").unwrap(),
        VersionDescriptor::new("1.0.8").to_vec().unwrap(),
    );
    let container = ServiceWorkerContainer::new(Arc::clone(&config), net).unwrap();
    let ui = Arc::new(RecordingUi::default());
    let coordinator =
        UpdateCoordinator::new(container, ui.clone(), config.resolve("./").unwrap());

    coordinator.start().await.unwrap();
    settle().await;

    assert_eq!(ui.reloads(), 1);
    assert!(ui.banners().is_empty());
}

#[tokio::test(start_paused = true)]
async fn returning_visit_stays_quiet() {
    let harness = Harness::returning_visit(true).await;

    let (ui, coordinator) = harness.open_page().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(ui.events().is_empty());
    assert_eq!(coordinator.phase(), CoordinatorPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn version_banner_then_automatic_reload() {
    let harness = Harness::returning_visit(true).await;
    let (ui, coordinator) = harness.open_page().await;

    harness.publish(VersionDescriptor::new("1.0.9").with_description("bugfixes"));
    coordinator.check_now();
    settle().await;

    assert_eq!(coordinator.phase(), CoordinatorPhase::BannerShown);
    assert_eq!(
        ui.banners(),
        vec![Banner::Version {
            version: "1.0.9".into(),
            old_version: "1.0.8".into(),
            description: "bugfixes".into(),
        }]
    );
    assert_eq!(ui.reloads(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(ui.reloads(), 1);
    assert_eq!(coordinator.phase(), CoordinatorPhase::Reloading);
}

#[tokio::test(start_paused = true)]
async fn dismissing_version_banner_keeps_scheduled_reload() {
    let harness = Harness::returning_visit(true).await;
    let (ui, coordinator) = harness.open_page().await;

    harness.publish(VersionDescriptor::new("1.0.9"));
    coordinator.check_now();
    settle().await;
    coordinator.dismiss(BannerKind::Version);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(ui.events().contains(&UiEvent::Hidden(BannerKind::Version)));
    assert_eq!(ui.reloads(), 1);
}

#[tokio::test(start_paused = true)]
#[ignore = "open question: the app reloads 5s after the version banner even if it was dismissed; \
            enable if dismiss is meant to cancel the reload"]
async fn dismissing_version_banner_cancels_reload() {
    let harness = Harness::returning_visit(true).await;
    let (ui, coordinator) = harness.open_page().await;

    harness.publish(VersionDescriptor::new("1.0.9"));
    coordinator.check_now();
    settle().await;
    coordinator.dismiss(BannerKind::Version);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(ui.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn waiting_worker_banner_and_update_now() {
    let harness = Harness::returning_visit(false).await;
    let (ui, coordinator) = harness.open_page().await;

    harness.deploy_worker("// v2").await;

    assert_eq!(coordinator.phase(), CoordinatorPhase::Waiting);
    assert_eq!(ui.banners(), vec![Banner::Waiting]);
    assert!(harness.container.waiting().await.is_some());

    coordinator.update_now();
    settle().await;

    // The new worker claims the page, which reloads before the fallback timer.
    assert!(harness.container.waiting().await.is_none());
    assert_eq!(ui.reloads(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ui.reloads(), 1);
}

#[tokio::test(start_paused = true)]
async fn dismissed_waiting_banner_can_show_again() {
    let harness = Harness::returning_visit(false).await;
    let (ui, coordinator) = harness.open_page().await;

    harness.deploy_worker("// v2").await;
    coordinator.dismiss(BannerKind::Waiting);
    assert!(!coordinator.banner_visible(BannerKind::Waiting));

    harness.deploy_worker("// v3").await;

    assert_eq!(ui.banners(), vec![Banner::Waiting, Banner::Waiting]);
    assert_eq!(ui.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn waiting_banner_shown_once_while_visible() {
    let harness = Harness::returning_visit(false).await;
    let (ui, _coordinator) = harness.open_page().await;

    harness.deploy_worker("// v2").await;
    harness.deploy_worker("// v3").await;

    assert_eq!(ui.banners(), vec![Banner::Waiting]);
}

#[tokio::test(start_paused = true)]
async fn regaining_visibility_or_network_triggers_check() {
    let harness = Harness::returning_visit(true).await;
    let (_ui, coordinator) = harness.open_page().await;
    let version_url = harness.url("./version.json");

    let before = harness.net.hits(&version_url);
    coordinator.on_visibility_change(false);
    settle().await;
    assert_eq!(harness.net.hits(&version_url), before);

    coordinator.on_visibility_change(true);
    settle().await;
    assert_eq!(harness.net.hits(&version_url), before + 1);

    coordinator.on_online();
    settle().await;
    assert_eq!(harness.net.hits(&version_url), before + 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_detaches_page() {
    let harness = Harness::returning_visit(true).await;
    let (_ui, coordinator) = harness.open_page().await;
    assert_eq!(harness.container.clients.read().await.len(), 1);

    coordinator.shutdown().await;

    assert!(harness.container.clients.read().await.is_empty());
    assert!(coordinator.client().is_none());
}
