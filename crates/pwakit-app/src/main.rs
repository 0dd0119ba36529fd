//! `pwakit`: run the cache controller and update coordinator against a live origin.
//!
//! ## Usage
//!
//! ```bash
//! # Attach a console page and watch for deploys
//! pwakit --origin https://example.github.io/app/ watch
//!
//! # One-shot install and version report
//! pwakit --origin https://example.github.io/app/ check
//!
//! # Fetch through the controller
//! pwakit fetch ./index.html ./version.json
//!
//! # Print the effective configuration
//! pwakit --config pwakit.json config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pwakit_common::{init_logging, LogConfig, LogFormat};
use pwakit_core::AppConfig;
use pwakit_net::{HttpFetcher, LoaderConfig, Request};
use pwakit_page::{BannerKind, UpdateCoordinator};
use pwakit_sw::ServiceWorkerContainer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

mod console;

use console::ConsoleUi;

#[derive(Parser)]
#[command(name = "pwakit")]
#[command(version, about = "Versioned offline cache and update notifications for web apps")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Origin the app is served from (overrides the config file)
    #[arg(long, global = true)]
    origin: Option<Url>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker, attach a console page and wait for updates
    Watch,

    /// Install and activate once, then report the cached version
    Check,

    /// Fetch paths through the controller
    Fetch {
        /// Paths relative to the origin
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(origin) = &cli.origin {
        config.origin = origin.clone();
    }
    config.validate()?;
    Ok(config)
}

fn log_config(cli: &Cli) -> LogConfig {
    let base = match cli.verbose {
        0 => LogConfig::default(),
        1 => LogConfig::debug(),
        _ => LogConfig::trace(),
    };
    base.with_format(cli.log_format)
}

fn build_container(config: AppConfig) -> Result<Arc<ServiceWorkerContainer>> {
    let fetcher = HttpFetcher::new(LoaderConfig::default())?;
    Ok(ServiceWorkerContainer::new(Arc::new(config), Arc::new(fetcher))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(log_config(&cli));

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Watch => watch(config).await,
        Commands::Check => check(config).await,
        Commands::Fetch { paths } => fetch(config, &paths).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn watch(config: AppConfig) -> Result<()> {
    let page_url = config.resolve("./")?;
    let container = build_container(config)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
        let coordinator = UpdateCoordinator::new(
            Arc::clone(&container),
            Arc::new(ConsoleUi::new(reload_tx)),
            page_url.clone(),
        );
        if let Err(err) = coordinator.start().await {
            warn!(error = %err, "Running without a service worker");
        }
        info!(page = %page_url, "Page loaded");

        let reloaded = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break false,
                Some(()) = reload_rx.recv() => break true,
                line = stdin.next_line(), if stdin_open => match line? {
                    Some(line) => match line.trim() {
                        "u" => coordinator.update_now(),
                        "d" => {
                            coordinator.dismiss(BannerKind::Waiting);
                            coordinator.dismiss(BannerKind::Version);
                        }
                        "c" => coordinator.check_now(),
                        "" => {}
                        other => println!("unknown command '{other}' (u, d, c)"),
                    },
                    None => stdin_open = false,
                },
            }
        };

        coordinator.shutdown().await;
        if !reloaded {
            info!("Shutting down");
            return Ok(());
        }
    }
}

async fn check(config: AppConfig) -> Result<()> {
    let container = build_container(config)?;
    let worker = container
        .register()
        .await
        .context("Service worker registration failed")?;

    let active = container
        .active()
        .await
        .context("Worker installed but did not activate")?;
    let version = active
        .cached_descriptor()
        .await
        .map(|d| d.version)
        .unwrap_or_else(|| "unknown".to_string());

    println!("worker:  {worker}");
    println!("cache:   {}", active.cache_name().await);
    println!("version: {version}");
    println!("buckets: {:?}", container.caches.read().await.keys());

    active.mark_redundant().await;
    Ok(())
}

async fn fetch(config: AppConfig, paths: &[String]) -> Result<()> {
    let urls = paths
        .iter()
        .map(|path| config.resolve(path))
        .collect::<Result<Vec<_>, _>>()?;
    let container = build_container(config)?;
    container
        .register()
        .await
        .context("Service worker registration failed")?;

    for url in urls {
        match container.handle_fetch(Request::get(url.clone())).await {
            Ok(served) => println!(
                "{} {} {} bytes{}",
                served.response.status.as_u16(),
                url,
                served.response.bytes().len(),
                if served.from_cache { " (cache)" } else { "" }
            ),
            Err(err) => println!("ERR {url}: {err}"),
        }
    }

    if let Some(active) = container.active().await {
        active.flush_background_writes().await;
        active.mark_redundant().await;
    }
    Ok(())
}
