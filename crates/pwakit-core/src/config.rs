//! Application configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{PwaError, PwaResult};

/// Upper bound for the poll interval and fetch timeout (one week).
const MAX_WORKER_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration for a cached web app
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Prefix of every cache bucket name (`<app_name>-cache-v<version>`)
    pub app_name: String,

    /// Root URL the app is served from
    pub origin: Url,

    /// Worker script, relative to `origin`
    pub script_path: String,

    /// Version descriptor, relative to `origin`
    pub version_path: String,

    /// Auxiliary metadata document whose `version` field tracks the descriptor
    pub metadata_path: String,

    /// Root document served to navigations when offline
    pub shell_path: String,

    /// Resources that must be cached at install time
    pub static_assets: Vec<String>,

    /// URL substrings always fetched network-first with plain cache fallback
    pub always_fresh: Vec<String>,

    /// URL substrings served cache-first
    pub cache_first: Vec<String>,

    /// Version used for the bucket name when the descriptor is unreachable
    pub default_version: String,

    /// Cache controller settings
    pub worker: WorkerConfig,

    /// Update coordinator settings
    pub page: PageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between version checks
    pub poll_interval_secs: u64,

    /// Upper bound for a version-check fetch, in seconds
    pub fetch_timeout_secs: u64,

    /// Ask to be promoted as soon as install finishes
    pub skip_waiting_on_install: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    /// Delay before the automatic reload after an update message
    pub version_reload_delay_ms: u64,

    /// Delay between "update now" and the reload
    pub update_reload_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "ios-test-app".to_string(),
            origin: Url::parse("http://localhost:8080/").expect("static URL is valid"),
            script_path: "./service-worker.js".to_string(),
            version_path: "./version.json".to_string(),
            metadata_path: "./manifest.json".to_string(),
            shell_path: "./index.html".to_string(),
            static_assets: [
                "./",
                "./index.html",
                "./styles.css",
                "./app.js",
                "./visitor-tracker.js",
                "./audience-counter.js",
                "./github-api-helper.js",
                "./manifest.json",
                "./version.json",
                "./cv.txt",
                "./cover letter.txt",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            always_fresh: ["manifest.json", "cv.txt", "cover letter.txt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cache_first: Vec::new(),
            default_version: "1.0.8".to_string(),
            worker: WorkerConfig::default(),
            page: PageConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120, // 2 minutes
            fetch_timeout_secs: 10,
            skip_waiting_on_install: true,
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            version_reload_delay_ms: 5000,
            update_reload_delay_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl PageConfig {
    pub fn version_reload_delay(&self) -> Duration {
        Duration::from_millis(self.version_reload_delay_ms)
    }

    pub fn update_reload_delay(&self) -> Duration {
        Duration::from_millis(self.update_reload_delay_ms)
    }
}

impl AppConfig {
    /// Create a configuration for an app served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> PwaResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> PwaResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> PwaResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(PwaError::config("app_name must not be empty"));
        }
        for (field, secs) in [
            ("worker.poll_interval_secs", self.worker.poll_interval_secs),
            ("worker.fetch_timeout_secs", self.worker.fetch_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_WORKER_PERIOD_SECS {
                return Err(PwaError::config(format!(
                    "{field} must be between 1 and {MAX_WORKER_PERIOD_SECS}, got {secs}"
                )));
            }
        }
        let version_url = self.resolve(&self.version_path)?;
        let listed = self
            .static_assets
            .iter()
            .filter_map(|asset| self.resolve(asset).ok())
            .any(|url| url == version_url);
        if !listed {
            return Err(PwaError::config(format!(
                "static_assets must include the version descriptor '{}'",
                self.version_path
            )));
        }
        Ok(())
    }

    /// Resolve a path relative to the app origin.
    pub fn resolve(&self, path: &str) -> PwaResult<Url> {
        Ok(self.origin.join(path)?)
    }

    /// Name of the cache bucket for `version`.
    pub fn cache_name(&self, version: &str) -> String {
        format!("{}-cache-v{}", self.app_name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.page.version_reload_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_cache_name_embeds_version() {
        let config = AppConfig {
            app_name: "app".into(),
            ..Default::default()
        };
        assert_eq!(config.cache_name("3"), "app-cache-v3");
        assert_eq!(AppConfig::default().cache_name("1.0.8"), "ios-test-app-cache-v1.0.8");
    }

    #[test]
    fn test_resolve_relative_paths() {
        let config =
            AppConfig::for_origin(Url::parse("https://example.github.io/demo/").unwrap());
        assert_eq!(
            config.resolve("./version.json").unwrap().as_str(),
            "https://example.github.io/demo/version.json"
        );
        assert_eq!(
            config.resolve("./").unwrap().as_str(),
            "https://example.github.io/demo/"
        );
        assert_eq!(
            config.resolve("./cover letter.txt").unwrap().as_str(),
            "https://example.github.io/demo/cover%20letter.txt"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.worker.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(PwaError::Config(_))));

        let mut config = AppConfig::default();
        config.worker.poll_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.fetch_timeout_secs = MAX_WORKER_PERIOD_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.app_name = " ".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.static_assets.retain(|a| a != "./version.json");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwakit.json");
        std::fs::write(
            &path,
            r#"{ "app_name": "demo", "worker": { "poll_interval_secs": 300 } }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.app_name, "demo");
        assert_eq!(config.worker.poll_interval_secs, 300);
        assert_eq!(config.worker.fetch_timeout_secs, 10);
        assert_eq!(config.static_assets.len(), 11);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwakit.json");
        let mut config = AppConfig::default();
        config.cache_first.push("/fonts/".into());
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.cache_first, vec!["/fonts/".to_string()]);
    }
}
