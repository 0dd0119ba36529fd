//! What the coordinator needs from the page.

use serde::Serialize;

/// Shown when an update message carries no description.
pub const DEFAULT_DESCRIPTION: &str = "New version available";

/// Which banner an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKind {
    /// A new worker is installed and waiting.
    Waiting,
    /// The worker reported a new version descriptor.
    Version,
}

/// A banner to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Banner {
    /// Low-urgency prompt offering "update now" or "dismiss".
    Waiting,
    /// Version change notice; the page reloads on its own shortly after.
    Version {
        version: String,
        old_version: String,
        description: String,
    },
}

impl Banner {
    pub fn version(
        version: impl Into<String>,
        old_version: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Banner::Version {
            version: version.into(),
            old_version: old_version.into(),
            description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        }
    }

    pub fn kind(&self) -> BannerKind {
        match self {
            Banner::Waiting => BannerKind::Waiting,
            Banner::Version { .. } => BannerKind::Version,
        }
    }

    /// Text for the banner body.
    pub fn message(&self) -> String {
        match self {
            Banner::Waiting => "A new version is ready. Update now?".to_string(),
            Banner::Version {
                version,
                old_version,
                description,
            } => format!("{description}: v{old_version} → v{version}"),
        }
    }
}

/// The page's rendering and navigation surface.
///
/// Called from the coordinator's tasks; implementations must not block.
pub trait PageUi: Send + Sync {
    fn show_banner(&self, banner: &Banner);

    /// Seconds left before the automatic reload.
    fn update_countdown(&self, seconds_left: u64);

    fn hide_banner(&self, kind: BannerKind);

    /// Reload the page. Called at most once per coordinator.
    fn reload(&self);
}
