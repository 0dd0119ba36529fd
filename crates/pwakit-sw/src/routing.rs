//! Fetch routing: which strategy handles which request.

use std::borrow::Cow;

use pwakit_core::AppConfig;
use pwakit_net::Request;
use tracing::trace;

use crate::ServiceWorkerError;

/// Type of request pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// URL path match, ignoring query and fragment.
    Path,
    /// Prefix match.
    Prefix,
    /// Suffix match.
    Suffix,
    /// Contains substring (raw or percent-decoded URL).
    Contains,
    /// Top-level navigation, whatever the URL.
    Navigation,
    /// Everything.
    Any,
}

/// Predicate over a request.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pub pattern_type: PatternType,
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::new(PatternType::Exact, url)
    }

    /// Match a URL path exactly.
    pub fn path(path: &str) -> Self {
        Self::new(PatternType::Path, path)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::new(PatternType::Prefix, prefix)
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::new(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::new(PatternType::Contains, substring)
    }

    /// Match navigation requests.
    pub fn navigation() -> Self {
        Self::new(PatternType::Navigation, "")
    }

    /// Match every request.
    pub fn any() -> Self {
        Self::new(PatternType::Any, "")
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a request matches this pattern.
    pub fn matches(&self, request: &Request) -> bool {
        let url_str = request.url.as_str();
        match self.pattern_type {
            PatternType::Exact => url_str == self.pattern,
            PatternType::Path => request.url.path() == self.pattern,
            PatternType::Prefix => url_str.starts_with(&self.pattern),
            PatternType::Suffix => url_str.ends_with(&self.pattern),
            PatternType::Contains => {
                url_str.contains(&self.pattern)
                    || decoded(url_str).contains(self.pattern.as_str())
            }
            PatternType::Navigation => request.is_navigation(),
            PatternType::Any => true,
        }
    }
}

fn decoded(url: &str) -> Cow<'_, str> {
    urlencoding::decode(url).unwrap_or(Cow::Borrowed(url))
}

/// What to serve when the network fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The cached copy of the same URL; otherwise the network error.
    CachedCopy,
    /// The cached root document (offline shell).
    OfflineShell(String),
    /// The cached copy of the same URL; otherwise `ResourceUnavailable`.
    CachedOrUnavailable,
}

/// How a matched request is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Network, store a clone, fall back per [`Fallback`].
    NetworkFirst(Fallback),
    /// Cache if present, else network (stored on success).
    CacheFirst,
}

/// One row of the routing table.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub name: String,
    pub pattern: UrlPattern,
    pub strategy: Strategy,
}

impl RoutingEntry {
    pub fn new(name: impl Into<String>, pattern: UrlPattern, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            pattern,
            strategy,
        }
    }
}

/// Ordered routing table. First match wins; the default row matches
/// everything, so every request resolves to exactly one strategy.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
    default: RoutingEntry,
}

impl RoutingTable {
    /// Create a table whose only row is network-first with cache fallback.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            default: RoutingEntry::new(
                "default",
                UrlPattern::any(),
                Strategy::NetworkFirst(Fallback::CachedOrUnavailable),
            ),
        }
    }

    /// Append a row ahead of the default row.
    pub fn push(&mut self, entry: RoutingEntry) {
        self.entries.push(entry);
    }

    /// Build the table for an app:
    ///
    /// 1. version descriptor: network-first, cached copy
    /// 2. always-fresh documents: network-first, cached copy
    /// 3. cache-first paths
    /// 4. navigations: network-first, offline shell
    /// 5. everything else: network-first, cached copy or unavailable
    pub fn for_config(config: &AppConfig) -> Result<Self, ServiceWorkerError> {
        let mut table = Self::new();

        let version_url = config.resolve(&config.version_path)?;
        table.push(RoutingEntry::new(
            "version",
            UrlPattern::path(version_url.path()),
            Strategy::NetworkFirst(Fallback::CachedCopy),
        ));

        for fresh in &config.always_fresh {
            table.push(RoutingEntry::new(
                format!("always-fresh:{fresh}"),
                UrlPattern::contains(fresh),
                Strategy::NetworkFirst(Fallback::CachedCopy),
            ));
        }

        for path in &config.cache_first {
            table.push(RoutingEntry::new(
                format!("cache-first:{path}"),
                UrlPattern::contains(path),
                Strategy::CacheFirst,
            ));
        }

        let shell_url = config.resolve(&config.shell_path)?;
        table.push(RoutingEntry::new(
            "navigation",
            UrlPattern::navigation(),
            Strategy::NetworkFirst(Fallback::OfflineShell(shell_url.to_string())),
        ));

        Ok(table)
    }

    /// Find the row that handles `request`.
    pub fn route(&self, request: &Request) -> &RoutingEntry {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.pattern.matches(request))
            .unwrap_or(&self.default);
        trace!(url = %request.url, route = %entry.name, "Routed request");
        entry
    }

    /// Rows in evaluation order, default last.
    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter().chain(std::iter::once(&self.default))
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
