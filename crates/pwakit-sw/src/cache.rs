//! Cache buckets.
//!
//! A [`CacheStorage`] holds every bucket of an origin. Exactly one bucket is
//! authoritative for a given controller; the rest are garbage once
//! activation finishes.

use hashbrown::HashMap;
use pwakit_common::now_millis;
use pwakit_net::Response;
use tracing::trace;

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL (cache key).
    pub url: String,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// A cache bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Bucket name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a request URL.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Store a response, replacing any previous entry for `url`.
    pub fn put(&mut self, url: &str, response: Response) {
        trace!(cache = %self.name, url, "Cache put");
        self.entries.insert(
            url.to_string(),
            CacheEntry {
                url: url.to_string(),
                response,
                cached_at: now_millis(),
            },
        );
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All buckets of an origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bucket (creates if it doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a bucket without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a bucket.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all bucket names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete every bucket except `keep`. Returns the deleted names.
    pub fn retain_only(&mut self, keep: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();
        for name in &stale {
            self.caches.remove(name);
        }
        stale
    }

    /// Look up `url` in one bucket.
    pub fn match_in(&self, name: &str, url: &str) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(url)
    }

    /// Look up `url`, trying `preferred` first and then every other bucket.
    pub fn match_request(&self, preferred: &str, url: &str) -> Option<&CacheEntry> {
        self.match_in(preferred, url).or_else(|| {
            self.caches
                .values()
                .filter(|cache| cache.name != preferred)
                .find_map(|cache| cache.match_request(url))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;

    fn response(path: &str, body: &'static str) -> Response {
        let url = Url::parse("https://app.test/").unwrap().join(path).unwrap();
        Response::new(url, StatusCode::OK, body)
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("app-cache-v1");
        cache.put("https://app.test/style.css", response("style.css", "body{}"));

        let entry = cache.match_request("https://app.test/style.css").unwrap();
        assert_eq!(entry.response.text().unwrap(), "body{}");
        assert!(entry.cached_at > 0);
        assert!(cache.match_request("https://app.test/other.css").is_none());
    }

    #[test]
    fn test_cache_put_replaces() {
        let mut cache = Cache::new("v1");
        cache.put("https://app.test/a.js", response("a.js", "one"));
        cache.put("https://app.test/a.js", response("a.js", "two"));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache
                .match_request("https://app.test/a.js")
                .unwrap()
                .response
                .text()
                .unwrap(),
            "two"
        );
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        cache.put("https://app.test/style.css", response("style.css", ""));
        assert!(cache.delete("https://app.test/style.css"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new();

        assert!(!storage.has("v1"));

        storage.open("v1");
        assert!(storage.has("v1"));

        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[test]
    fn test_retain_only() {
        let mut storage = CacheStorage::new();
        storage.open("app-cache-v1");
        storage.open("app-cache-v2");
        storage.open("app-cache-v3");

        let mut deleted = storage.retain_only("app-cache-v3");
        deleted.sort();
        assert_eq!(deleted, vec!["app-cache-v1", "app-cache-v2"]);
        assert_eq!(storage.keys(), vec!["app-cache-v3".to_string()]);
    }

    #[test]
    fn test_match_prefers_named_bucket() {
        let mut storage = CacheStorage::new();
        storage
            .open("old")
            .put("https://app.test/", response("./", "old shell"));
        storage
            .open("live")
            .put("https://app.test/", response("./", "live shell"));

        let entry = storage.match_request("live", "https://app.test/").unwrap();
        assert_eq!(entry.response.text().unwrap(), "live shell");

        storage.delete("live");
        let entry = storage.match_request("live", "https://app.test/").unwrap();
        assert_eq!(entry.response.text().unwrap(), "old shell");
    }
}
