//! Content-addressable response cache.
//!
//! Entries are keyed by the sha256 of the URL with its query string
//! stripped. Each entry is two files under the cache directory: the hex
//! digest holds the raw body (base64 text when the origin body was
//! base64-encoded) and `<digest>.info` holds JSON metadata. Metadata lands
//! before the body; a reader that finds metadata without a body file
//! treats the entry as a miss.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use netwatch_core::Result;

use crate::headers::{HeaderEntry, PostData};
use crate::rules::CacheRules;

/// Headers never persisted with an entry.
const DROPPED_ON_WRITE: &[&str] = &["cookie", "set-cookie", "authorization"];
/// Headers never replayed on a hit.
const DROPPED_ON_READ: &[&str] = &["last-modified", "etag", "content-type", "content-length"];

static S_MAXAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)s-maxage\s*=\s*(\d+)").unwrap());
static MAX_AGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)max-age\s*=\s*(\d+)").unwrap());

/// Persisted metadata for one cached URL (the `.info` file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub url: String,
    #[serde(default)]
    pub response_headers: Vec<HeaderEntry>,
    /// Epoch millis after which the entry is stale. Absent means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    /// Whether the body file holds base64 text rather than plain text.
    /// Finalized when the body fetch resolves; the body file is the hit
    /// gate, so readers never observe a stale value.
    #[serde(default)]
    pub base64_encoded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<PostData>,
}

/// A cache hit, ready to fulfill the paused request.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub headers: Vec<HeaderEntry>,
    pub body: String,
    pub base64_encoded: bool,
}

/// Write eligibility: the method's matcher must match the URL and the
/// response must not forbid caching. A missing `Cache-Control` is cacheable.
pub fn should_cache(rules: &CacheRules, method: &str, url: &str, cache_control: Option<&str>) -> bool {
    if !rules.allows(method, url) {
        return false;
    }
    match cache_control {
        Some(value) => {
            let value = value.to_lowercase();
            !value.contains("no-cache") && !value.contains("no-store")
        }
        None => true,
    }
}

/// TTL from `Cache-Control`. `s-maxage` wins over `max-age`; the base is
/// the response's `Date` header when parseable, else `now`.
pub fn compute_valid_until(
    cache_control: Option<&str>,
    date_header: Option<&str>,
    now: DateTime<Utc>,
) -> Option<i64> {
    let cache_control = cache_control?;
    let seconds = S_MAXAGE_RE
        .captures(cache_control)
        .or_else(|| MAX_AGE_RE.captures(cache_control))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())?;
    let response_date = date_header
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(now);
    Some(response_date.timestamp_millis() + seconds * 1000)
}

fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key for a URL: sha256 hex digest of the URL with its query
    /// string stripped. Differing query strings on the same path collide;
    /// the stored `url` disambiguates on read.
    pub fn cache_key(url: &str) -> String {
        let without_query = url.split('?').next().unwrap_or(url);
        let mut hasher = Sha256::new();
        hasher.update(without_query.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn info_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.info", key))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Create the directory on first use, with a marker file so external
    /// tooling ignores cache contents.
    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let marker = self.dir.join(".gitignore");
        if !marker.exists() {
            std::fs::write(marker, "*\n")?;
        }
        Ok(())
    }

    /// Persist an entry's metadata. Volatile request-identifying headers
    /// are stripped before hitting disk.
    pub fn write_metadata(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.ensure_dir()?;
        let mut entry = entry.clone();
        entry
            .response_headers
            .retain(|h| !DROPPED_ON_WRITE.contains(&h.name.to_lowercase().as_str()));
        std::fs::write(self.info_path(key), serde_json::to_string(&entry)?)?;
        Ok(())
    }

    /// Persist an entry's body. Written to a temp path and renamed so a
    /// concurrent reader never sees a partial body.
    pub fn write_body(&self, key: &str, body: &str) -> Result<()> {
        self.ensure_dir()?;
        let tmp = self.dir.join(format!("{}.tmp", key));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.body_path(key))?;
        Ok(())
    }

    /// Look up a URL. Read eligibility mirrors write eligibility: methods
    /// that would not be cached are not served from cache either. Any
    /// missing file, URL mismatch, expired TTL, or parse error is a miss.
    pub fn lookup(&self, rules: &CacheRules, method: &str, url: &str) -> Option<CachedResponse> {
        if !rules.allows(method, url) {
            return None;
        }

        let key = Self::cache_key(url);
        let info_path = self.info_path(&key);
        let body_path = self.body_path(&key);
        if !info_path.exists() || !body_path.exists() {
            return None;
        }

        let entry: CacheEntry = match std::fs::read_to_string(&info_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(entry) => entry,
            None => {
                debug!(key = %key, "Unreadable cache metadata, treating as miss");
                return None;
            }
        };

        let now = Utc::now();
        if !entry_is_fresh(&entry, url, now.timestamp_millis()) {
            return None;
        }

        let body = match std::fs::read_to_string(&body_path) {
            Ok(body) => body,
            Err(e) => {
                debug!(key = %key, error = %e, "Unreadable cache body, treating as miss");
                return None;
            }
        };

        let mut headers: Vec<HeaderEntry> = entry
            .response_headers
            .into_iter()
            .filter(|h| !DROPPED_ON_READ.contains(&h.name.to_lowercase().as_str()))
            .collect();
        headers.push(HeaderEntry::new("date", http_date(now)));

        Some(CachedResponse {
            headers,
            body,
            base64_encoded: entry.base64_encoded,
        })
    }

    /// Drop every entry (the directory itself is removed; it is recreated
    /// lazily on the next write).
    pub fn purge(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Entry count and body bytes, for maintenance tooling.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        if !self.dir.exists() {
            return Ok(stats);
        }
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".info") {
                stats.entries += 1;
            } else if name != ".gitignore" {
                if let Ok(meta) = dir_entry.metadata() {
                    stats.body_bytes += meta.len();
                }
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub body_bytes: u64,
}

fn entry_is_fresh(entry: &CacheEntry, url: &str, now_ms: i64) -> bool {
    // Stored URL must match exactly: differing query strings share a key.
    if entry.url != url {
        return false;
    }
    match entry.valid_until {
        Some(deadline) => {
            if deadline > now_ms {
                true
            } else {
                debug!(url = %url, "Cache entry expired");
                false
            }
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(url: &str, valid_until: Option<i64>) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            response_headers: vec![
                HeaderEntry::new("Content-Type", "application/json"),
                HeaderEntry::new("ETag", "\"v1\""),
                HeaderEntry::new("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
                HeaderEntry::new("Content-Length", "12"),
                HeaderEntry::new("X-Custom", "kept"),
            ],
            valid_until,
            base64_encoded: false,
            post: None,
        }
    }

    #[test]
    fn test_cache_key_strips_query() {
        let with_query = CacheStore::cache_key("https://x/a?x=1");
        let other_query = CacheStore::cache_key("https://x/a?x=2");
        let bare = CacheStore::cache_key("https://x/a");
        assert_eq!(with_query, other_query);
        assert_eq!(with_query, bare);
        assert_ne!(with_query, CacheStore::cache_key("https://x/b"));
        assert_eq!(with_query.len(), 64);
    }

    #[test]
    fn test_should_cache_respects_directives() {
        let rules = CacheRules::default();
        assert!(should_cache(&rules, "GET", "https://x/a", None));
        assert!(should_cache(&rules, "GET", "https://x/a", Some("max-age=60")));
        assert!(!should_cache(&rules, "GET", "https://x/a", Some("No-Store")));
        assert!(!should_cache(&rules, "GET", "https://x/a", Some("private, no-cache")));
        // Method gate applies regardless of directives
        assert!(!should_cache(&rules, "POST", "https://x/a", None));
    }

    #[test]
    fn test_valid_until_from_directives() {
        let now = Utc::now();
        assert_eq!(compute_valid_until(None, None, now), None);
        assert_eq!(compute_valid_until(Some("private"), None, now), None);

        let deadline = compute_valid_until(Some("max-age=60"), None, now).unwrap();
        assert_eq!(deadline, now.timestamp_millis() + 60_000);

        // s-maxage wins over max-age
        let deadline = compute_valid_until(Some("max-age=60, s-maxage=120"), None, now).unwrap();
        assert_eq!(deadline, now.timestamp_millis() + 120_000);

        // Date header anchors the deadline when present
        let date = "Tue, 01 Jul 2025 10:00:00 +0000";
        let parsed = DateTime::parse_from_rfc2822(date).unwrap().timestamp_millis();
        let deadline = compute_valid_until(Some("max-age=10"), Some(date), now).unwrap();
        assert_eq!(deadline, parsed + 10_000);

        // Garbage Date falls back to now
        let deadline = compute_valid_until(Some("max-age=10"), Some("not a date"), now).unwrap();
        assert_eq!(deadline, now.timestamp_millis() + 10_000);
    }

    #[test]
    fn test_round_trip_hit_sanitizes_headers() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let rules = CacheRules::default();
        let url = "https://x/data?x=1";
        let key = CacheStore::cache_key(url);

        let now_ms = Utc::now().timestamp_millis();
        let mut entry = sample_entry(url, Some(now_ms + 60_000));
        entry
            .response_headers
            .push(HeaderEntry::new("Set-Cookie", "session=abc"));
        store.write_metadata(&key, &entry).unwrap();
        store.write_body(&key, "{\"ok\":true}").unwrap();

        let hit = store.lookup(&rules, "GET", url).unwrap();
        assert_eq!(hit.body, "{\"ok\":true}");
        assert!(!hit.base64_encoded);

        let names: Vec<String> = hit.headers.iter().map(|h| h.name.to_lowercase()).collect();
        assert!(names.contains(&"x-custom".to_string()));

        // The replayed date is stamped at read time, not write time
        let date = hit
            .headers
            .iter()
            .find(|h| h.name == "date")
            .map(|h| DateTime::parse_from_rfc2822(&h.value).unwrap())
            .unwrap();
        assert!(date.timestamp_millis() >= now_ms - 2_000);
        for dropped in ["etag", "last-modified", "content-type", "content-length", "set-cookie"] {
            assert!(!names.contains(&dropped.to_string()), "{} leaked", dropped);
        }

        // Marker file exists exactly once per directory
        assert_eq!(std::fs::read_to_string(store.dir().join(".gitignore")).unwrap(), "*\n");
    }

    #[test]
    fn test_query_mismatch_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let rules = CacheRules::default();

        let stored_url = "https://x/a?x=1";
        let key = CacheStore::cache_key(stored_url);
        store
            .write_metadata(&key, &sample_entry(stored_url, None))
            .unwrap();
        store.write_body(&key, "body").unwrap();

        // Same stripped path, same key, different query string
        assert!(store.lookup(&rules, "GET", "https://x/a?x=2").is_none());
        assert!(store.lookup(&rules, "GET", stored_url).is_some());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let rules = CacheRules::default();
        let url = "https://x/a";
        let key = CacheStore::cache_key(url);

        let now_ms = Utc::now().timestamp_millis();
        store
            .write_metadata(&key, &sample_entry(url, Some(now_ms + 60_000)))
            .unwrap();
        store.write_body(&key, "body").unwrap();
        assert!(store.lookup(&rules, "GET", url).is_some());

        store
            .write_metadata(&key, &sample_entry(url, Some(now_ms - 1)))
            .unwrap();
        assert!(store.lookup(&rules, "GET", url).is_none());
    }

    #[test]
    fn test_metadata_without_body_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let rules = CacheRules::default();
        let url = "https://x/a";
        let key = CacheStore::cache_key(url);

        store.write_metadata(&key, &sample_entry(url, None)).unwrap();
        assert!(store.lookup(&rules, "GET", url).is_none());

        store.write_body(&key, "body").unwrap();
        assert!(store.lookup(&rules, "GET", url).is_some());
    }

    #[test]
    fn test_read_gated_by_write_policy() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let url = "https://x/a";
        let key = CacheStore::cache_key(url);
        store.write_metadata(&key, &sample_entry(url, None)).unwrap();
        store.write_body(&key, "body").unwrap();

        // POST never caches by default, so it never reads either
        assert!(store.lookup(&CacheRules::default(), "POST", url).is_none());
    }

    #[test]
    fn test_base64_flag_round_trips() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let rules = CacheRules::default();
        let url = "https://x/img.png";
        let key = CacheStore::cache_key(url);

        let mut entry = sample_entry(url, None);
        store.write_metadata(&key, &entry).unwrap();
        entry.base64_encoded = true;
        store.write_metadata(&key, &entry).unwrap();
        store.write_body(&key, "aGVsbG8=").unwrap();

        let hit = store.lookup(&rules, "GET", url).unwrap();
        assert!(hit.base64_encoded);
        assert_eq!(hit.body, "aGVsbG8=");
    }

    #[test]
    fn test_purge_and_stats() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::new(temp.path().join("cache"));
        let url = "https://x/a";
        let key = CacheStore::cache_key(url);
        store.write_metadata(&key, &sample_entry(url, None)).unwrap();
        store.write_body(&key, "12345").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.body_bytes, 5);

        store.purge().unwrap();
        assert!(!store.dir().exists());
        assert_eq!(store.stats().unwrap().entries, 0);
    }
}
