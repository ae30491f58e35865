//! Network interception and caching engine.
//!
//! Attaches to a browser page target over the DevTools protocol, pauses
//! every request/response, applies configurable filter rules to decide
//! what to report, and serves/persists eligible responses through a
//! content-addressable on-disk cache.

pub mod cache;
pub mod cdp;
pub mod headers;
pub mod rules;
pub mod target;
pub mod watcher;

pub use cache::{should_cache, CacheEntry, CacheStore, CachedResponse};
pub use cdp::{CdpClient, FetchControl, PendingBody, ResponseBody};
pub use headers::{filter_headers, HeaderEntry, PostData, RawHeaders};
pub use rules::{CacheRules, HeaderMatcher, UrlMatcher, WatcherRules};
pub use target::{list_page_targets, page_target, target_by_id, wait_for_browser, PageTarget};
pub use watcher::{NetworkWatcher, PausedRequest, WatcherEvent};
