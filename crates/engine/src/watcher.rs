//! The network watcher engine.
//!
//! Owns the rules, the cache store, and at most one debugger attachment.
//! Each paused-request notification is classified by phase (the presence
//! of `responseHeaders` is the sole discriminant), checked against the
//! watcher rules for observability and against the cache rules for
//! read/write-through, and then continued or fulfilled. Whatever goes
//! wrong while handling one event, the request is never left hanging.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use netwatch_core::{Paths, PluginManifest, Result};

use crate::cache::{self, CacheEntry, CacheStore};
use crate::cdp::{CdpClient, FetchControl, ResponseBody};
use crate::headers::{self, filter_headers, pair_value, HeaderEntry, PostData, RawHeaders};
use crate::rules::{CacheRules, WatcherRules};
use crate::target::PageTarget;

/// One paused-request notification, as the protocol delivers it.
/// Response-phase events carry `responseHeaders`; request-phase events
/// do not.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedRequest {
    pub request_id: String,
    pub request: RequestInfo,
    #[serde(default)]
    pub response_headers: Option<Vec<HeaderEntry>>,
    #[serde(default)]
    pub response_status_code: Option<u16>,
    #[serde(default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
}

/// Observer events, named after the phase that produced them. The host
/// decides how to surface these; the engine knows nothing about framing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum WatcherEvent {
    Request {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
    },
    Response {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
        #[serde(rename = "responseHeaders")]
        response_headers: BTreeMap<String, String>,
        response: ResponseBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        post: Option<PostData>,
    },
}

/// What the dispatcher decided for one paused request.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Continue,
    Fulfilled,
}

struct EngineState {
    rules: RwLock<WatcherRules>,
    cache_rules: RwLock<CacheRules>,
    cache: RwLock<Option<CacheStore>>,
    events: mpsc::Sender<WatcherEvent>,
}

struct Attachment {
    target_id: String,
    cdp: Arc<CdpClient>,
    dispatch: tokio::task::JoinHandle<()>,
}

/// The engine. Instantiated by its host with an observer channel; rules
/// and cache configuration are injected via the `load_*` methods and can
/// be swapped mid-session without detaching.
pub struct NetworkWatcher {
    state: Arc<EngineState>,
    attachment: Arc<Mutex<Option<Attachment>>>,
}

impl NetworkWatcher {
    pub fn new(events: mpsc::Sender<WatcherEvent>) -> Self {
        Self {
            state: Arc::new(EngineState {
                rules: RwLock::new(WatcherRules::default()),
                cache_rules: RwLock::new(CacheRules::default()),
                cache: RwLock::new(None),
                events,
            }),
            attachment: Arc::new(Mutex::new(None)),
        }
    }

    /// Rebuild the watcher rules from a raw `networkWatcherRules` value.
    pub async fn load_watcher_rules(&self, raw: Option<&Value>) {
        *self.state.rules.write().await = WatcherRules::from_value(raw);
    }

    /// Rebuild the cache rules from a raw `networkCacheRules` value and
    /// re-derive the cache directory. `None` disables caching entirely.
    pub async fn load_cache_rules(&self, raw: Option<&Value>, cache_dir: Option<PathBuf>) {
        *self.state.cache_rules.write().await = CacheRules::from_value(raw);
        *self.state.cache.write().await = cache_dir.map(CacheStore::new);
    }

    /// Apply a plugin manifest: watcher rules, cache rules, and the cache
    /// directory (the manifest's `cachePath` or the per-plugin default).
    pub async fn configure(&self, manifest: &PluginManifest, paths: &Paths) {
        self.load_watcher_rules(manifest.network_watcher_rules.as_ref())
            .await;
        let cache_dir = manifest
            .cache_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.plugin_cache_dir(&manifest.name));
        self.load_cache_rules(manifest.network_cache_rules.as_ref(), Some(cache_dir))
            .await;
    }

    pub async fn is_attached(&self) -> bool {
        self.attachment.lock().await.is_some()
    }

    /// Attach to a page target. An existing attachment is torn down first.
    /// A session that cannot be opened is logged and leaves the engine
    /// detached; further traffic operations are no-ops until a later
    /// attach succeeds.
    pub async fn attach(&self, target: &PageTarget) -> Result<()> {
        self.detach().await;

        let cdp = match CdpClient::connect(&target.ws_url).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(target_id = %target.id, error = %e, "Debugger attach failed");
                return Ok(());
            }
        };

        let mut paused_rx = cdp.subscribe("Fetch.requestPaused").await;
        let mut closed_rx = cdp.closed();

        let state = self.state.clone();
        let attachment_slot = self.attachment.clone();
        let control: Arc<dyn FetchControl> = cdp.clone();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = paused_rx.recv() => match maybe {
                        Some(params) => dispatch_paused(&state, control.as_ref(), params).await,
                        None => break,
                    },
                    changed = closed_rx.changed() => {
                        if changed.is_err() || *closed_rx.borrow() {
                            info!("Debugger session gone, clearing attachment");
                            attachment_slot.lock().await.take();
                            break;
                        }
                    }
                }
            }
        });

        if let Err(e) = cdp.enable_interception().await {
            warn!(target_id = %target.id, error = %e, "Failed to enable request interception");
            dispatch.abort();
            return Ok(());
        }

        *self.attachment.lock().await = Some(Attachment {
            target_id: target.id.clone(),
            cdp,
            dispatch,
        });
        info!(target_id = %target.id, url = %target.url, "Network watcher attached");
        Ok(())
    }

    /// Tear down the attachment. Local state clears whether or not the
    /// session acknowledges, since the view may already be gone.
    pub async fn detach(&self) {
        let attachment = self.attachment.lock().await.take();
        if let Some(attachment) = attachment {
            if let Ok(Err(e)) = tokio::time::timeout(
                Duration::from_secs(2),
                attachment.cdp.disable_interception(),
            )
            .await
            {
                debug!(error = %e, "Fetch.disable failed during detach");
            }
            attachment.dispatch.abort();
            info!(target_id = %attachment.target_id, "Network watcher detached");
        }
    }
}

/// Handle one paused-request notification. Errors are isolated to the
/// affected request id; unless the handler fulfilled the request, exactly
/// one continue is issued.
async fn dispatch_paused(state: &EngineState, control: &dyn FetchControl, params: Value) {
    let request_id = params
        .get("requestId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let action = match serde_json::from_value::<PausedRequest>(params) {
        Ok(event) => match handle_paused(state, control, event).await {
            Ok(action) => action,
            Err(e) => {
                warn!(request_id = ?request_id, error = %e, "Error handling paused request");
                Action::Continue
            }
        },
        Err(e) => {
            warn!(request_id = ?request_id, error = %e, "Unparsable paused-request payload");
            Action::Continue
        }
    };

    if action == Action::Continue {
        if let Some(request_id) = request_id {
            if let Err(e) = control.continue_request(&request_id).await {
                debug!(request_id = %request_id, error = %e, "continueRequest failed");
            }
        }
    }
}

async fn handle_paused(
    state: &EngineState,
    control: &dyn FetchControl,
    event: PausedRequest,
) -> Result<Action> {
    match event.response_headers {
        None => handle_request_phase(state, control, event).await,
        Some(_) => handle_response_phase(state, control, event).await,
    }
}

/// Request phase: report the request if watched, then try to serve it
/// from cache. A hit short-circuits the network; the Response phase for
/// this request id never occurs.
async fn handle_request_phase(
    state: &EngineState,
    control: &dyn FetchControl,
    event: PausedRequest,
) -> Result<Action> {
    let url = &event.request.url;

    {
        let rules = state.rules.read().await;
        if rules.request.matches(url) {
            let headers = filter_headers(RawHeaders::Map(&event.request.headers), &rules.headers);
            let _ = state
                .events
                .send(WatcherEvent::Request {
                    method: event.request.method.clone(),
                    url: url.clone(),
                    headers,
                })
                .await;
        }
    }

    let hit = {
        let cache_rules = state.cache_rules.read().await;
        let cache = state.cache.read().await;
        cache
            .as_ref()
            .and_then(|store| store.lookup(&cache_rules, &event.request.method, url))
    };

    if let Some(hit) = hit {
        use base64::Engine as _;
        let body = if hit.base64_encoded {
            hit.body
        } else {
            base64::engine::general_purpose::STANDARD.encode(hit.body.as_bytes())
        };
        debug!(request_id = %event.request_id, url = %url, "Serving paused request from cache");
        if let Err(e) = control
            .fulfill_request(&event.request_id, 200, &hit.headers, &body)
            .await
        {
            warn!(request_id = %event.request_id, error = %e, "fulfillRequest failed");
        }
        return Ok(Action::Fulfilled);
    }

    Ok(Action::Continue)
}

/// Response phase: observability and cache-worthiness are decided
/// independently. When either needs the body, the fetch command goes on
/// the wire ahead of the continue, and the rest happens in a spawned
/// continuation so other events keep dispatching.
async fn handle_response_phase(
    state: &EngineState,
    control: &dyn FetchControl,
    event: PausedRequest,
) -> Result<Action> {
    let response_headers: &[HeaderEntry] = event.response_headers.as_deref().unwrap_or(&[]);
    let url = event.request.url.clone();
    let method = event.request.method.clone();

    let observing = state.rules.read().await.response.matches(&url);

    let cache_control = pair_value(response_headers, "cache-control");
    let store = {
        let cache_rules = state.cache_rules.read().await;
        let cache = state.cache.read().await;
        match cache.as_ref() {
            Some(store) if cache::should_cache(&cache_rules, &method, &url, cache_control) => {
                Some(store.clone())
            }
            _ => None,
        }
    };

    if !observing && store.is_none() {
        return Ok(Action::Continue);
    }

    let pending = control.fetch_response_body(&event.request_id).await?;

    let post = (method == "POST")
        .then(|| headers::post_payload(&event.request.headers, event.request.post_data.as_deref()));

    let key = CacheStore::cache_key(&url);
    let entry = match store.as_ref() {
        Some(store) => {
            let entry = CacheEntry {
                url: url.clone(),
                response_headers: response_headers.to_vec(),
                valid_until: cache::compute_valid_until(
                    cache_control,
                    pair_value(response_headers, "date"),
                    Utc::now(),
                ),
                base64_encoded: false,
                post: post.clone(),
            };
            // Metadata lands now; the body follows once the fetch resolves.
            match store.write_metadata(&key, &entry) {
                Ok(()) => Some(entry),
                Err(e) => {
                    warn!(url = %url, error = %e, "Cache metadata write failed");
                    None
                }
            }
        }
        None => None,
    };

    let observed = if observing {
        let rules = state.rules.read().await;
        Some((
            filter_headers(RawHeaders::Map(&event.request.headers), &rules.headers),
            filter_headers(RawHeaders::Pairs(response_headers), &rules.headers),
        ))
    } else {
        None
    };

    let events = state.events.clone();
    let request_id = event.request_id.clone();
    tokio::spawn(async move {
        let body = match pending.resolve().await {
            Ok(body) => body,
            Err(e) => {
                debug!(request_id = %request_id, error = %e, "Response body fetch failed");
                return;
            }
        };

        if let Some((headers, filtered_response_headers)) = observed {
            let _ = events
                .send(WatcherEvent::Response {
                    method: method.clone(),
                    url: url.clone(),
                    headers,
                    response_headers: filtered_response_headers,
                    response: body.clone(),
                    post: post.clone(),
                })
                .await;
        }

        if let (Some(store), Some(mut entry)) = (store, entry) {
            if body.base64_encoded {
                entry.base64_encoded = true;
                if let Err(e) = store.write_metadata(&key, &entry) {
                    warn!(url = %url, error = %e, "Cache metadata update failed");
                    return;
                }
            }
            if let Err(e) = store.write_body(&key, &body.body) {
                warn!(url = %url, error = %e, "Cache body write failed");
            }
        }
    });

    Ok(Action::Continue)
}
