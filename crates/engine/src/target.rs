//! Page-target discovery over the browser's HTTP debugging endpoint.
//!
//! The engine never creates or destroys targets; the host picks one of the
//! debuggable pages listed here and hands it to the watcher.

use serde::Deserialize;
use tracing::debug;

use netwatch_core::{Error, Result};

/// One debuggable target from `/json/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct PageTarget {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: String,
}

/// Wait for the browser's debugging endpoint to come up. Polls
/// `/json/version` until it responds, up to `timeout_secs`.
pub async fn wait_for_browser(port: u16, timeout_secs: u64) -> Result<()> {
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Timeout(format!(
                "Browser debugging endpoint not ready after {}s on port {}",
                timeout_secs, port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if resp.status().is_success() {
                return Ok(());
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// List the debuggable page targets (other target kinds are skipped).
pub async fn list_page_targets(port: u16) -> Result<Vec<PageTarget>> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to query {}: {}", url, e)))?;
    let targets: Vec<PageTarget> = resp
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("Unparsable target list from {}: {}", url, e)))?;
    Ok(targets
        .into_iter()
        .filter(|t| t.target_type == "page" && !t.ws_url.is_empty())
        .collect())
}

/// First debuggable page target, with retries (the page may not appear
/// immediately after launch).
pub async fn page_target(port: u16) -> Result<PageTarget> {
    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }

        match list_page_targets(port).await {
            Ok(targets) => {
                if let Some(target) = targets.into_iter().next() {
                    return Ok(target);
                }
            }
            Err(e) => debug!(attempt, error = %e, "Target listing not ready"),
        }
    }

    Err(Error::NotFound(format!(
        "No debuggable page target on port {} after retries",
        port
    )))
}

/// Resolve a specific target id to its page target.
pub async fn target_by_id(port: u16, target_id: &str) -> Result<PageTarget> {
    let targets = list_page_targets(port).await?;
    targets
        .into_iter()
        .find(|t| t.id == target_id)
        .ok_or_else(|| Error::NotFound(format!("No page target with id '{}'", target_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_list_parsing() {
        let raw = r#"[
            {
                "id": "AAAA",
                "title": "Game",
                "type": "page",
                "url": "https://game.example/play",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/AAAA"
            },
            {
                "id": "BBBB",
                "title": "worker",
                "type": "service_worker",
                "url": "https://game.example/sw.js",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/BBBB"
            }
        ]"#;

        let targets: Vec<PageTarget> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets.len(), 2);

        let pages: Vec<&PageTarget> =
            targets.iter().filter(|t| t.target_type == "page").collect();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].id, "AAAA");
        assert!(pages[0].ws_url.starts_with("ws://"));
    }
}
