//! Browser launching for standalone use. The engine only ever borrows a
//! page target; creating and destroying the browser is host business and
//! stays here in the CLI.

use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

pub struct LaunchedBrowser {
    pub port: u16,
    process: Child,
}

impl LaunchedBrowser {
    pub async fn close(&mut self) {
        let _ = self.process.kill().await;
    }
}

impl Drop for LaunchedBrowser {
    fn drop(&mut self) {
        // Best-effort kill on drop
        let _ = self.process.start_kill();
    }
}

/// Launch a Chromium-family browser with remote debugging on a free port
/// and wait for the endpoint to come up.
pub async fn launch(url: &str, user_data_dir: &Path, headed: bool) -> anyhow::Result<LaunchedBrowser> {
    let binary = find_browser_binary()
        .ok_or_else(|| anyhow::anyhow!("No Chromium-family browser found. Please install one."))?;

    std::fs::create_dir_all(user_data_dir)?;
    let port = find_free_port().await?;
    let args = browser_args(port, user_data_dir, headed, url);

    info!(port, browser = %binary, "Launching browser");

    let process = Command::new(&binary)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    netwatch_engine::wait_for_browser(port, 15).await?;

    Ok(LaunchedBrowser { port, process })
}

fn browser_args(port: u16, user_data_dir: &Path, headed: bool, url: &str) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push(url.to_string());
    args
}

/// Find a Chromium-family binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "microsoft-edge",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') {
            if which::which(candidate).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

/// Find a free TCP port.
async fn find_free_port() -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_args_headless_by_default() {
        let args = browser_args(9222, Path::new("/tmp/profile"), false, "about:blank");
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));

        let args = browser_args(9222, Path::new("/tmp/profile"), true, "about:blank");
        assert!(!args.contains(&"--headless=new".to_string()));
    }
}
