use std::path::Path;

use netwatch_core::{Config, Paths, PluginManifest};
use netwatch_engine::{target, NetworkWatcher};
use tokio::sync::mpsc;
use tracing::info;

pub struct WatchArgs {
    pub port: u16,
    pub target_id: Option<String>,
    pub manifest: Option<String>,
    pub plugin: Option<String>,
    pub launch: bool,
    pub headed: bool,
    pub url: Option<String>,
}

pub async fn run(args: WatchArgs) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let manifest = resolve_manifest(&paths, args.manifest.as_deref(), args.plugin.as_deref())?;

    // An explicit --url beats the manifest's page
    let page_url = args
        .url
        .clone()
        .or_else(|| manifest.as_ref().and_then(|m| m.game_page.clone()));

    let mut launched = None;
    let port = if args.launch {
        let page = page_url.as_deref().unwrap_or("about:blank");
        let user_data_dir = paths.base.join("browser");
        let browser = crate::launch::launch(page, &user_data_dir, args.headed).await?;
        let port = browser.port;
        launched = Some(browser);
        port
    } else {
        args.port
    };

    let page_target = match args.target_id.as_deref() {
        Some(id) => target::target_by_id(port, id).await?,
        None => target::page_target(port).await?,
    };

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let watcher = NetworkWatcher::new(events_tx);
    if let Some(manifest) = manifest.as_ref() {
        watcher.configure(manifest, &paths).await;
        info!(plugin = %manifest.name, "Applied plugin rules");
    }

    watcher.attach(&page_target).await?;
    if !watcher.is_attached().await {
        anyhow::bail!("Could not attach to target {}", page_target.id);
    }

    eprintln!("Watching {} ({}). Ctrl-C to stop.", page_target.url, page_target.id);
    loop {
        tokio::select! {
            maybe = events_rx.recv() => match maybe {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.detach().await;
    if let Some(mut browser) = launched {
        browser.close().await;
    }
    Ok(())
}

fn resolve_manifest(
    paths: &Paths,
    manifest: Option<&str>,
    plugin: Option<&str>,
) -> anyhow::Result<Option<PluginManifest>> {
    if let Some(path) = manifest {
        return Ok(Some(PluginManifest::load(Path::new(path))?));
    }
    if let Some(name) = plugin {
        let config = Config::load_or_default(paths);
        let manifest = config
            .plugin(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Plugin '{}' is not registered", name))?;
        return Ok(Some(manifest));
    }
    Ok(None)
}
