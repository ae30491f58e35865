use std::path::PathBuf;

use netwatch_core::{Config, Paths};
use netwatch_engine::CacheStore;

fn store_for(paths: &Paths, name: &str) -> CacheStore {
    let config = Config::load_or_default(paths);
    let dir = config
        .plugin(name)
        .and_then(|p| p.cache_path.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.plugin_cache_dir(name));
    CacheStore::new(dir)
}

pub async fn info(name: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let store = store_for(&paths, name);
    let stats = store.stats()?;

    println!("Cache dir: {}", store.dir().display());
    println!("Entries:   {}", stats.entries);
    println!("Body size: {} bytes", stats.body_bytes);
    Ok(())
}

pub async fn purge(name: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let store = store_for(&paths, name);
    store.purge()?;

    println!("Purged cache for '{}'.", name);
    Ok(())
}
