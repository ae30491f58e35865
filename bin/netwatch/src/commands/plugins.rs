use std::path::Path;

use netwatch_core::{Config, Paths, PluginManifest};

pub async fn add(manifest_path: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths);

    let manifest = PluginManifest::load(Path::new(manifest_path))?;
    let name = manifest.name.clone();
    config.add_plugin(manifest)?;
    config.save(&paths.config_file())?;

    println!("Registered plugin '{}'.", name);
    Ok(())
}

pub async fn remove(name: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths);

    if !config.remove_plugin(name) {
        anyhow::bail!("Plugin '{}' is not registered", name);
    }
    config.save(&paths.config_file())?;

    println!("Removed plugin '{}'.", name);
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths);

    if config.plugins.is_empty() {
        println!("No plugins registered. Use `netwatch plugins add <plugin.json>`.");
        return Ok(());
    }

    for plugin in &config.plugins {
        println!(
            "{}  {}  {}",
            plugin.name,
            plugin.game_page.as_deref().unwrap_or("-"),
            plugin.json_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn reload(name: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths);

    config.reload_plugin(name)?;
    config.save(&paths.config_file())?;

    println!("Reloaded plugin '{}'.", name);
    Ok(())
}
