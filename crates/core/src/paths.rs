use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".netwatch"))
            .unwrap_or_else(|| PathBuf::from(".netwatch"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.base.join("cache")
    }

    /// Cache directory for one plugin context. The plugin name is the
    /// directory name, with path-hostile characters replaced.
    pub fn plugin_cache_dir(&self, plugin_name: &str) -> PathBuf {
        let safe_name = plugin_name.replace([':', '/', '\\'], "_");
        self.cache_root().join(safe_name)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.cache_root())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
