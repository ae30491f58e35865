mod commands;
mod launch;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "netwatch")]
#[command(about = "Observe, filter, and cache a browser view's network traffic", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List debuggable page targets
    Targets {
        /// Remote debugging port
        #[arg(short, long, default_value_t = 9222)]
        port: u16,
    },

    /// Attach to a page target and stream observer events as JSON lines
    Watch {
        /// Remote debugging port of a running browser
        #[arg(short, long, default_value_t = 9222)]
        port: u16,

        /// Attach to a specific target id (default: first page)
        #[arg(short, long)]
        target: Option<String>,

        /// Plugin manifest to load rules from
        #[arg(short, long)]
        manifest: Option<String>,

        /// Registered plugin to load rules from
        #[arg(long)]
        plugin: Option<String>,

        /// Launch a browser instead of attaching to a running one
        #[arg(long)]
        launch: bool,

        /// Show the launched browser window
        #[arg(long)]
        headed: bool,

        /// Page to open (defaults to the manifest's gamePage)
        #[arg(long)]
        url: Option<String>,
    },

    /// Manage registered plugins
    Plugins {
        #[command(subcommand)]
        command: PluginsCommands,
    },

    /// Manage per-plugin response caches
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum PluginsCommands {
    /// Register a plugin by its plugin.json path
    Add {
        /// Path to plugin.json
        manifest: String,
    },
    /// Unregister a plugin
    Remove {
        /// Plugin name
        name: String,
    },
    /// List registered plugins
    List,
    /// Re-read a registered plugin's manifest from disk
    Reload {
        /// Plugin name
        name: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show entry count and size for a plugin's cache
    Info {
        /// Plugin name
        name: String,
    },
    /// Delete every cached entry for a plugin
    Purge {
        /// Plugin name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; logs go to stderr so event output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Targets { port } => {
            commands::targets::run(port).await?;
        }
        Commands::Watch {
            port,
            target,
            manifest,
            plugin,
            launch,
            headed,
            url,
        } => {
            commands::watch::run(commands::watch::WatchArgs {
                port,
                target_id: target,
                manifest,
                plugin,
                launch,
                headed,
                url,
            })
            .await?;
        }
        Commands::Plugins { command } => match command {
            PluginsCommands::Add { manifest } => {
                commands::plugins::add(&manifest).await?;
            }
            PluginsCommands::Remove { name } => {
                commands::plugins::remove(&name).await?;
            }
            PluginsCommands::List => {
                commands::plugins::list().await?;
            }
            PluginsCommands::Reload { name } => {
                commands::plugins::reload(&name).await?;
            }
        },
        Commands::Cache { command } => match command {
            CacheCommands::Info { name } => {
                commands::cache_cmd::info(&name).await?;
            }
            CacheCommands::Purge { name } => {
                commands::cache_cmd::purge(&name).await?;
            }
        },
    }

    Ok(())
}
