use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use treewatch::config::Settings;
use treewatch::watcher::DirectoryWatcher;

#[derive(Parser)]
#[command(name = "treewatch")]
#[command(about = "Watch directory trees and print every change")]
#[command(version)]
struct Cli {
    /// Path to a settings file (defaults to .treewatch/settings.toml)
    #[arg(long, global = true, env = "TREEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration
    Config,

    /// Watch directories recursively until interrupted
    Watch {
        /// Directories to watch
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Descend into symlinked directories (overrides config)
        #[arg(long)]
        follow_links: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        Settings::default()
    });

    treewatch::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { force } => {
            let cwd = std::env::current_dir().context("cannot determine current directory")?;
            let path = Settings::init_config_file(&cwd, force)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            Ok(())
        }

        Commands::Config => {
            println!("Current Configuration:");
            println!("{}", "=".repeat(50));
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }

        Commands::Watch {
            paths,
            follow_links,
        } => {
            if follow_links {
                settings.watcher.follow_links = true;
            }
            run_watch(&settings, paths).await
        }
    }
}

async fn run_watch(settings: &Settings, paths: Vec<PathBuf>) -> Result<()> {
    let watcher = DirectoryWatcher::spawn(&settings.watcher)?;

    let mut keys = watcher.signalled_keys();
    let mut errors = watcher.errors();

    for path in &paths {
        watcher
            .watch(path)
            .await
            .with_context(|| format!("cannot watch {}", path.display()))?;
        treewatch::log_event!("cli", "watching", "{}", path.display());
    }
    eprintln!("Watching {} root(s). Press Ctrl-C to stop.", paths.len());

    loop {
        tokio::select! {
            key = keys.recv() => match key {
                Some(key) => {
                    for event in key.poll_events() {
                        println!("{:<8} {}", event.kind(), event.path().display());
                    }
                    key.reset();
                }
                None => break,
            },
            error = errors.recv() => match error {
                Ok(error) => eprintln!("error: {error}"),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("[cli] missed {n} errors");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        if watcher.is_shutdown() {
            break;
        }
    }

    // Shutdown blocks until the worker has released its watches.
    tokio::task::block_in_place(|| watcher.shutdown());
    Ok(())
}
