//! `faststore-server`: the daemon entry point wiring one [`Engine`] over
//! every core crate (spec.md §9 "reify as an explicit Engine context").
//! Corresponds to `forest-daemon`'s `main.rs` in the teacher, minus the
//! network/cluster-membership layer spec.md §1 places out of scope.

mod engine;

use clap::Parser;
use engine::Engine;
use faststore_common::config::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "faststore-server", about = "FastStore core storage engine")]
struct Cli {
    /// Path to the TOML configuration file (spec.md §6 config keys).
    #[arg(long, default_value = "faststore.toml")]
    config: PathBuf,

    /// Data directory: trunks, binlog, and recovery state live under it
    /// (spec.md §6 "Persisted layout").
    #[arg(long)]
    data_path: PathBuf,

    /// Number of cluster servers, sizing the topology notifier's
    /// per-peer event tables (spec.md §4.H). Cluster membership itself
    /// is part of the out-of-scope network framework, so this is taken
    /// as a fixed size rather than discovered.
    #[arg(long, default_value_t = 1)]
    server_count: usize,
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        log::warn!(
            "config file {:?} not found, starting with defaults",
            cli.config
        );
        Config::default()
    };

    std::fs::create_dir_all(&cli.data_path)?;
    let engine = Engine::new(config, cli.data_path.clone(), cli.server_count);

    log::info!(
        "faststore-server ready: data_path={:?}, data_groups={}",
        cli.data_path,
        engine.config.data_group_count
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, draining");
    engine.shutdown();
    Ok(())
}
