//! `alice-server`: the data-store binary. Loads configuration, restores
//! durable state (RDB snapshot, then AOF replay), and runs the event loop
//! from `server.rs` until SIGINT (§6 CLI surface).

use alice::config::Config;
use alice::engine::Engine;
use anyhow::{Context, Result};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, cli_overrides) = match raw_args.split_first() {
        Some((first, rest)) if !first.starts_with("--") => (Some(PathBuf::from(first)), rest.to_vec()),
        _ => (None, raw_args.clone()),
    };

    let config = Config::load(config_path.as_deref(), &cli_overrides).context("loading configuration")?;
    let mut engine = Engine::new(config);

    engine.load_snapshot_if_present().context("loading RDB snapshot")?;
    engine.replay_aof_if_present().context("replaying append log")?;

    alice::server::run(engine).await.context("server loop exited")?;
    Ok(())
}
