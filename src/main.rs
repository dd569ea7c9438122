use std::path::PathBuf;
use std::sync::Arc;

use beaver_indexer::app::App;
use beaver_indexer::config::load_config;
use beaver_indexer::scheduler::Scheduler;
use beaver_indexer::shutdown::Shutdown;
use beaver_indexer::server;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Per-chain subscription indexer and recurring payment initiator.
#[derive(Debug, Clone, Parser)]
#[clap(rename_all = "kebab-case")]
struct Args {
    /// Path to a TOML configuration file. Settings are overlaid with
    /// `SEQ__`-prefixed environment variables regardless of this flag.
    #[clap(long, env)]
    config: Option<PathBuf>,

    /// Emit structured JSON logs instead of the default human-readable format.
    #[clap(long, env)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .from_env_lossy()
        .add_directive(LevelFilter::INFO.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_deref())?;
    let scanner_config = config.scanner.clone();
    let server_config = config.server.clone();
    let chain_configs = config.chains.clone();

    let shutdown = Arc::new(Shutdown::new(
        scanner_config.shutdown_timeout,
        scanner_config.shutdown_delay,
    ));
    shutdown.watch_signals();

    let app = Arc::new(App::new(config, shutdown.clone()).await?);

    let server_task = tokio::spawn(server::run(app.clone(), server_config, shutdown.clone()));

    // One scheduler task per chain (§5, §10.4): a stalled RPC endpoint on one
    // chain must not starve another chain's scanning or payments.
    let mut scheduler_tasks = Vec::with_capacity(chain_configs.len());
    for chain_config in chain_configs {
        let Some(handle) = app.chain(&chain_config.name) else {
            continue;
        };
        let scheduler = Scheduler::new(
            chain_config,
            handle.clone(),
            app.pool.clone(),
            app.metadata.clone(),
            app.price_oracle.clone(),
            scanner_config.clone(),
            shutdown.clone(),
        );
        scheduler_tasks.push(tokio::spawn(async move { scheduler.run().await }));
    }

    tokio::select! {
        result = server_task => result??,
        _ = futures::future::join_all(scheduler_tasks) => {}
    }

    Ok(())
}

