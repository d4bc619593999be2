//! GenLoop Node - Main Entry Point
//!
//! Loads configuration, resolves the tokenizer and engine seams once, and
//! hands control to the node loop until a shutdown signal arrives.

use anyhow::Context;
use genloop_common::NodeConfig;
use genloop_node::conn::TcpConnector;
use genloop_node::engine::LocalEngine;
use genloop_node::tokenizer::HfTokenizer;
use genloop_node::{watchdog, Node};
use genloop_proto::ConnectParams;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hidden width of the reference engine.
const ENGINE_HIDDEN_DIM: usize = 64;

/// Seed for the reference engine's deterministic tables.
const ENGINE_SEED: u64 = 0x6e6f_6465;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genloop_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting GenLoop node");

    // Load configuration
    let config_path =
        std::env::var("GENLOOP_CONFIG").unwrap_or_else(|_| "configs/node.yaml".to_string());
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    info!(
        dispatcher = %config.dispatcher_addr,
        node = %config.node_name,
        model = %config.advertised_model(),
        max_concurrency = config.max_concurrency,
        "configuration loaded"
    );

    // Resolve the tokenizer seam once, outside the core.
    let tokenizer = HfTokenizer::from_file(&config.tokenizer_path, &config.eos_token)
        .context("loading tokenizer")?;
    let vocab_size = tokenizer.vocab_size();
    info!(vocab_size, "tokenizer loaded");

    let engine = LocalEngine::new(vocab_size, ENGINE_HIDDEN_DIM, ENGINE_SEED)
        .context("building step engine")?;

    let params = ConnectParams {
        name: config.node_name.clone(),
        model: config.advertised_model(),
        token: config.auth_token.clone(),
        max_concurrency: config.max_concurrency,
    };
    let connector = TcpConnector::new(config.dispatcher_addr.clone(), params);

    let _watchdog = watchdog::spawn(config.watchdog_interval());

    let mut node = Node::new(config, Box::new(tokenizer), engine, connector);
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = node.run() => {
            result?;
        }
    }

    info!("GenLoop node shutdown complete");
    Ok(())
}
