use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use veil::config::Config;
use veil::proxy::{Dispatcher, RelayClient};
use veil::rules::load_rule_table;
use veil::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Help and usage errors alike exit non-zero.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!(
        target_socket = %cfg.target_socket.display(),
        routing = ?cfg.routing,
        "Launching Unix Socket HTTP Server"
    );

    let rules = load_rule_table(&cfg.rules_file);
    let relay = RelayClient::new(&cfg.target_socket, cfg.relay_timeout);
    let dispatcher = Arc::new(Dispatcher::new(rules, cfg.routing, relay));

    let listener = server::listener::bind(&cfg.exposed_socket)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server::listener::serve_until(listener, &cfg.exposed_socket, dispatcher, shutdown).await
}
