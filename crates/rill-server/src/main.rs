//! Main entry point for a Rill cluster node.
//!
//! Loads configuration, binds the UDP/TCP transport and runs the node until
//! a signal arrives or the cluster tells it to stop.

use std::sync::Arc;

use tracing::info;

use rill_core::{ClusterConfig, FilePersist, NetTransport, RuntimeBuilder};
use rill_server::{
    model,
    startup::{self, LoggingConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = model::load_configuration()?;

    let logging_config = LoggingConfig::from_env();
    let logging_guard = startup::init_logging(&logging_config)?;
    rill_server::metrics::init_metrics();

    let cluster_config = ClusterConfig::from_configuration(&configuration)?;
    info!("Starting {}", startup::describe(&cluster_config));

    let (transport, inbound) = NetTransport::bind(cluster_config.address).await?;
    let mut builder = RuntimeBuilder::new(cluster_config);
    if let Some(dir) = configuration.persist_dir() {
        info!(dir = %dir, "File persistence enabled");
        builder = builder.persist(Arc::new(FilePersist::new(&dir)?));
    }
    let runtime = builder.start(transport, inbound).await?;

    let reason = startup::run_until_stopped(&runtime).await;
    let code = reason.exit_code();

    // Flush file appenders before exiting with the halt's code
    drop(logging_guard);
    std::process::exit(code);
}
