//! Signal handling and orderly stop for a node process

use std::sync::Arc;

use tracing::{info, warn};

use rill_core::{ClusterConfig, ClusterRuntime, HaltReason};

/// Resolves on Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping node"),
        _ = terminate => info!("Received SIGTERM, stopping node"),
    }
}

/// Run until a signal arrives or the cluster halts this node, then stop it.
///
/// Returns why the node stopped.
pub async fn run_until_stopped(runtime: &Arc<ClusterRuntime>) -> HaltReason {
    run_until(runtime, wait_for_shutdown_signal()).await
}

pub async fn run_until(
    runtime: &Arc<ClusterRuntime>,
    signal: impl std::future::Future<Output = ()>,
) -> HaltReason {
    tokio::select! {
        _ = signal => {}
        reason = runtime.wait_halted() => {
            info!(reason = %reason, "Node halted");
        }
    }
    // First halt wins, so a signal after a kill keeps the kill's reason
    runtime.shutdown().await;
    let reason = runtime.wait_halted().await;
    info!(reason = %reason, exit_code = reason.exit_code(), "Node stopped");
    reason
}

/// One line describing the node about to start
pub fn describe(config: &ClusterConfig) -> String {
    format!(
        "{} {} in cluster '{}' with {} candidate peers",
        if config.client { "client" } else { "member" },
        config.address,
        config.cluster_name,
        config.flatfile.len()
    )
}
