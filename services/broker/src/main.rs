// Broker service main entry point.
use anyhow::{Context, Result};
use socketbox_broker::Broker;
use socketbox_cluster::{ClusterManager, NoRpcHandlers};
use socketbox_server::config::ServerConfig;
use socketbox_server::{observability, server};
use socketbox_storage::{CacheProvider, EphemeralCache};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = ServerConfig::from_env_or_yaml().context("load configuration")?;

    let broker = Arc::new(Broker::new(config.broker.clone()).context("configure broker")?);
    tracing::info!("broker configured");

    // The binary runs with the in-memory cache; deployments that need a
    // shared cache embed the library crates and plug in their own provider.
    let cluster = if broker.cluster_enabled() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        let manager = ClusterManager::new(Arc::clone(&broker), cache, Arc::new(NoRpcHandlers))
            .context("start cluster manager")?;
        broker.set_peer_fanout(Arc::clone(&manager) as Arc<dyn socketbox_broker::PeerFanout>);
        manager.start();
        tracing::info!(name = %manager.self_name(), "clustering enabled");
        Some(manager)
    } else {
        None
    };

    let listener = TcpListener::bind(config.listen_bind)
        .await
        .context("bind stomp listener")?;
    tracing::info!(addr = %listener.local_addr()?, "stomp listener started");

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = Arc::new(server::ServerState {
        broker,
        cluster: cluster.clone(),
    });
    let accept_task = tokio::spawn(async move {
        if let Err(err) = server::serve(listener, state).await {
            tracing::warn!(error = %err, "accept loop exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    if let Some(cluster) = cluster {
        cluster.shutdown().await;
    }
    accept_task.abort();
    metrics_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}
