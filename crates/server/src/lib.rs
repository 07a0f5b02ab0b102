//! The broker server: TCP listeners, per-connection tasks, request
//! dispatch, and the handlers for every supported API.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use broker_core::BrokerConfig;
use cluster::{Cluster, ClusterHandle, ReplicationManager};
use coordinator::{GroupCoordinator, TransactionCoordinator};
use storage::TopicManager;

pub use error::{Result, ServerError};

/// Everything a request handler can touch.
pub struct BrokerContext {
    pub config: Arc<BrokerConfig>,
    pub topics: Arc<TopicManager>,
    pub cluster: ClusterHandle,
    pub replication: Arc<ReplicationManager>,
    pub groups: Arc<GroupCoordinator>,
    pub txns: Arc<TransactionCoordinator>,
    pub shutdown: CancellationToken,
    pub connections: AtomicUsize,
}

/// A running broker.
pub struct BrokerServer {
    ctx: Arc<BrokerContext>,
    local_addrs: Vec<std::net::SocketAddr>,
}

impl BrokerServer {
    /// Wires storage, consensus, coordination, and the listeners; returns
    /// once the broker is serving.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let config = Arc::new(config);

        // Storage first: a broker that cannot recover its logs must not
        // accept traffic.
        let topics = Arc::new(TopicManager::new(
            &config.data_dir,
            Arc::new(config.storage.clone()),
        ));
        let recovered = topics.recover_all().await.map_err(ServerError::Storage)?;
        telemetry::health().storage.set_healthy();
        telemetry::metrics().partitions_hosted.set(recovered as u64);
        info!(partitions = recovered, "Storage recovered");

        let cluster = Cluster::start(&config, topics.clone())
            .await
            .map_err(ServerError::Cluster)?;
        let replication =
            ReplicationManager::new(cluster.clone(), topics.clone(), config.replication.clone());
        replication.start();

        let groups = GroupCoordinator::new(
            config.group.clone(),
            cluster.clone(),
            replication.clone(),
            topics.clone(),
            &config.data_dir,
        );
        groups.load_snapshot().await;
        groups.start();
        let txns = TransactionCoordinator::new(
            config.transaction.clone(),
            config.group.offsets_topic_partitions,
            cluster.clone(),
            replication.clone(),
            topics.clone(),
        );
        txns.start();

        let ctx = Arc::new(BrokerContext {
            config: config.clone(),
            topics,
            cluster,
            replication,
            groups,
            txns,
            shutdown: CancellationToken::new(),
            connections: AtomicUsize::new(0),
        });

        // The controller creates the internal offsets topic on first boot;
        // every other broker just waits to see it in the metadata.
        let bootstrap = ctx.clone();
        tokio::spawn(async move {
            loop {
                if bootstrap.shutdown.is_cancelled() {
                    break;
                }
                let exists = bootstrap.cluster.read(|state| {
                    state.topic(broker_core::CONSUMER_OFFSETS_TOPIC).is_some()
                });
                if exists {
                    break;
                }
                if bootstrap.cluster.is_controller() {
                    match bootstrap.groups.ensure_offsets_topic().await {
                        Ok(()) => break,
                        Err(err) => {
                            warn!(error = %err, "Offsets topic bootstrap retry");
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });

        let mut local_addrs = Vec::new();
        for listen in &config.listeners {
            let listener = TcpListener::bind(listen)
                .await
                .map_err(ServerError::Bind)?;
            let local = listener.local_addr().map_err(ServerError::Bind)?;
            info!(addr = %local, "Listening for Kafka clients");
            local_addrs.push(local);
            tokio::spawn(accept_loop(listener, ctx.clone()));
        }
        telemetry::health().network.set_healthy();

        Ok(Self { ctx, local_addrs })
    }

    /// Addresses actually bound (useful when a listener used port 0).
    pub fn local_addrs(&self) -> &[std::net::SocketAddr] {
        &self.local_addrs
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    /// Graceful shutdown: stop accepting, cancel parked handlers, drain
    /// partitions, snapshot state.
    pub async fn shutdown(&self) {
        info!("Broker shutting down");
        self.ctx.shutdown.cancel();
        self.ctx.cluster.shutdown().await;
        self.ctx.replication.shutdown();
        self.ctx.groups.persist_snapshot().await;
        self.ctx.topics.close_all().await;
        info!("Broker shutdown complete");
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<BrokerContext>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Accept failed");
                        continue;
                    }
                };
                let active = ctx.connections.load(Ordering::Relaxed);
                if active >= ctx.config.network.max_connections {
                    warn!(peer = %peer, active, "Connection limit reached, rejecting");
                    drop(stream);
                    continue;
                }
                ctx.connections.fetch_add(1, Ordering::Relaxed);
                telemetry::metrics().active_connections.inc();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    connection::run_connection(ctx.clone(), stream, peer).await;
                    ctx.connections.fetch_sub(1, Ordering::Relaxed);
                    telemetry::metrics().active_connections.dec();
                });
            }
        }
    }
}
