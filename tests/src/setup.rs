//! Common test setup: a single-node broker bound to an ephemeral port,
//! with timings tightened so elections and rebalances finish quickly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use broker_core::BrokerConfig;
use server::BrokerServer;

pub struct TestBroker {
    pub broker: BrokerServer,
    pub addr: SocketAddr,
    /// Kept alive for the broker's lifetime; dropping removes the data.
    pub data_dir: Option<TempDir>,
    data_path: PathBuf,
}

pub fn test_config(data_dir: PathBuf) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.broker_id = 1;
    config.data_dir = data_dir;
    config.listeners = vec!["127.0.0.1:0".to_string()];
    config.advertised_listeners = None;
    config.bootstrap = true;
    config.raft.heartbeat_ms = 50;
    config.raft.election_ms = 100;
    config.raft.commit_timeout_ms = 5_000;
    config.replication.isr_check_interval_ms = 200;
    config.group.offsets_topic_partitions = 4;
    config.group.initial_rebalance_delay_ms = 200;
    config.storage.maintenance_interval_ms = 500;
    config
}

impl TestBroker {
    /// Starts a fresh single-node broker and waits for the controller.
    pub async fn start() -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let data_path = data_dir.path().to_path_buf();
        let broker = Self::boot(data_path.clone()).await;
        Self {
            addr: broker.local_addrs()[0],
            broker,
            data_dir: Some(data_dir),
            data_path,
        }
    }

    async fn boot(data_path: PathBuf) -> BrokerServer {
        let broker = BrokerServer::start(test_config(data_path))
            .await
            .expect("broker start");
        // Wait for the single-node controller election.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while broker.context().cluster.controller_id().is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "controller never elected"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        broker
    }

    /// The advertised address of this broker's client listener.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Stops the broker and boots a new one over the same data directory.
    pub async fn restart(mut self) -> Self {
        self.broker.shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let broker = Self::boot(self.data_path.clone()).await;
        Self {
            addr: broker.local_addrs()[0],
            broker,
            data_dir: self.data_dir.take(),
            data_path: self.data_path,
        }
    }

    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
    }
}

/// Reserves an ephemeral port by binding and dropping a listener.
async fn reserve_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("reserve port");
    listener.local_addr().expect("local addr").port()
}

/// A three-ish-node in-process cluster for failover scenarios.
pub struct TestCluster {
    brokers: Vec<Option<BrokerServer>>,
    kafka_addrs: Vec<String>,
    _data_dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Starts `n` brokers (ids 1..=n) sharing one consensus group and
    /// waits until they agree on a controller and all have registered.
    pub async fn start(n: usize) -> Self {
        let mut kafka_ports = Vec::new();
        let mut raft_ports = Vec::new();
        for _ in 0..n {
            kafka_ports.push(reserve_port().await);
            raft_ports.push(reserve_port().await);
        }
        let peers: Vec<String> = (0..n)
            .map(|i| format!("{}@127.0.0.1:{}", i + 1, raft_ports[i]))
            .collect();

        let mut brokers = Vec::new();
        let mut kafka_addrs = Vec::new();
        let mut data_dirs = Vec::new();
        for i in 0..n {
            let data_dir = TempDir::new().expect("tempdir");
            let mut config = test_config(data_dir.path().to_path_buf());
            config.broker_id = (i + 1) as i32;
            config.listeners = vec![format!("127.0.0.1:{}", kafka_ports[i])];
            config.cluster_peers = peers.clone();
            let broker = BrokerServer::start(config).await.expect("broker start");
            kafka_addrs.push(format!("127.0.0.1:{}", kafka_ports[i]));
            brokers.push(Some(broker));
            data_dirs.push(data_dir);
        }

        let cluster = Self {
            brokers,
            kafka_addrs,
            _data_dirs: data_dirs,
        };
        cluster.wait_for_quorum(n).await;
        cluster
    }

    async fn wait_for_quorum(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let ready = self.brokers.iter().flatten().all(|b| {
                let ctx = b.context();
                ctx.cluster.controller_id().is_some()
                    && ctx.cluster.read(|state| state.brokers.len()) == n
            });
            if ready {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster never reached quorum"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Kafka address of broker `id` (1-based).
    pub fn addr(&self, id: i32) -> String {
        self.kafka_addrs[(id - 1) as usize].clone()
    }

    /// Live broker context for white-box assertions.
    pub fn context(&self, id: i32) -> &std::sync::Arc<server::BrokerContext> {
        self.brokers[(id - 1) as usize]
            .as_ref()
            .expect("broker is dead")
            .context()
    }

    pub fn live_broker_ids(&self) -> Vec<i32> {
        self.brokers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_some())
            .map(|(i, _)| (i + 1) as i32)
            .collect()
    }

    /// Stops a broker, simulating a crash as far as its peers can tell.
    pub async fn kill(&mut self, id: i32) {
        if let Some(broker) = self.brokers[(id - 1) as usize].take() {
            broker.shutdown().await;
        }
    }
}
