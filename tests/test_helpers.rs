//! Test helper functions for registry/peer integration tests
//!
//! Spins up a registry plus a configurable number of storage peer daemons on
//! loopback, with timing tightened so eviction and sweeps happen within test
//! timeouts.

use peervault::peer_node::{self, ChunkStore};
use peervault::protocol::{self, Message};
use peervault::registry::{RegistryHandle, RegistryNode};
use peervault::{PeerId, PeerNodeConfig, RegistryConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub fn fast_registry_config(root: &Path) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.listen_address = "127.0.0.1:0".to_string();
    config.data_dir = root.join("registry");
    config.downloads_dir = root.join("downloads");
    config.monitor_period = Duration::from_millis(100);
    config.staleness_threshold = Duration::from_millis(600);
    config.zombie_sweep_interval = Duration::from_millis(200);
    config.transfer_timeout = Duration::from_secs(5);
    config
}

pub fn fast_peer_config(root: &Path, instance: u32, registry_addr: SocketAddr) -> PeerNodeConfig {
    let mut config = PeerNodeConfig::default();
    config.registry_address = registry_addr.to_string();
    config.data_dir = root.join("peers");
    config.instance = instance;
    config.hostname = Some(format!("test-peer-{}", instance));
    config.capacity_mb = 100;
    config.heartbeat_interval = Duration::from_millis(100);
    config.reconnect_interval = Duration::from_millis(100);
    config.transfer_listen_address = "127.0.0.1:0".to_string();
    config
}

/// A registry plus managed peer daemons, all on loopback.
pub struct TestCluster {
    pub registry: RegistryNode,
    pub handle: RegistryHandle,
    pub temp_dir: TempDir,
    peers: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Start a registry and `peer_count` peers, approving each as it shows up.
    pub async fn start(peer_count: u32) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let registry = RegistryNode::start(fast_registry_config(temp_dir.path()))
            .await
            .unwrap();
        let handle = registry.handle();
        let mut cluster = TestCluster {
            registry,
            handle,
            temp_dir,
            peers: Vec::new(),
        };
        for instance in 0..peer_count {
            cluster.spawn_peer(instance).await;
        }
        if peer_count > 0 {
            cluster.approve_pending(peer_count as usize).await;
            cluster.wait_for_connected(peer_count as usize).await;
        }
        cluster
    }

    /// Launch a peer daemon instance as a background task.
    pub async fn spawn_peer(&mut self, instance: u32) {
        let config = fast_peer_config(self.temp_dir.path(), instance, self.registry.local_addr());
        self.peers.push(tokio::spawn(async move {
            let _ = peer_node::run(config).await;
        }));
    }

    /// Wait for `expected` pending peers, then approve them all.
    pub async fn approve_pending(&self, expected: usize) {
        let handle = self.handle.clone();
        wait_for("peers to request identities", || {
            let handle = handle.clone();
            async move { handle.list_pending().await.unwrap().len() >= expected }
        })
        .await;
        for record in self.handle.list_pending().await.unwrap() {
            self.handle.approve(record.id).await.unwrap();
        }
    }

    /// Wait until `expected` peers are connected with advertised transfer ports.
    pub async fn wait_for_connected(&self, expected: usize) {
        let handle = self.handle.clone();
        wait_for("peers to connect and heartbeat", || {
            let handle = handle.clone();
            async move {
                let connected = handle.list_connected().await.unwrap();
                connected.len() == expected && connected.iter().all(|r| r.transfer_port.is_some())
            }
        })
        .await;
    }

    /// Abort a peer task, simulating a crash: both its transfer listener and
    /// its control session drop at once.
    pub fn kill_peer(&mut self, index: usize) {
        self.peers[index].abort();
    }

    /// Chunk storage directory of a managed peer instance.
    pub fn peer_chunk_dir(&self, instance: u32) -> PathBuf {
        self.temp_dir
            .path()
            .join("peers")
            .join(format!("instance-{}", instance))
            .join("chunks")
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.temp_dir.path().join("registry").join("fallback")
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for peer in &self.peers {
            peer.abort();
        }
    }
}

/// A peer whose control session is driven by the test instead of the daemon:
/// its transfer listener stays alive even after heartbeats stop, so eviction
/// and chunk pull-back can be exercised independently.
pub struct ManualPeer {
    pub id: PeerId,
    pub transfer_addr: SocketAddr,
    stop_tx: tokio::sync::watch::Sender<bool>,
    control: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl ManualPeer {
    /// Stop sending heartbeats while keeping the control connection and the
    /// transfer listener open. The registry will evict for staleness.
    pub fn stop_heartbeats(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for ManualPeer {
    fn drop(&mut self) {
        self.control.abort();
        self.server.abort();
    }
}

/// Register, approve, and heartbeat a hand-driven peer.
pub async fn spawn_manual_peer(
    registry_addr: SocketAddr,
    handle: &RegistryHandle,
    storage_dir: PathBuf,
) -> ManualPeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_addr = listener.local_addr().unwrap();
    let store = Arc::new(ChunkStore::new(storage_dir, 100 * 1_000_000));
    let server = tokio::spawn(async move {
        let _ = peer_node::serve_transfers(listener, store).await;
    });

    let mut stream = TcpStream::connect(registry_addr).await.unwrap();
    protocol::write_message(
        &mut stream,
        &Message::RequestIdentity {
            capacity_mb: 100,
            hostname: "manual-peer".to_string(),
        },
    )
    .await
    .unwrap();
    let id = match protocol::read_message(&mut stream).await.unwrap().unwrap() {
        Message::IdentityIssued { id } => id,
        other => panic!("unexpected identity reply: {:?}", other),
    };
    handle.approve(id).await.unwrap();

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let transfer_port = transfer_addr.port();
    let control = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    protocol::write_message(
                        &mut stream,
                        &Message::Heartbeat {
                            id,
                            timestamp_ms: 0,
                            transfer_port,
                            capacity_mb: 100,
                            hostname: "manual-peer".to_string(),
                        },
                    )
                    .await
                    .unwrap();
                    match protocol::read_message(&mut stream).await {
                        Ok(Some(Message::HeartbeatAck { .. })) => {}
                        _ => break,
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
        // Keep the control connection open without heartbeating.
        std::future::pending::<()>().await;
    });

    ManualPeer {
        id,
        transfer_addr,
        stop_tx,
        control,
        server,
    }
}

/// Create a test file with specified content
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Number of entries in a directory, zero if it does not exist yet.
pub fn dir_entry_count(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
