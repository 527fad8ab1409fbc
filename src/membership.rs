//! Membership Module
//!
//! Tracks every peer id the registry has seen: transient Pending and
//! Connected records, plus the durable approved set that survives restarts.
//! Runs as a command-channel actor; a health monitor tick evicts peers whose
//! heartbeats have gone stale and purges Pending entries nobody is retrying.

use crate::config::MEGABYTE;
use crate::protocol::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors that can occur in membership operations
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("unknown peer: {id}")]
    UnknownPeer { id: PeerId },

    #[error("peer {id} is not awaiting approval")]
    NotPending { id: PeerId },

    #[error("peer {id} has not been approved")]
    PendingApproval { id: PeerId },

    #[error("membership service unavailable")]
    ServiceUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Timing knobs for the health monitor.
#[derive(Debug, Clone, Copy)]
pub struct MembershipConfig {
    /// How often the monitor scans for stale peers
    pub monitor_period: Duration,
    /// Age past which a last-seen timestamp marks a peer stale
    pub staleness_threshold: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            monitor_period: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(15),
        }
    }
}

/// What the registry knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub hostname: String,
    /// IP the control session arrived from
    pub control_ip: IpAddr,
    /// Advertised transfer port; absent until the first accepted heartbeat
    pub transfer_port: Option<u16>,
    pub capacity_bytes: u64,
    pub first_seen: SystemTime,
    /// Last contact on a monotonic clock, for staleness math
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Endpoint for chunk transfers, once the peer has advertised its port.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.transfer_port
            .map(|port| SocketAddr::new(self.control_ip, port))
    }
}

/// Membership changes the recovery service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    PeerConnected {
        id: PeerId,
    },
    /// A connected peer left; carries its last advertised transfer endpoint
    /// so recovery can still attempt best-effort downloads from it.
    PeerLost {
        id: PeerId,
        transfer_addr: Option<SocketAddr>,
    },
}

#[derive(Debug)]
enum MembershipCommand {
    RequestIdentity {
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
        response: oneshot::Sender<PeerId>,
    },
    ValidateIdentity {
        id: PeerId,
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
        response: oneshot::Sender<bool>,
    },
    Heartbeat {
        id: PeerId,
        transfer_port: u16,
        capacity_mb: u64,
        hostname: String,
        response: oneshot::Sender<Result<(), MembershipError>>,
    },
    Approve {
        id: PeerId,
        response: oneshot::Sender<Result<(), MembershipError>>,
    },
    Reject {
        id: PeerId,
        response: oneshot::Sender<Result<(), MembershipError>>,
    },
    Disconnect {
        id: PeerId,
        response: oneshot::Sender<Result<(), MembershipError>>,
    },
    /// A control session ended; evict the peer if it was connected
    SessionClosed { id: PeerId },
    ListConnected {
        response: oneshot::Sender<Vec<PeerRecord>>,
    },
    ListPending {
        response: oneshot::Sender<Vec<PeerRecord>>,
    },
    GetConnected {
        id: PeerId,
        response: oneshot::Sender<Option<PeerRecord>>,
    },
    Shutdown,
}

/// Approved peers file format
#[derive(Debug, Serialize, Deserialize)]
struct ApprovedFileFormat {
    version: String,
    approved: Vec<PeerId>,
}

/// Load the approved id set; missing or corrupt files start empty.
fn load_approved_file(path: &Path) -> HashSet<PeerId> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No approved peers file at {:?}, starting empty", path);
            return HashSet::new();
        }
        Err(e) => {
            error!(
                "Failed to read approved peers file {:?}: {}, starting empty",
                path, e
            );
            return HashSet::new();
        }
    };
    match serde_json::from_str::<ApprovedFileFormat>(&content) {
        Ok(file_format) => {
            let approved: HashSet<PeerId> = file_format.approved.into_iter().collect();
            info!("Loaded {} approved peers from {:?}", approved.len(), path);
            approved
        }
        Err(e) => {
            error!(
                "Corrupt approved peers file {:?}: {}, starting empty",
                path, e
            );
            HashSet::new()
        }
    }
}

/// Save the approved id set atomically: temp file, then rename.
fn save_approved_file(path: &Path, approved: &HashSet<PeerId>) -> Result<(), MembershipError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut ids: Vec<PeerId> = approved.iter().copied().collect();
    ids.sort();
    let file_format = ApprovedFileFormat {
        version: "1.0".to_string(),
        approved: ids,
    };
    let json = serde_json::to_string_pretty(&file_format)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    debug!("Saved {} approved peers to {:?}", approved.len(), path);
    Ok(())
}

/// The membership actor. Owns all peer state exclusively; everything else
/// talks to it through a [`MembershipHandle`].
pub struct MembershipService {
    config: MembershipConfig,
    approved_path: PathBuf,
    approved: HashSet<PeerId>,
    pending: HashMap<PeerId, PeerRecord>,
    connected: HashMap<PeerId, PeerRecord>,
    command_rx: mpsc::UnboundedReceiver<MembershipCommand>,
    event_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipService {
    pub fn new(
        config: MembershipConfig,
        approved_path: PathBuf,
        event_tx: mpsc::UnboundedSender<MembershipEvent>,
    ) -> (Self, MembershipHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let approved = load_approved_file(&approved_path);
        let service = Self {
            config,
            approved_path,
            approved,
            pending: HashMap::new(),
            connected: HashMap::new(),
            command_rx,
            event_tx,
        };
        (service, MembershipHandle { command_tx })
    }

    /// Run the main event loop
    pub async fn run(&mut self) {
        info!(
            "Membership service started ({} durably approved peers)",
            self.approved.len()
        );
        let mut monitor = tokio::time::interval(self.config.monitor_period);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        None => {
                            warn!("Membership command channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = monitor.tick() => {
                    self.evict_stale();
                }
            }
        }

        info!("Membership service shutting down");
    }

    /// Returns false when a shutdown was requested.
    fn handle_command(&mut self, command: MembershipCommand) -> bool {
        match command {
            MembershipCommand::RequestIdentity {
                hostname,
                capacity_mb,
                addr,
                response,
            } => {
                let id = self.handle_request_identity(hostname, capacity_mb, addr);
                let _ = response.send(id);
            }
            MembershipCommand::ValidateIdentity {
                id,
                hostname,
                capacity_mb,
                addr,
                response,
            } => {
                let approved = self.handle_validate_identity(id, hostname, capacity_mb, addr);
                let _ = response.send(approved);
            }
            MembershipCommand::Heartbeat {
                id,
                transfer_port,
                capacity_mb,
                hostname,
                response,
            } => {
                let result = self.handle_heartbeat(id, transfer_port, capacity_mb, hostname);
                let _ = response.send(result);
            }
            MembershipCommand::Approve { id, response } => {
                let _ = response.send(self.handle_approve(id));
            }
            MembershipCommand::Reject { id, response } => {
                let _ = response.send(self.handle_reject(id));
            }
            MembershipCommand::Disconnect { id, response } => {
                let _ = response.send(self.handle_disconnect(id));
            }
            MembershipCommand::SessionClosed { id } => {
                if let Some(record) = self.connected.remove(&id) {
                    warn!("Control session for connected peer {} ended, evicting", id);
                    self.emit(MembershipEvent::PeerLost {
                        id,
                        transfer_addr: record.transfer_addr(),
                    });
                }
            }
            MembershipCommand::ListConnected { response } => {
                let _ = response.send(self.sorted_records(&self.connected));
            }
            MembershipCommand::ListPending { response } => {
                let _ = response.send(self.sorted_records(&self.pending));
            }
            MembershipCommand::GetConnected { id, response } => {
                let _ = response.send(self.connected.get(&id).cloned());
            }
            MembershipCommand::Shutdown => {
                return false;
            }
        }
        true
    }

    fn handle_request_identity(
        &mut self,
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
    ) -> PeerId {
        let id = PeerId::generate();
        info!(
            "Issued identity {} to {} ({}, {} MB)",
            id, hostname, addr, capacity_mb
        );
        self.pending.insert(
            id,
            PeerRecord {
                id,
                hostname,
                control_ip: addr,
                transfer_port: None,
                capacity_bytes: capacity_mb * MEGABYTE,
                first_seen: SystemTime::now(),
                last_seen: Instant::now(),
            },
        );
        id
    }

    fn handle_validate_identity(
        &mut self,
        id: PeerId,
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
    ) -> bool {
        let record = PeerRecord {
            id,
            hostname,
            control_ip: addr,
            transfer_port: None,
            capacity_bytes: capacity_mb * MEGABYTE,
            first_seen: self
                .connected
                .get(&id)
                .or_else(|| self.pending.get(&id))
                .map(|r| r.first_seen)
                .unwrap_or_else(SystemTime::now),
            last_seen: Instant::now(),
        };

        if self.approved.contains(&id) {
            self.pending.remove(&id);
            info!("Approved peer {} reconnected from {}", id, addr);
            self.connected.insert(id, record);
            self.emit(MembershipEvent::PeerConnected { id });
            true
        } else {
            debug!("Peer {} awaits approval (contact from {})", id, addr);
            self.connected.remove(&id);
            self.pending.insert(id, record);
            false
        }
    }

    fn handle_heartbeat(
        &mut self,
        id: PeerId,
        transfer_port: u16,
        capacity_mb: u64,
        hostname: String,
    ) -> Result<(), MembershipError> {
        if let Some(record) = self.connected.get_mut(&id) {
            record.last_seen = Instant::now();
            record.transfer_port = Some(transfer_port);
            record.capacity_bytes = capacity_mb * MEGABYTE;
            record.hostname = hostname;
            return Ok(());
        }
        if self.pending.contains_key(&id) {
            return Err(MembershipError::PendingApproval { id });
        }
        Err(MembershipError::UnknownPeer { id })
    }

    fn handle_approve(&mut self, id: PeerId) -> Result<(), MembershipError> {
        let record = self
            .pending
            .remove(&id)
            .ok_or(MembershipError::NotPending { id })?;

        self.approved.insert(id);
        if let Err(e) = save_approved_file(&self.approved_path, &self.approved) {
            self.approved.remove(&id);
            self.pending.insert(id, record);
            return Err(e);
        }

        info!("Approved peer {} ({})", id, record.hostname);
        let mut record = record;
        record.last_seen = Instant::now();
        self.connected.insert(id, record);
        self.emit(MembershipEvent::PeerConnected { id });
        Ok(())
    }

    fn handle_reject(&mut self, id: PeerId) -> Result<(), MembershipError> {
        match self.pending.remove(&id) {
            Some(record) => {
                info!("Rejected peer {} ({})", id, record.hostname);
                Ok(())
            }
            None => Err(MembershipError::NotPending { id }),
        }
    }

    fn handle_disconnect(&mut self, id: PeerId) -> Result<(), MembershipError> {
        if let Some(record) = self.connected.remove(&id) {
            info!("Disconnected peer {} ({})", id, record.hostname);
            self.emit(MembershipEvent::PeerLost {
                id,
                transfer_addr: record.transfer_addr(),
            });
            return Ok(());
        }
        if self.pending.remove(&id).is_some() {
            info!("Dropped pending peer {}", id);
            return Ok(());
        }
        Err(MembershipError::UnknownPeer { id })
    }

    /// Evict connected peers with stale heartbeats and purge stale Pending
    /// entries nobody is retrying.
    fn evict_stale(&mut self) {
        let now = Instant::now();
        let threshold = self.config.staleness_threshold;

        let stale: Vec<PeerId> = self
            .connected
            .values()
            .filter(|r| now.duration_since(r.last_seen) > threshold)
            .map(|r| r.id)
            .collect();
        for id in stale {
            if let Some(record) = self.connected.remove(&id) {
                warn!(
                    "Peer {} ({}) missed heartbeats for {:?}, evicting",
                    id,
                    record.hostname,
                    now.duration_since(record.last_seen)
                );
                self.emit(MembershipEvent::PeerLost {
                    id,
                    transfer_addr: record.transfer_addr(),
                });
            }
        }

        let stale_pending: Vec<PeerId> = self
            .pending
            .values()
            .filter(|r| now.duration_since(r.last_seen) > threshold)
            .map(|r| r.id)
            .collect();
        for id in stale_pending {
            self.pending.remove(&id);
            info!("Purged stale pending peer {}", id);
        }
    }

    fn sorted_records(&self, map: &HashMap<PeerId, PeerRecord>) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = map.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Cloneable client for the membership actor.
#[derive(Clone)]
pub struct MembershipHandle {
    command_tx: mpsc::UnboundedSender<MembershipCommand>,
}

impl MembershipHandle {
    async fn request<T>(
        &self,
        command: MembershipCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, MembershipError> {
        self.command_tx
            .send(command)
            .map_err(|_| MembershipError::ServiceUnavailable)?;
        rx.await.map_err(|_| MembershipError::ServiceUnavailable)
    }

    /// Issue a fresh identity for a peer with no saved id.
    pub async fn request_identity(
        &self,
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
    ) -> Result<PeerId, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            MembershipCommand::RequestIdentity {
                hostname,
                capacity_mb,
                addr,
                response: tx,
            },
            rx,
        )
        .await
    }

    /// Check a saved identity; promotes to Connected when durably approved.
    pub async fn validate_identity(
        &self,
        id: PeerId,
        hostname: String,
        capacity_mb: u64,
        addr: IpAddr,
    ) -> Result<bool, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            MembershipCommand::ValidateIdentity {
                id,
                hostname,
                capacity_mb,
                addr,
                response: tx,
            },
            rx,
        )
        .await
    }

    pub async fn heartbeat(
        &self,
        id: PeerId,
        transfer_port: u16,
        capacity_mb: u64,
        hostname: String,
    ) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            MembershipCommand::Heartbeat {
                id,
                transfer_port,
                capacity_mb,
                hostname,
                response: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn approve(&self, id: PeerId) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::Approve { id, response: tx }, rx)
            .await?
    }

    pub async fn reject(&self, id: PeerId) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::Reject { id, response: tx }, rx)
            .await?
    }

    pub async fn disconnect(&self, id: PeerId) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::Disconnect { id, response: tx }, rx)
            .await?
    }

    /// Report a closed control session; evicts the peer if it was connected.
    pub fn session_closed(&self, id: PeerId) {
        let _ = self
            .command_tx
            .send(MembershipCommand::SessionClosed { id });
    }

    pub async fn list_connected(&self) -> Result<Vec<PeerRecord>, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::ListConnected { response: tx }, rx)
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<PeerRecord>, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::ListPending { response: tx }, rx)
            .await
    }

    /// Record for a currently connected peer.
    pub async fn get_connected(&self, id: PeerId) -> Result<Option<PeerRecord>, MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.request(MembershipCommand::GetConnected { id, response: tx }, rx)
            .await
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(MembershipCommand::Shutdown);
    }
}
