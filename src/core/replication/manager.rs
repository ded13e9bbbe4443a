// src/core/replication/manager.rs

//! The replication manager (C7): the central component. Maintains the
//! per-node replication state of the data model and implements write
//! propagation, replica bootstrap, acknowledgement, and the replica-side
//! apply path. The reconnect loop that drives the replica side lives in
//! `worker.rs`.

use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{info, warn};

use crate::core::command::Command;
use crate::core::discovery::{ServiceInfo, ServiceRegistry};
use crate::core::engine::Engine;
use crate::core::errors::CoreError;
use crate::core::protocol::frame::{Reply, RespFrame, WireCodec};
use crate::core::replication::backlog::{ReplicationBuffer, DEFAULT_CAPACITY};
use crate::core::replication::transport::{ReplCommand, ReplMessage};
use crate::core::role::{Role, RoleManager};

/// One-hour TTL for the idempotence guard, per the data model.
pub const PROCESSED_CMDS_TTL: Duration = Duration::from_secs(3600);

/// Threshold past which a replica's lag triggers a warning log.
pub const LAG_WARNING_BYTES: i64 = 1024 * 1024;

/// A registered replica, as seen from the primary.
pub struct SlaveInfo {
    pub host: String,
    pub port: u16,
    pub last_ack_time: Instant,
    pub ack_offset: i64,
    pub expected_offset: i64,
    pub transport_tx: mpsc::UnboundedSender<ReplMessage>,
}

type CmdHash = [u8; 16];

fn hash_command(bytes: &[u8]) -> CmdHash {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Generates a 40-character opaque replication id. Per the design notes
/// this is treated purely as an opaque correlator, not a structured
/// value, so a random hex string of the right length is sufficient.
pub fn generate_replication_id() -> String {
    let mut bytes = [0u8; 20];
    getrandom::fill(&mut bytes).expect("system randomness unavailable");
    hex::encode(bytes)
}

/// The central replication component, holding all per-node replication
/// state. Constructed once per node and shared behind an `Arc`.
pub struct ReplicationManager {
    engine: Arc<dyn Engine>,
    role_manager: Arc<RoleManager>,
    discovery: Arc<dyn ServiceRegistry>,

    pub node_id: Option<String>,
    pub advertise_host: String,
    pub advertise_port: u16,
    pub protocol_port: u16,

    replication_id: RwLock<String>,
    backlog: Mutex<ReplicationBuffer>,
    /// Count of replicas currently mid-snapshot; `> 0` is the data
    /// model's `sync_in_progress` flag.
    syncing_replicas: AtomicUsize,
    buffered_cmds: Mutex<VecDeque<ReplCommand>>,
    slaves: DashMap<u64, SlaveInfo>,
    processed_cmds: DashMap<CmdHash, Instant>,
    master_info_subscribers: DashMap<u64, mpsc::UnboundedSender<Reply>>,

    connected_to_master: AtomicBool,
    master_addr: Mutex<Option<(String, u16)>>,
    replica_applied_offset: AtomicI64,
    /// Local "mid full-resync" flag, set while this node (as a replica)
    /// is awaiting or ingesting a snapshot from its own primary.
    replica_sync_in_progress: AtomicBool,
    /// Set by `SLAVEOF NO ONE` so the next Replica->Primary transition
    /// skips the usual replication-id rotation (see design notes: this
    /// mirrors a source behavior that looks like a latent bug but is
    /// deliberately preserved here rather than "fixed" unasked).
    suppress_id_regen: AtomicBool,
}

impl ReplicationManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        role_manager: Arc<RoleManager>,
        discovery: Arc<dyn ServiceRegistry>,
        node_id: Option<String>,
        advertise_host: String,
        advertise_port: u16,
        protocol_port: u16,
    ) -> Self {
        Self {
            engine,
            role_manager,
            discovery,
            node_id,
            advertise_host,
            advertise_port,
            protocol_port,
            replication_id: RwLock::new(generate_replication_id()),
            backlog: Mutex::new(ReplicationBuffer::new(DEFAULT_CAPACITY)),
            syncing_replicas: AtomicUsize::new(0),
            buffered_cmds: Mutex::new(VecDeque::new()),
            slaves: DashMap::new(),
            processed_cmds: DashMap::new(),
            master_info_subscribers: DashMap::new(),
            connected_to_master: AtomicBool::new(false),
            master_addr: Mutex::new(None),
            replica_applied_offset: AtomicI64::new(0),
            replica_sync_in_progress: AtomicBool::new(false),
            suppress_id_regen: AtomicBool::new(false),
        }
    }

    pub fn replication_id(&self) -> String {
        self.replication_id.read().clone()
    }

    /// `master_offset` as defined in the data model: bytes produced so
    /// far as Primary, bytes applied so far as Replica.
    pub fn master_offset(&self) -> i64 {
        match self.role_manager.role() {
            Role::Replica => self.replica_applied_offset.load(Ordering::SeqCst),
            _ => self.backlog.lock().master_offset(),
        }
    }

    fn service_id(&self) -> String {
        ServiceInfo::derive_id(&self.node_id, &self.advertise_host, self.advertise_port)
    }

    fn self_service_info(&self, is_master: bool) -> ServiceInfo {
        ServiceInfo {
            id: self.service_id(),
            host: self.advertise_host.clone(),
            port: self.advertise_port,
            protocol_port: self.protocol_port,
            is_master,
            node_id: self.node_id.clone().unwrap_or_default(),
        }
    }

    // ---- 4.7.1 Lifecycle -------------------------------------------------

    pub async fn start(self: &Arc<Self>) {
        match self.role_manager.role() {
            Role::Primary => {
                let _ = self.discovery.register(self.self_service_info(true)).await;
                info!("replication manager started as primary");
            }
            Role::Replica => {
                let _ = self
                    .discovery
                    .register(self.self_service_info(false))
                    .await;
                info!("replication manager started as replica");
            }
            Role::None => {}
        }
    }

    /// Flushes the local engine before a (re)connect attempt, per the
    /// requirement that a replica never serves stale data while
    /// resynchronizing with a new primary.
    pub fn flush_all_for_reconnect(&self) {
        self.engine.flush_all();
    }

    pub async fn stop(&self) {
        let _ = self.discovery.deregister(&self.service_id()).await;
        crate::core::metrics::REPLICAS_CONNECTED.set(0);
        self.slaves.clear();
        self.master_info_subscribers.clear();
    }

    /// Removes `processed_cmds` entries past their one-hour TTL.
    pub fn sweep_processed_cmds(&self) {
        let now = Instant::now();
        self.processed_cmds
            .retain(|_, applied_at| now.duration_since(*applied_at) < PROCESSED_CMDS_TTL);
    }

    /// Drops replica entries that haven't ack'd within `max_idle`.
    pub fn sweep_dead_subscribers(&self, max_idle: Duration) {
        let now = Instant::now();
        let before = self.slaves.len();
        self.slaves
            .retain(|_, slave| now.duration_since(slave.last_ack_time) < max_idle);
        let dropped = before.saturating_sub(self.slaves.len());
        for _ in 0..dropped {
            crate::core::metrics::REPLICAS_CONNECTED.dec();
        }
    }

    // ---- 4.7.2 Write propagation (primary path) --------------------------

    pub fn should_replicate(&self, cmd: &Command) -> bool {
        self.role_manager.role() == Role::Primary
            && cmd.is_write()
            && cmd.name != "SELECT"
            && !self.slaves.is_empty()
    }

    /// Always returns `None` ("continue to engine"); records and fans out
    /// the write as a side effect.
    pub fn handle_replicated_command(&self, cmd: &Command) -> Option<Reply> {
        crate::core::metrics::REPLICATED_COMMANDS.inc();
        let wire = cmd.wire_bytes();
        let mut backlog = self.backlog.lock();
        let offset = backlog.master_offset();
        let envelope = ReplCommand {
            db_index: cmd.db_index as u32,
            offset,
            command: wire,
        };
        let encoded = envelope.encode();
        backlog.write(encoded);
        drop(backlog);

        if self.syncing_replicas.load(Ordering::SeqCst) > 0 {
            self.buffered_cmds.lock().push_back(envelope.clone());
        }

        for mut slave in self.slaves.iter_mut() {
            if slave.transport_tx.send(ReplMessage::Command(envelope.clone())).is_ok() {
                slave.expected_offset = offset + envelope.encoded_len();
            } else {
                warn!(addr = %format!("{}:{}", slave.host, slave.port), "failed to send envelope to replica");
            }
        }
        None
    }

    // ---- 4.7.3 Replica registration and full resync -----------------------

    /// Registers a new replica connection and kicks off the snapshot
    /// transfer in the background. Returns the `FULLRESYNC` reply text
    /// the caller sends on the command channel.
    pub fn begin_full_resync(
        self: &Arc<Self>,
        client_id: u64,
        host: String,
        port: u16,
        transport_tx: mpsc::UnboundedSender<ReplMessage>,
    ) -> String {
        let now = Instant::now();
        let replaced = self.slaves.insert(
            client_id,
            SlaveInfo {
                host,
                port,
                last_ack_time: now,
                ack_offset: 0,
                expected_offset: 0,
                transport_tx,
            },
        );
        if replaced.is_none() {
            crate::core::metrics::REPLICAS_CONNECTED.inc();
        }

        self.syncing_replicas.fetch_add(1, Ordering::SeqCst);
        let sync_start_offset = self.backlog.lock().master_offset();
        self.buffered_cmds.lock().clear();

        let this = self.clone();
        tokio::spawn(async move {
            this.produce_and_send_snapshot(client_id, sync_start_offset).await;
        });

        format!("FULLRESYNC {} 0", self.replication_id())
    }

    async fn produce_and_send_snapshot(&self, client_id: u64, sync_start_offset: i64) {
        let entries = self.engine.snapshot();
        let blob = super::snapshot::encode(entries);
        let blob_len = blob.len() as i64;

        let sent = self
            .slaves
            .get(&client_id)
            .map(|s| s.transport_tx.send(ReplMessage::Snapshot(blob)).is_ok())
            .unwrap_or(false);

        if sent {
            if let Some(mut slave) = self.slaves.get_mut(&client_id) {
                slave.ack_offset = sync_start_offset;
                slave.expected_offset = sync_start_offset + blob_len;
                slave.last_ack_time = Instant::now();
            }

            let buffered: Vec<ReplCommand> = self
                .buffered_cmds
                .lock()
                .iter()
                .filter(|e| e.offset > sync_start_offset)
                .cloned()
                .collect();
            if let Some(slave) = self.slaves.get(&client_id) {
                for envelope in buffered {
                    let _ = slave.transport_tx.send(ReplMessage::Command(envelope));
                }
            }
        } else {
            warn!(client_id, "snapshot send failed, dropping replica");
            self.slaves.remove(&client_id);
            crate::core::metrics::REPLICAS_CONNECTED.dec();
        }

        self.syncing_replicas.fetch_sub(1, Ordering::SeqCst);
    }

    // ---- 4.7.5 Acknowledgement --------------------------------------------

    pub fn handle_ack(&self, client_id: u64, offset: i64) {
        if let Some(mut slave) = self.slaves.get_mut(&client_id) {
            slave.ack_offset = offset;
            slave.last_ack_time = Instant::now();
            if slave.expected_offset - slave.ack_offset > LAG_WARNING_BYTES {
                warn!(
                    client_id,
                    lag = slave.expected_offset - slave.ack_offset,
                    "replica lagging"
                );
            }
        }
    }

    pub fn record_listening_port(&self, client_id: u64, port: u16) {
        if let Some(mut slave) = self.slaves.get_mut(&client_id) {
            slave.port = port;
        }
    }

    // ---- 4.7.6 Master-change subscriber fan-out ----------------------------

    pub fn subscribe_master_info(&self, client_id: u64) -> mpsc::UnboundedReceiver<Reply> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.master_info_subscribers.insert(client_id, tx);
        rx
    }

    pub async fn current_master_address(&self) -> Option<(String, u16)> {
        if self.role_manager.role() == Role::Primary {
            return Some((self.advertise_host.clone(), self.advertise_port));
        }
        if let Some(addr) = self.master_addr.lock().clone() {
            return Some(addr);
        }
        self.discovery
            .find_master()
            .await
            .map(|info| (info.host, info.port))
    }

    pub fn publish_master_change(&self, host: &str, port: u16) {
        let push = Reply::Array(vec![
            Reply::Status("master-changed".into()),
            Reply::from_bytes(format!("{host}:{port}")),
        ]);
        let dead: Vec<u64> = self
            .master_info_subscribers
            .iter()
            .filter_map(|e| {
                if e.value().send(push.clone()).is_err() {
                    Some(*e.key())
                } else {
                    None
                }
            })
            .collect();
        for id in dead {
            self.master_info_subscribers.remove(&id);
        }
    }

    // ---- 4.7.7 Role transition handling -------------------------------------

    /// Installs the role-manager listener implementing the transition
    /// semantics. Called once at startup.
    pub fn install_role_listener(self: &Arc<Self>) {
        let this = self.clone();
        self.role_manager.on_transition(move |old, new| {
            match (old, new) {
                (_, Role::Primary) if old != Role::Primary => {
                    if this.suppress_id_regen.swap(false, Ordering::SeqCst) {
                        info!("SLAVEOF NO ONE: keeping existing replication id");
                    } else {
                        *this.replication_id.write() = generate_replication_id();
                    }
                    this.connected_to_master.store(false, Ordering::SeqCst);
                    let this2 = this.clone();
                    tokio::spawn(async move {
                        let _ = this2.discovery.register(this2.self_service_info(true)).await;
                    });
                }
                (Role::Primary, Role::Replica) => {
                    this.connected_to_master.store(false, Ordering::SeqCst);
                    this.processed_cmds.clear();
                    let this2 = this.clone();
                    tokio::spawn(async move {
                        let _ = this2.discovery.register(this2.self_service_info(false)).await;
                    });
                }
                _ => {}
            }
        });
    }

    /// Records an operator-supplied master address ahead of an explicit
    /// `SLAVEOF host port`, so `current_master_address` and the reconnect
    /// loop prefer it over whatever service discovery currently reports.
    pub fn set_master_addr(&self, host: String, port: u16) {
        *self.master_addr.lock() = Some((host, port));
    }

    /// Called by `SLAVEOF NO ONE` handling, before flipping the role to
    /// Primary, to suppress the usual replication-id rotation.
    pub fn skip_next_replication_id_regen(&self) {
        self.suppress_id_regen.store(true, Ordering::SeqCst);
    }

    pub fn is_connected_to_master(&self) -> bool {
        self.connected_to_master.load(Ordering::SeqCst)
    }

    pub fn set_connected_to_master(&self, connected: bool, addr: Option<(String, u16)>) {
        self.connected_to_master.store(connected, Ordering::SeqCst);
        if connected {
            *self.master_addr.lock() = addr;
        }
    }

    // ---- 4.7.4 Replica apply path -------------------------------------------

    /// Applies an inbound snapshot: flush-then-restore, advance the
    /// applied offset, and return the ack to send back.
    pub fn apply_snapshot(&self, blob: bytes::Bytes) -> Result<i64, CoreError> {
        let entries = super::snapshot::decode(&blob)?;
        self.engine.flush_all();
        self.engine.restore(entries);
        let new_offset =
            self.replica_applied_offset.fetch_add(blob.len() as i64, Ordering::SeqCst)
                + blob.len() as i64;
        self.replica_sync_in_progress.store(false, Ordering::SeqCst);
        self.drain_buffered_after_snapshot();
        Ok(new_offset)
    }

    fn drain_buffered_after_snapshot(&self) {
        let buffered: Vec<ReplCommand> = self.buffered_cmds.lock().drain(..).collect();
        for envelope in buffered {
            let _ = self.apply_replicated_command(envelope);
        }
    }

    /// Marks this node as awaiting a snapshot (set right after sending
    /// the sync request, before any data arrives).
    pub fn begin_replica_sync(&self) {
        self.replica_sync_in_progress.store(true, Ordering::SeqCst);
        self.buffered_cmds.lock().clear();
    }

    /// Applies one replicated envelope on the replica side, honoring the
    /// idempotence guard and the buffered-during-snapshot detour.
    /// Returns the offset to ack.
    pub fn apply_replicated_command(&self, envelope: ReplCommand) -> Result<i64, CoreError> {
        let hash = hash_command(&envelope.command);
        let new_offset = envelope.offset + envelope.encoded_len();

        if self.processed_cmds.contains_key(&hash) {
            self.replica_applied_offset.store(new_offset, Ordering::SeqCst);
            return Ok(new_offset);
        }

        if self.replica_sync_in_progress.load(Ordering::SeqCst) {
            self.buffered_cmds.lock().push_back(envelope);
            self.replica_applied_offset.store(new_offset, Ordering::SeqCst);
            return Ok(new_offset);
        }

        self.processed_cmds.insert(hash, Instant::now());

        if let Err(e) = self.apply_command_bytes(envelope.db_index as usize, &envelope.command) {
            warn!(error = %e, "failed to apply replicated command, advancing offset anyway");
        }

        self.replica_applied_offset.store(new_offset, Ordering::SeqCst);
        Ok(new_offset)
    }

    fn apply_command_bytes(&self, db_index: usize, command: &[u8]) -> Result<(), CoreError> {
        let mut codec = WireCodec;
        let mut buf = bytes::BytesMut::from(command);
        let frame = codec
            .decode_eof(&mut buf)
            .map_err(|_| CoreError::Protocol("malformed replicated command".into()))?
            .ok_or_else(|| CoreError::Protocol("truncated replicated command".into()))?;
        let cmd = Command::from_frame(frame, 0)?;

        match cmd.name.as_str() {
            "FLUSHALL" => {
                self.engine.flush_all();
                Ok(())
            }
            "FLUSHDB" => {
                let target = cmd
                    .args
                    .first()
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(db_index);
                self.engine.flush_db(target);
                Ok(())
            }
            name => {
                self.engine.dispatch(db_index, name, &cmd.args)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::InMemoryServiceRegistry;
    use crate::core::engine::InMemoryEngine;
    use crate::core::role::InMemoryElectionClient;
    use bytes::Bytes;

    fn make_manager(role: Role) -> Arc<ReplicationManager> {
        let engine = Arc::new(InMemoryEngine::new(16));
        let election = Arc::new(InMemoryElectionClient::new(role == Role::Primary));
        let role_manager = Arc::new(RoleManager::new(election));
        role_manager.set_role(role);
        let discovery = Arc::new(InMemoryServiceRegistry::new());
        Arc::new(ReplicationManager::new(
            engine,
            role_manager,
            discovery,
            Some("n1".into()),
            "127.0.0.1".into(),
            6379,
            16379,
        ))
    }

    fn set_command() -> Command {
        Command {
            name: "SET".into(),
            args: vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")],
            client_id: 1,
            db_index: 0,
            reply_tx: None,
        }
    }

    #[test]
    fn should_replicate_requires_slaves_and_write() {
        let manager = make_manager(Role::Primary);
        assert!(!manager.should_replicate(&set_command())); // no slaves yet
    }

    #[test]
    fn handle_replicated_command_advances_offset_monotonically() {
        let manager = make_manager(Role::Primary);
        let before = manager.master_offset();
        manager.handle_replicated_command(&set_command());
        let after = manager.master_offset();
        assert!(after > before);
    }

    #[test]
    fn duplicate_envelope_applies_exactly_once() {
        let manager = make_manager(Role::Replica);
        let cmd = set_command();
        let wire = cmd.wire_bytes();
        let envelope = ReplCommand {
            db_index: 0,
            offset: 0,
            command: wire,
        };
        let first = manager.apply_replicated_command(envelope.clone()).unwrap();
        let second = manager.apply_replicated_command(envelope).unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.master_offset(), first);
    }
}
