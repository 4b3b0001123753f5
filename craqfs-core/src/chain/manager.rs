use crate::chain::ledger::{
    AppendOutcome, Block, BlockHandle, BlockLedger, BlockVersion, VersionSummary,
};
use crate::chain::message::ChainMessage;
use crate::chain::topology::{ChainNode, ChainTopology, NodeRole};
use crate::chain::transport::{MessageHandler, Session, Transport};
use crate::error::{CraqError, Result};
use crate::storage::{BlockMetadata, LocalBlockStore, validate_block_id};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(5);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub chain_length: usize,
    pub replication_factor: usize,
    pub propagation_timeout: Duration,
}

impl ChainSettings {
    pub fn new(chain_length: usize, replication_factor: usize) -> Self {
        Self {
            chain_length,
            replication_factor,
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
        }
    }

    pub fn with_propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_length == 0 {
            return Err(CraqError::Validation(
                "chain length must be greater than zero".to_string(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(CraqError::Validation(
                "replication factor must be greater than zero".to_string(),
            ));
        }
        if self.replication_factor > self.chain_length {
            return Err(CraqError::Validation(format!(
                "replication factor {} exceeds chain length {}",
                self.replication_factor, self.chain_length
            )));
        }
        if self.propagation_timeout.is_zero() {
            return Err(CraqError::Validation(
                "propagation timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A committed version as returned to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBlock {
    pub version: u64,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl From<BlockVersion> for VersionedBlock {
    fn from(version: BlockVersion) -> Self {
        Self {
            version: version.version,
            data: version.data,
            metadata: version.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub version: u64,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub node_count: usize,
    pub block_count: usize,
    pub total_versions: usize,
    pub dirty_versions: usize,
}

/// Where the local node sits in the chain at the time of a call.
struct Placement {
    role: NodeRole,
    head: ChainNode,
    tail: ChainNode,
    successor: Option<ChainNode>,
}

impl Placement {
    fn require_head(&self) -> Result<()> {
        if self.role.is_head() {
            return Ok(());
        }
        Err(CraqError::NotHead {
            head_id: self.head.node_id.clone(),
            head_address: self.head.address.clone(),
        })
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// ChainManager owns the chain topology and the per-block version ledger of
/// one node, and runs the CRAQ write, read and delete protocols against its
/// peers through a `Transport`.
///
/// Locking is two-level: the topology and the ledger's id map are locked only
/// for lookups, each block has its own lock for appends and clean marks. No
/// lock is held while a message is in flight.
pub struct ChainManager {
    local_node_id: String,
    settings: ChainSettings,
    topology: RwLock<ChainTopology>,
    sessions: RwLock<HashMap<String, Session>>,
    ledger: BlockLedger,
    store: Arc<LocalBlockStore>,
    transport: Arc<dyn Transport>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
}

impl ChainManager {
    pub fn new(
        local_node_id: impl Into<String>,
        settings: ChainSettings,
        store: Arc<LocalBlockStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        settings.validate()?;
        let local_node_id = local_node_id.into();
        if local_node_id.trim().is_empty() {
            return Err(CraqError::Validation("node id cannot be empty".to_string()));
        }

        Ok(Self {
            local_node_id,
            topology: RwLock::new(ChainTopology::new(settings.chain_length)),
            settings,
            sessions: RwLock::new(HashMap::new()),
            ledger: BlockLedger::new(),
            store,
            transport,
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<LocalBlockStore> {
        &self.store
    }

    /// Appends a node at the tail end. The topology is fixed once
    /// `initialize` has run.
    pub async fn add_node(&self, node_id: &str, address: &str) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(CraqError::Validation(
                "chain topology is fixed after initialize".to_string(),
            ));
        }

        let mut topology = self.topology.write().await;
        topology.push(node_id, address)?;
        tracing::debug!(
            "Added node {} at {} (chain size {}/{})",
            node_id,
            address,
            topology.len(),
            topology.chain_length()
        );
        Ok(())
    }

    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let peers: Vec<ChainNode> = {
            let topology = self.topology.read().await;
            if topology.is_empty() {
                return Err(CraqError::EmptyChain);
            }
            if topology.position(&self.local_node_id).is_none() {
                return Err(CraqError::Validation(format!(
                    "node {} is not part of the chain",
                    self.local_node_id
                )));
            }
            if topology.len() < self.settings.replication_factor {
                return Err(CraqError::Validation(format!(
                    "replication factor {} needs at least as many nodes, chain has {}",
                    self.settings.replication_factor,
                    topology.len()
                )));
            }
            topology
                .nodes()
                .iter()
                .filter(|node| node.node_id != self.local_node_id)
                .cloned()
                .collect()
        };

        let results = join_all(peers.iter().map(|peer| async move {
            self.transport
                .connect(&peer.address)
                .await
                .map(|session| (peer.node_id.clone(), session))
        }))
        .await;

        let mut first_error = None;
        {
            let mut sessions = self.sessions.write().await;
            for result in results {
                match result {
                    Ok((node_id, session)) => {
                        sessions.insert(node_id, session);
                    }
                    Err(error) => {
                        tracing::warn!("Failed to connect to chain peer: {}", error);
                        first_error.get_or_insert(error);
                    }
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            "Chain initialized on {} as {:?} with {} peer sessions",
            self.local_node_id,
            self.role().await?,
            peers.len()
        );
        Ok(())
    }

    pub async fn role(&self) -> Result<NodeRole> {
        Ok(self.placement().await?.role)
    }

    pub async fn topology(&self) -> ChainTopology {
        self.topology.read().await.clone()
    }

    /// Writes `data` with caller-supplied metadata bytes.
    pub async fn write(&self, block_id: &str, data: Bytes, metadata: Bytes) -> Result<WriteReceipt> {
        self.write_with(block_id, data, move |_, _| Ok(metadata))
            .await
    }

    /// Writes `data`, building the metadata from the version assigned to it
    /// and the previous version's metadata. `build` runs under the block lock.
    pub async fn write_with<F>(&self, block_id: &str, data: Bytes, build: F) -> Result<WriteReceipt>
    where
        F: FnOnce(u64, Option<&[u8]>) -> Result<Bytes> + Send,
    {
        self.write_with_timeout(block_id, data, self.settings.propagation_timeout, build)
            .await
    }

    pub async fn write_with_timeout<F>(
        &self,
        block_id: &str,
        data: Bytes,
        deadline: Duration,
        build: F,
    ) -> Result<WriteReceipt>
    where
        F: FnOnce(u64, Option<&[u8]>) -> Result<Bytes> + Send,
    {
        validate_block_id(block_id)?;
        self.ensure_initialized()?;
        let _guard = self.begin_mutation()?;

        let placement = self.placement().await?;
        placement.require_head()?;

        let context = format!("block {} waiting for a delete to finish", block_id);
        let (handle, mut block) = with_deadline(deadline, context, async {
            Ok(self.lock_live(block_id).await)
        })
        .await?;

        let version = block.next_version();
        let previous = block.latest().map(|entry| entry.metadata.clone());
        let metadata = build(version, previous.as_deref())?;

        match block.append(version, data.clone(), metadata.clone()) {
            AppendOutcome::Appended => {}
            other => {
                return Err(CraqError::Internal(format!(
                    "block {} refused its next version {}: {:?}",
                    block_id, version, other
                )));
            }
        }
        if let Err(error) = self.persist_version(block_id, version, &data, &metadata).await {
            block.rollback(version);
            return Err(error);
        }
        drop(block);

        match placement.successor {
            Some(next) => {
                self.propagate_write(&handle, block_id, version, &next, deadline)
                    .await?;
            }
            None => {
                handle.write().await.mark_clean_through(version);
            }
        }

        tracing::debug!("Committed block {} version {}", block_id, version);
        Ok(WriteReceipt { version, metadata })
    }

    /// Returns the newest version of the block this node can prove is
    /// committed at the tail.
    pub async fn read(&self, block_id: &str) -> Result<VersionedBlock> {
        validate_block_id(block_id)?;
        self.ensure_initialized()?;

        let Some(handle) = self.ledger.get(block_id).await else {
            return Err(CraqError::NotFound(block_id.to_string()));
        };

        let latest = handle.read().await.latest().cloned();
        let Some(latest) = latest else {
            return Err(CraqError::NotFound(block_id.to_string()));
        };
        if latest.clean {
            return Ok(latest.into());
        }

        let placement = self.placement().await?;
        let committed = self.query_committed(&placement.tail, block_id).await?;
        if committed == 0 {
            return Err(CraqError::NotReady(format!(
                "block {} has no committed version yet",
                block_id
            )));
        }

        let local = {
            let mut block = handle.write().await;
            let repaired = block.mark_clean_through(committed);
            if !repaired.is_empty() {
                tracing::warn!(
                    "Repair read marked block {} versions {:?} clean",
                    block_id,
                    repaired
                );
            }
            block.get(committed).cloned()
        };

        match local {
            Some(version) => Ok(version.into()),
            None => self.read_from_tail(&placement.tail, block_id).await,
        }
    }

    pub async fn delete(&self, block_id: &str) -> Result<()> {
        self.delete_with_timeout(block_id, self.settings.propagation_timeout)
            .await
    }

    pub async fn delete_with_timeout(&self, block_id: &str, deadline: Duration) -> Result<()> {
        validate_block_id(block_id)?;
        self.ensure_initialized()?;
        let _guard = self.begin_mutation()?;

        let placement = self.placement().await?;
        placement.require_head()?;

        let Some(handle) = self.ledger.get(block_id).await else {
            return Err(CraqError::NotFound(block_id.to_string()));
        };
        {
            let mut block = handle.write().await;
            if block.is_deleted() {
                return Err(CraqError::NotFound(format!(
                    "{} is already being deleted",
                    block_id
                )));
            }
            block.mark_deleted();
        }

        self.delete_downstream(&placement, block_id, Some(&handle), deadline)
            .await?;
        tracing::debug!("Deleted block {} from the chain", block_id);
        Ok(())
    }

    /// Snapshot of node, block and version counts.
    pub async fn stats(&self) -> ChainStats {
        let node_count = self.topology.read().await.len();
        let handles = self.ledger.handles().await;

        let mut stats = ChainStats {
            node_count,
            block_count: handles.len(),
            ..ChainStats::default()
        };
        for handle in handles {
            let block = handle.read().await;
            stats.total_versions += block.version_count();
            stats.dirty_versions += block.dirty_count();
        }
        stats
    }

    pub async fn version_summary(&self, block_id: &str) -> Vec<VersionSummary> {
        match self.ledger.get(block_id).await {
            Some(handle) => handle.read().await.summary(),
            None => Vec::new(),
        }
    }

    /// Rejects new mutations, waits for in-flight propagation to drain and
    /// releases every session.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drain_deadline = Instant::now() + self.settings.propagation_timeout;
        loop {
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            if Instant::now() >= drain_deadline {
                tracing::warn!(
                    "Shutting down with {} operations still propagating",
                    pending
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let sessions: Vec<Session> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            if let Err(error) = self.transport.disconnect(session).await {
                tracing::warn!(
                    "Failed to close session to {}: {}",
                    session.address(),
                    error
                );
            }
        }

        tracing::info!(
            "Chain manager on {} stopped, {} sessions closed",
            self.local_node_id,
            sessions.len()
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(CraqError::NotReady(format!(
            "chain on {} is not initialized",
            self.local_node_id
        )))
    }

    fn begin_mutation(&self) -> Result<InFlightGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            counter: &self.in_flight,
        };
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CraqError::ShuttingDown);
        }
        Ok(guard)
    }

    async fn placement(&self) -> Result<Placement> {
        let topology = self.topology.read().await;
        let local = topology.node(&self.local_node_id).ok_or_else(|| {
            CraqError::Validation(format!(
                "node {} is not part of the chain",
                self.local_node_id
            ))
        })?;
        let head = topology.head().cloned().ok_or(CraqError::EmptyChain)?;
        let tail = topology.tail().cloned().ok_or(CraqError::EmptyChain)?;

        Ok(Placement {
            role: local.role,
            head,
            tail,
            successor: topology.successor(&self.local_node_id).cloned(),
        })
    }

    async fn session_for(&self, node: &ChainNode) -> Result<Session> {
        if let Some(session) = self.sessions.read().await.get(&node.node_id) {
            return Ok(session.clone());
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CraqError::ShuttingDown);
        }

        let session = self.transport.connect(&node.address).await?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&node.node_id).cloned() {
            drop(sessions);
            self.transport.disconnect(&session).await?;
            return Ok(existing);
        }
        sessions.insert(node.node_id.clone(), session.clone());
        Ok(session)
    }

    async fn persist_version(
        &self,
        block_id: &str,
        version: u64,
        data: &Bytes,
        metadata: &[u8],
    ) -> Result<()> {
        let envelope = envelope_for(data, version, metadata);
        self.store
            .replace_block(block_id, data.clone(), &envelope)
            .await
    }

    /// Locks the live ledger entry of `block_id`, waiting while a delete of
    /// it is in flight.
    async fn lock_live(&self, block_id: &str) -> (BlockHandle, OwnedRwLockWriteGuard<Block>) {
        loop {
            let handle = self.ledger.get_or_create(block_id).await;
            let block = handle.clone().write_owned().await;
            if !block.is_deleted() {
                return (handle, block);
            }
            drop(block);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Forwards a delete of a tombstoned block, then drops it locally. A
    /// failed forward clears the tombstone and keeps the block.
    async fn delete_downstream(
        &self,
        placement: &Placement,
        block_id: &str,
        handle: Option<&BlockHandle>,
        deadline: Duration,
    ) -> Result<()> {
        if let Some(next) = &placement.successor {
            let context = format!("delete of block {} via {}", block_id, next.node_id);
            if let Err(error) =
                with_deadline(deadline, context, self.forward_delete(next, block_id)).await
            {
                if let Some(handle) = handle {
                    handle.write().await.clear_deleted();
                }
                tracing::warn!(
                    "Delete of block {} stopped at {}: {}",
                    block_id,
                    next.node_id,
                    error
                );
                return Err(error);
            }
        }

        // files go before the ledger entry so no writer can persist in between
        let removed = self.store.delete_block(block_id).await;
        if let Some(handle) = handle {
            self.ledger.remove_handle(block_id, handle).await;
        }
        removed
    }

    /// Forwards `version` downstream within `deadline` and marks every local
    /// version up to the acknowledged one clean.
    async fn propagate_write(
        &self,
        handle: &BlockHandle,
        block_id: &str,
        version: u64,
        next: &ChainNode,
        deadline: Duration,
    ) -> Result<()> {
        let context = format!(
            "block {} version {} via {}",
            block_id, version, next.node_id
        );
        let acked = with_deadline(
            deadline,
            context,
            self.forward_version(handle, block_id, version, next),
        )
        .await?;

        let cleaned = handle.write().await.mark_clean_through(acked);
        if !cleaned.is_empty() {
            tracing::debug!("Block {} versions {:?} clean", block_id, cleaned);
        }
        Ok(())
    }

    async fn forward_version(
        &self,
        handle: &BlockHandle,
        block_id: &str,
        version: u64,
        next: &ChainNode,
    ) -> Result<u64> {
        let session = self.session_for(next).await?;
        let mut pending = version;

        loop {
            let message = {
                let block = handle.read().await;
                if block.is_deleted() {
                    return Err(CraqError::NotReady(format!(
                        "block {} was deleted while version {} was propagating",
                        block_id, version
                    )));
                }
                let entry = block.get(pending).ok_or_else(|| {
                    CraqError::Internal(format!(
                        "block {} version {} missing from ledger",
                        block_id, pending
                    ))
                })?;
                ChainMessage::WriteForward {
                    block_id: block_id.to_string(),
                    version: entry.version,
                    data: entry.data.clone(),
                    metadata: entry.metadata.clone(),
                }
            };

            match self.transport.send(&session, message).await? {
                ChainMessage::WriteAck { version: acked, .. } => {
                    if pending >= version {
                        return Ok(acked.min(version));
                    }
                    handle.write().await.mark_clean_through(acked);
                    pending += 1;
                }
                ChainMessage::WriteGap {
                    expected_version, ..
                } => {
                    if expected_version == 0 || expected_version >= pending {
                        return Err(CraqError::Protocol(format!(
                            "{} asked for version {} of block {} while sending {}",
                            next.node_id, expected_version, block_id, pending
                        )));
                    }
                    tracing::warn!(
                        "Back-filling block {} versions {}..{} to {}",
                        block_id,
                        expected_version,
                        pending,
                        next.node_id
                    );
                    pending = expected_version;
                }
                other => return Err(other.unexpected("write_ack")),
            }
        }
    }

    async fn forward_delete(&self, next: &ChainNode, block_id: &str) -> Result<()> {
        let session = self.session_for(next).await?;
        let message = ChainMessage::DeleteForward {
            block_id: block_id.to_string(),
        };
        match self.transport.send(&session, message).await? {
            ChainMessage::DeleteAck { .. } => Ok(()),
            other => Err(other.unexpected("delete_ack")),
        }
    }

    async fn query_committed(&self, tail: &ChainNode, block_id: &str) -> Result<u64> {
        let session = self.session_for(tail).await?;
        let message = ChainMessage::VersionQuery {
            block_id: block_id.to_string(),
        };
        let context = format!("version query for block {} to {}", block_id, tail.node_id);
        let reply = with_deadline(
            self.settings.propagation_timeout,
            context,
            self.transport.send(&session, message),
        )
        .await?;

        match reply {
            ChainMessage::VersionReply {
                latest_clean_version,
                ..
            } => Ok(latest_clean_version),
            other => Err(other.unexpected("version_reply")),
        }
    }

    async fn read_from_tail(&self, tail: &ChainNode, block_id: &str) -> Result<VersionedBlock> {
        let session = self.session_for(tail).await?;
        let message = ChainMessage::ReadForward {
            block_id: block_id.to_string(),
        };
        let context = format!("read of block {} from {}", block_id, tail.node_id);
        let reply = with_deadline(
            self.settings.propagation_timeout,
            context,
            self.transport.send(&session, message),
        )
        .await?;

        match reply {
            ChainMessage::ReadReply {
                version,
                data,
                metadata,
                ..
            } => Ok(VersionedBlock {
                version,
                data,
                metadata,
            }),
            ChainMessage::NotFound { block_id } => Err(CraqError::NotFound(block_id)),
            other => Err(other.unexpected("read_reply")),
        }
    }

    async fn accept_write(
        &self,
        block_id: String,
        version: u64,
        data: Bytes,
        metadata: Bytes,
    ) -> Result<ChainMessage> {
        validate_block_id(&block_id)?;
        if version == 0 {
            return Err(CraqError::Validation(format!(
                "block {} forwarded with version 0",
                block_id
            )));
        }
        let _guard = self.begin_mutation()?;

        let placement = self.placement().await?;
        if placement.role.is_head() {
            return Err(CraqError::Validation(format!(
                "head {} does not accept forwarded writes",
                self.local_node_id
            )));
        }
        let is_tail = placement.role.is_tail();

        let handle = match self.ledger.get(&block_id).await {
            Some(handle) => handle,
            None if version > 1 => {
                tracing::debug!("Block {} version {} arrived before 1", block_id, version);
                return Ok(ChainMessage::WriteGap {
                    block_id,
                    expected_version: 1,
                });
            }
            None => self.ledger.get_or_create(&block_id).await,
        };
        {
            let mut block = handle.write().await;
            if block.is_deleted() {
                return Err(CraqError::NotReady(format!(
                    "block {} is being deleted",
                    block_id
                )));
            }

            match block.append(version, data.clone(), metadata.clone()) {
                AppendOutcome::Gap { expected } => {
                    tracing::debug!(
                        "Block {} version {} arrived before {}",
                        block_id,
                        version,
                        expected
                    );
                    return Ok(ChainMessage::WriteGap {
                        block_id,
                        expected_version: expected,
                    });
                }
                AppendOutcome::Duplicate { clean } => {
                    if block.get(version).is_some_and(|existing| existing.data != data) {
                        return Err(CraqError::Validation(format!(
                            "conflicting data for block {} version {}",
                            block_id, version
                        )));
                    }
                    if clean || is_tail {
                        return Ok(ChainMessage::WriteAck { block_id, version });
                    }
                }
                AppendOutcome::Appended => {
                    if let Err(error) = self
                        .persist_version(&block_id, version, &data, &metadata)
                        .await
                    {
                        block.rollback(version);
                        return Err(error);
                    }
                    if is_tail {
                        block.mark_clean_through(version);
                        tracing::debug!("Tail committed block {} version {}", block_id, version);
                        return Ok(ChainMessage::WriteAck { block_id, version });
                    }
                }
            }
        }

        let Some(next) = placement.successor else {
            return Err(CraqError::Internal(format!(
                "{} has no successor but is not the tail",
                self.local_node_id
            )));
        };
        self.propagate_write(
            &handle,
            &block_id,
            version,
            &next,
            self.settings.propagation_timeout,
        )
        .await?;

        Ok(ChainMessage::WriteAck { block_id, version })
    }

    async fn accept_delete(&self, block_id: String) -> Result<ChainMessage> {
        validate_block_id(&block_id)?;
        let _guard = self.begin_mutation()?;

        let placement = self.placement().await?;
        let handle = self.ledger.get(&block_id).await;
        if let Some(handle) = &handle {
            handle.write().await.mark_deleted();
        }

        self.delete_downstream(
            &placement,
            &block_id,
            handle.as_ref(),
            self.settings.propagation_timeout,
        )
        .await?;
        Ok(ChainMessage::DeleteAck { block_id })
    }

    async fn serve_version_query(&self, block_id: String) -> ChainMessage {
        let latest_clean_version = match self.ledger.get(&block_id).await {
            Some(handle) => handle.read().await.committed_version(),
            None => 0,
        };
        ChainMessage::VersionReply {
            block_id,
            latest_clean_version,
        }
    }

    async fn serve_read_forward(&self, block_id: String) -> ChainMessage {
        let committed = match self.ledger.get(&block_id).await {
            Some(handle) => {
                let block = handle.read().await;
                block.get(block.committed_version()).cloned()
            }
            None => None,
        };

        match committed {
            Some(entry) => ChainMessage::ReadReply {
                block_id,
                version: entry.version,
                data: entry.data,
                metadata: entry.metadata,
            },
            None => ChainMessage::NotFound { block_id },
        }
    }
}

#[async_trait]
impl MessageHandler for ChainManager {
    async fn handle(&self, message: ChainMessage) -> Result<ChainMessage> {
        self.ensure_initialized()?;

        match message {
            ChainMessage::WriteForward {
                block_id,
                version,
                data,
                metadata,
            } => self.accept_write(block_id, version, data, metadata).await,
            ChainMessage::VersionQuery { block_id } => Ok(self.serve_version_query(block_id).await),
            ChainMessage::ReadForward { block_id } => Ok(self.serve_read_forward(block_id).await),
            ChainMessage::DeleteForward { block_id } => self.accept_delete(block_id).await,
            other => Err(CraqError::Protocol(format!(
                "{} is not a chain request",
                other.kind()
            ))),
        }
    }
}

/// Store envelope for a replicated version: the carried metadata when it
/// describes these bytes, otherwise one derived from them.
fn envelope_for(data: &[u8], version: u64, metadata: &[u8]) -> BlockMetadata {
    match BlockMetadata::decode(metadata) {
        Ok(envelope) if envelope.version == version && envelope.verify(data).is_ok() => envelope,
        _ => BlockMetadata::new(data, version, Utc::now()),
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    context: String,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Propagation timed out after {:?}: {}", deadline, context);
            Err(CraqError::PropagationTimeout(context))
        }
    }
}
