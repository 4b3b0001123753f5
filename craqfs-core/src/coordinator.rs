use crate::chain::{ChainManager, ChainStats};
use crate::error::{CraqError, Result};
use crate::storage::{BlockMetadata, LocalBlockStore, WriteOutcome, validate_block_id};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub used_space_bytes: u64,
    pub capacity_bytes: u64,
    pub cached_blocks: usize,
    pub chain: Option<ChainStats>,
}

impl NodeStats {
    /// Flat metrics map; chain figures use the `craq_` prefix.
    pub fn metrics(&self) -> BTreeMap<String, u64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("used_space_bytes".to_string(), self.used_space_bytes);
        metrics.insert("capacity_bytes".to_string(), self.capacity_bytes);
        metrics.insert("cached_blocks".to_string(), self.cached_blocks as u64);

        if let Some(chain) = &self.chain {
            metrics.insert("craq_node_count".to_string(), chain.node_count as u64);
            metrics.insert("craq_block_count".to_string(), chain.block_count as u64);
            metrics.insert(
                "craq_total_versions".to_string(),
                chain.total_versions as u64,
            );
            metrics.insert(
                "craq_dirty_versions".to_string(),
                chain.dirty_versions as u64,
            );
        }
        metrics
    }
}

/// Entry point for block operations on one node. Routes through the chain
/// when one is configured and keeps the local store in step either way.
pub struct BlockCoordinator {
    store: Arc<LocalBlockStore>,
    chain: Option<Arc<ChainManager>>,
}

impl BlockCoordinator {
    pub fn new(store: Arc<LocalBlockStore>, chain: Option<Arc<ChainManager>>) -> Self {
        Self { store, chain }
    }

    pub fn store(&self) -> &Arc<LocalBlockStore> {
        &self.store
    }

    pub fn chain(&self) -> Option<&Arc<ChainManager>> {
        self.chain.as_ref()
    }

    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        if let Some(chain) = &self.chain {
            chain.initialize().await?;
        }
        Ok(())
    }

    pub async fn write_block(&self, block_id: &str, data: Bytes) -> Result<BlockMetadata> {
        validate_block_id(block_id)?;
        let now = Utc::now();
        let stored = self.store.read_block_metadata(block_id).await?;

        let metadata = match &self.chain {
            Some(chain) => {
                let hashed = data.clone();
                let receipt = chain
                    .write_with(block_id, data.clone(), move |version, previous| {
                        let previous = previous
                            .and_then(|bytes| BlockMetadata::decode(bytes).ok())
                            .or(stored);
                        next_metadata(&hashed, version, previous, now).encode()
                    })
                    .await?;
                BlockMetadata::decode(&receipt.metadata)?
            }
            None => {
                let version = stored.as_ref().map(|m| m.version + 1).unwrap_or(1);
                next_metadata(&data, version, stored, now)
            }
        };

        if let WriteOutcome::Superseded { stored_version } = self
            .store
            .write_block(block_id, data, &metadata)
            .await?
        {
            tracing::debug!(
                "Local copy of block {} already at version {}, skipped {}",
                block_id,
                stored_version,
                metadata.version
            );
        }

        Ok(metadata)
    }

    pub async fn read_block(&self, block_id: &str) -> Result<Bytes> {
        validate_block_id(block_id)?;

        if let Some(chain) = &self.chain {
            match chain.read(block_id).await {
                Ok(block) => return Ok(block.data),
                Err(error) if error.is_not_found() => {
                    tracing::debug!("Block {} not in chain, reading local store", block_id);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(self.store.read_block(block_id).await?.data)
    }

    pub async fn read_block_metadata(&self, block_id: &str) -> Result<BlockMetadata> {
        validate_block_id(block_id)?;

        if let Some(chain) = &self.chain {
            match chain.read(block_id).await {
                Ok(block) => return BlockMetadata::decode(&block.metadata),
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }

        self.store
            .read_block_metadata(block_id)
            .await?
            .ok_or_else(|| CraqError::NotFound(block_id.to_string()))
    }

    /// Deletes through the chain, then locally. The local leg runs even when
    /// the chain leg fails after reaching the chain.
    pub async fn delete_block(&self, block_id: &str) -> Result<()> {
        validate_block_id(block_id)?;

        let mut chain_error = None;
        if let Some(chain) = &self.chain {
            match chain.delete(block_id).await {
                Ok(()) => {}
                Err(
                    error @ (CraqError::NotHead { .. }
                    | CraqError::ShuttingDown
                    | CraqError::NotReady(_)),
                ) => return Err(error),
                Err(error) => chain_error = Some(error),
            }
        }

        let existed = self.store.contains(block_id).await?;
        let local_result = self.store.delete_block(block_id).await;

        if let Some(error) = chain_error {
            if let Err(local_error) = &local_result {
                tracing::warn!("Local delete of block {} failed: {}", block_id, local_error);
            }
            return Err(error);
        }
        local_result?;

        if self.chain.is_none() && !existed {
            return Err(CraqError::NotFound(block_id.to_string()));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let chain = match &self.chain {
            Some(chain) => Some(chain.stats().await),
            None => None,
        };

        Ok(NodeStats {
            used_space_bytes: self.store.used_space().await?,
            capacity_bytes: self.store.capacity_bytes(),
            cached_blocks: self.store.cached_blocks().await,
            chain,
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(chain) = &self.chain {
            chain.shutdown().await?;
        }
        self.store.flush().await
    }
}

fn next_metadata(
    data: &[u8],
    version: u64,
    previous: Option<BlockMetadata>,
    now: DateTime<Utc>,
) -> BlockMetadata {
    match previous {
        Some(previous) => previous.successor(data, version, now),
        None => BlockMetadata::new(data, version, now),
    }
}
