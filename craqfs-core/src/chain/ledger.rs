use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One immutable version of a block. Only `clean` ever changes, and only
/// from `false` to `true`.
#[derive(Debug, Clone)]
pub struct BlockVersion {
    pub version: u64,
    pub data: Bytes,
    pub metadata: Bytes,
    pub timestamp: DateTime<Utc>,
    pub clean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u64,
    pub clean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The version is already present locally.
    Duplicate { clean: bool },
    /// Earlier versions are missing; `expected` is the next one this block can take.
    Gap { expected: u64 },
}

/// Version list of a single block, sorted and gap-free starting at 1.
///
/// A block being deleted carries a tombstone. Nothing may be appended to it
/// or forwarded from it until the delete either removes it from the ledger
/// or fails and clears the tombstone.
#[derive(Debug, Default)]
pub struct Block {
    versions: Vec<BlockVersion>,
    deleted: bool,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn clear_deleted(&mut self) {
        self.deleted = false;
    }

    pub fn last_version(&self) -> u64 {
        self.versions.last().map(|v| v.version).unwrap_or(0)
    }

    pub fn next_version(&self) -> u64 {
        self.last_version() + 1
    }

    pub fn latest(&self) -> Option<&BlockVersion> {
        self.versions.last()
    }

    pub fn get(&self, version: u64) -> Option<&BlockVersion> {
        self.versions
            .binary_search_by_key(&version, |v| v.version)
            .ok()
            .map(|index| &self.versions[index])
    }

    /// Highest clean version, 0 when nothing is committed yet. Clean versions
    /// always form a prefix of the list.
    pub fn committed_version(&self) -> u64 {
        self.versions
            .iter()
            .rev()
            .find(|v| v.clean)
            .map(|v| v.version)
            .unwrap_or(0)
    }

    pub fn append(&mut self, version: u64, data: Bytes, metadata: Bytes) -> AppendOutcome {
        let expected = self.next_version();

        if version > expected {
            return AppendOutcome::Gap { expected };
        }

        if version < expected {
            let clean = self.get(version).map(|v| v.clean).unwrap_or(false);
            return AppendOutcome::Duplicate { clean };
        }

        self.versions.push(BlockVersion {
            version,
            data,
            metadata,
            timestamp: Utc::now(),
            clean: false,
        });
        AppendOutcome::Appended
    }

    /// Takes back `version` if it is the newest and still dirty. Used when
    /// an appended version could not be persisted.
    pub fn rollback(&mut self, version: u64) -> bool {
        match self.versions.last() {
            Some(last) if last.version == version && !last.clean => {
                self.versions.pop();
                true
            }
            _ => false,
        }
    }

    /// Marks every dirty version `<= version` clean, lowest first, and returns
    /// the versions that changed state.
    pub fn mark_clean_through(&mut self, version: u64) -> Vec<u64> {
        let mut cleaned = Vec::new();
        for entry in self
            .versions
            .iter_mut()
            .take_while(|entry| entry.version <= version)
        {
            if !entry.clean {
                entry.clean = true;
                cleaned.push(entry.version);
            }
        }
        cleaned
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.versions.iter().filter(|v| !v.clean).count()
    }

    pub fn summary(&self) -> Vec<VersionSummary> {
        self.versions
            .iter()
            .map(|v| VersionSummary {
                version: v.version,
                clean: v.clean,
            })
            .collect()
    }
}

pub type BlockHandle = Arc<RwLock<Block>>;

/// Block id map. The map lock is only held for lookups and membership
/// changes; per-block work happens under the block's own lock.
#[derive(Default)]
pub struct BlockLedger {
    blocks: RwLock<HashMap<String, BlockHandle>>,
}

impl BlockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, block_id: &str) -> Option<BlockHandle> {
        self.blocks.read().await.get(block_id).cloned()
    }

    pub async fn get_or_create(&self, block_id: &str) -> BlockHandle {
        if let Some(handle) = self.get(block_id).await {
            return handle;
        }

        let mut blocks = self.blocks.write().await;
        blocks
            .entry(block_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Block::new())))
            .clone()
    }

    /// Removes the entry for `block_id` only if it is still `handle`, so a
    /// block recreated after a delete is left alone.
    pub async fn remove_handle(&self, block_id: &str, handle: &BlockHandle) -> bool {
        let mut blocks = self.blocks.write().await;
        match blocks.get(block_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                blocks.remove(block_id);
                true
            }
            _ => false,
        }
    }

    /// Handles of every block at this instant.
    pub async fn handles(&self) -> Vec<BlockHandle> {
        self.blocks.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: &str) -> (Bytes, Bytes) {
        (Bytes::from(tag.to_string()), Bytes::from_static(b"{}"))
    }

    #[test]
    fn test_append_is_gap_free() {
        let mut block = Block::new();
        assert_eq!(block.last_version(), 0);

        let (data, meta) = payload("v1");
        assert_eq!(block.append(1, data, meta), AppendOutcome::Appended);

        let (data, meta) = payload("v3");
        assert_eq!(
            block.append(3, data, meta),
            AppendOutcome::Gap { expected: 2 }
        );

        let (data, meta) = payload("v1 again");
        assert_eq!(
            block.append(1, data, meta),
            AppendOutcome::Duplicate { clean: false }
        );

        let (data, meta) = payload("v2");
        assert_eq!(block.append(2, data, meta), AppendOutcome::Appended);
        assert_eq!(block.last_version(), 2);
        assert_eq!(block.get(1).unwrap().data, Bytes::from("v1"));
        assert!(block.get(3).is_none());
    }

    #[test]
    fn test_mark_clean_is_ordered_and_monotone() {
        let mut block = Block::new();
        for version in 1..=4 {
            let (data, meta) = payload(&format!("v{}", version));
            block.append(version, data, meta);
        }
        assert_eq!(block.dirty_count(), 4);
        assert_eq!(block.committed_version(), 0);

        assert_eq!(block.mark_clean_through(2), vec![1, 2]);
        assert_eq!(block.committed_version(), 2);

        // an older ack never un-cleans anything
        assert!(block.mark_clean_through(1).is_empty());
        assert_eq!(block.committed_version(), 2);

        assert_eq!(block.mark_clean_through(10), vec![3, 4]);
        assert_eq!(block.dirty_count(), 0);
        assert!(block.summary().iter().all(|s| s.clean));
    }

    #[test]
    fn test_duplicate_reports_clean_state() {
        let mut block = Block::new();
        let (data, meta) = payload("v1");
        block.append(1, data.clone(), meta.clone());
        block.mark_clean_through(1);
        assert_eq!(
            block.append(1, data, meta),
            AppendOutcome::Duplicate { clean: true }
        );
    }

    #[tokio::test]
    async fn test_ledger_membership() {
        let ledger = BlockLedger::new();
        assert!(ledger.get("a").await.is_none());

        let first = ledger.get_or_create("a").await;
        let again = ledger.get_or_create("a").await;
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(ledger.handles().await.len(), 1);

        assert!(ledger.remove_handle("a", &first).await);
        assert!(ledger.get("a").await.is_none());
        assert!(ledger.handles().await.is_empty());

        let fresh = ledger.get_or_create("a").await;
        assert_eq!(fresh.read().await.last_version(), 0);

        // a stale handle never evicts its replacement
        assert!(!ledger.remove_handle("a", &first).await);
        assert!(Arc::ptr_eq(&ledger.get("a").await.unwrap(), &fresh));
    }

    #[test]
    fn test_rollback_only_takes_back_dirty_tail() {
        let mut block = Block::new();
        let (data, meta) = payload("v1");
        block.append(1, data, meta);
        block.mark_clean_through(1);
        let (data, meta) = payload("v2");
        block.append(2, data, meta);

        assert!(!block.rollback(1));
        assert!(block.rollback(2));
        assert_eq!(block.last_version(), 1);
        assert!(!block.rollback(1));
        assert_eq!(block.committed_version(), 1);
    }

    #[test]
    fn test_tombstone_can_be_cleared() {
        let mut block = Block::new();
        assert!(!block.is_deleted());
        block.mark_deleted();
        assert!(block.is_deleted());
        block.clear_deleted();
        assert!(!block.is_deleted());
    }
}
