use crate::error::{CraqError, Result};
use crate::storage::metadata::BlockMetadata;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

pub const SHARD_COUNT: usize = 256;

const METADATA_SUFFIX: &str = ".meta";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub data: Bytes,
    pub metadata: BlockMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Disk already holds a newer version; nothing was written.
    Superseded { stored_version: u64 },
}

/// LocalBlockStore keeps the latest bytes of every block on local media:
/// `{data_path}/{shard}/{block_id}` plus a `{block_id}.meta` JSON sidecar.
///
/// A single map-wide lock guards the read-through cache and serialises
/// mutations, so a reader never observes a data file without its sidecar.
pub struct LocalBlockStore {
    data_path: PathBuf,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    cache: RwLock<HashMap<String, Bytes>>,
}

impl LocalBlockStore {
    pub fn new(data_path: PathBuf, capacity_bytes: u64) -> Result<Self> {
        if data_path.as_os_str().is_empty() {
            return Err(CraqError::Validation(
                "data path cannot be empty".to_string(),
            ));
        }

        if capacity_bytes == 0 {
            return Err(CraqError::Validation(
                "capacity must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            data_path,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Bytes currently accounted against the capacity limit.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    /// Creates the data directory and all shard directories, then seeds usage
    /// accounting from what is already on disk.
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.data_path).await?;
        for shard in 0..SHARD_COUNT {
            fs::create_dir_all(self.data_path.join(format!("{:02x}", shard))).await?;
        }

        let used = self.used_space().await?;
        self.used_bytes.store(used, Ordering::SeqCst);

        tracing::info!(
            "Initialized block store at {:?} ({} shards, {} bytes used)",
            self.data_path,
            SHARD_COUNT,
            used
        );
        Ok(())
    }

    /// Stages the data file, writes its sidecar, then moves the data into
    /// place. A write carrying a lower version than the one on disk is
    /// skipped.
    pub async fn write_block(
        &self,
        block_id: &str,
        data: Bytes,
        metadata: &BlockMetadata,
    ) -> Result<WriteOutcome> {
        self.store_block(block_id, data, metadata, true).await
    }

    /// Like `write_block`, but overwrites whatever version is on disk.
    pub async fn replace_block(
        &self,
        block_id: &str,
        data: Bytes,
        metadata: &BlockMetadata,
    ) -> Result<()> {
        self.store_block(block_id, data, metadata, false).await?;
        Ok(())
    }

    async fn store_block(
        &self,
        block_id: &str,
        data: Bytes,
        metadata: &BlockMetadata,
        keep_newer: bool,
    ) -> Result<WriteOutcome> {
        validate_block_id(block_id)?;

        let block_path = self.block_path(block_id);
        let metadata_path = self.metadata_path(block_id);
        let encoded = serde_json::to_vec(metadata)?;

        let mut cache = self.cache.write().await;

        let stored = if keep_newer {
            read_optional(&metadata_path).await?
        } else {
            None
        };
        if let Some(stored) = stored {
            match BlockMetadata::decode(&stored) {
                Ok(stored) if stored.version > metadata.version => {
                    return Ok(WriteOutcome::Superseded {
                        stored_version: stored.version,
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        "Overwriting unreadable metadata for block {}: {}",
                        block_id,
                        error
                    );
                }
            }
        }

        let previous = file_len(&block_path).await? + file_len(&metadata_path).await?;
        let incoming = data.len() as u64 + encoded.len() as u64;
        let baseline = self.used_bytes().saturating_sub(previous);
        if baseline + incoming > self.capacity_bytes {
            return Err(CraqError::CapacityExceeded {
                required: incoming,
                available: self.capacity_bytes.saturating_sub(baseline),
            });
        }

        if let Some(parent) = block_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // The new data stays staged until its sidecar is in place, so a failed
        // sidecar write leaves any earlier version whole.
        let staged = stage_file(&block_path, &data).await?;

        if let Err(error) = write_atomic(&metadata_path, &encoded).await {
            discard_staged(&staged).await;
            tracing::warn!(
                "Metadata write for block {} failed, data file removed: {}",
                block_id,
                error
            );
            return Err(error);
        }

        if let Err(error) = fs::rename(&staged, &block_path).await {
            discard_staged(&staged).await;
            // the sidecar now describes bytes that never landed
            for path in [&block_path, &metadata_path] {
                if let Err(cleanup) = fs::remove_file(path).await {
                    if cleanup.kind() != ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", path.display(), cleanup);
                    }
                }
            }
            cache.remove(block_id);
            self.used_bytes
                .fetch_sub(previous.min(self.used_bytes()), Ordering::SeqCst);
            return Err(error.into());
        }

        self.used_bytes.store(baseline + incoming, Ordering::SeqCst);
        cache.insert(block_id.to_string(), data);

        tracing::debug!(
            "Stored block {} version {} ({} bytes)",
            block_id,
            metadata.version,
            metadata.size
        );
        Ok(WriteOutcome::Written)
    }

    pub async fn read_block(&self, block_id: &str) -> Result<StoredBlock> {
        validate_block_id(block_id)?;

        {
            let cache = self.cache.read().await;
            if let Some(data) = cache.get(block_id).cloned() {
                let Some(metadata) = self.read_block_metadata(block_id).await? else {
                    return Err(CraqError::NotFound(block_id.to_string()));
                };

                if metadata.verify(&data).is_ok() {
                    return Ok(StoredBlock { data, metadata });
                }

                tracing::debug!("Cache entry for block {} is stale", block_id);
            }
        }

        let mut cache = self.cache.write().await;

        let Some(data) = read_optional(&self.block_path(block_id)).await? else {
            cache.remove(block_id);
            return Err(CraqError::NotFound(block_id.to_string()));
        };

        let Some(metadata) = self.read_block_metadata(block_id).await? else {
            cache.remove(block_id);
            return Err(CraqError::NotFound(block_id.to_string()));
        };

        let data = Bytes::from(data);
        if let Err(error) = metadata.verify(&data) {
            cache.remove(block_id);
            tracing::warn!("Block {} failed checksum verification", block_id);
            return Err(error);
        }

        cache.insert(block_id.to_string(), data.clone());
        Ok(StoredBlock { data, metadata })
    }

    /// `Ok(None)` means the block does not exist; that is not an error.
    pub async fn read_block_metadata(&self, block_id: &str) -> Result<Option<BlockMetadata>> {
        validate_block_id(block_id)?;

        match read_optional(&self.metadata_path(block_id)).await? {
            Some(bytes) => Ok(Some(BlockMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes both files and the cache entry. Missing files are fine.
    pub async fn delete_block(&self, block_id: &str) -> Result<()> {
        validate_block_id(block_id)?;

        let mut cache = self.cache.write().await;

        let mut released = 0u64;
        for path in [self.block_path(block_id), self.metadata_path(block_id)] {
            let len = file_len(&path).await?;
            match fs::remove_file(&path).await {
                Ok(()) => released += len,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        cache.remove(block_id);
        self.used_bytes
            .fetch_sub(released.min(self.used_bytes()), Ordering::SeqCst);

        tracing::debug!("Deleted block {} ({} bytes released)", block_id, released);
        Ok(())
    }

    pub async fn contains(&self, block_id: &str) -> Result<bool> {
        validate_block_id(block_id)?;
        Ok(fs::try_exists(self.block_path(block_id)).await?
            || fs::try_exists(self.metadata_path(block_id)).await?)
    }

    /// Drops the whole cache. Disk state is untouched.
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        tracing::debug!("Flushed {} cached blocks", dropped);
        Ok(())
    }

    pub async fn cached_blocks(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Recursive walk summing the size of every file under the data path.
    pub async fn used_space(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.data_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    total += entry.metadata().await?.len();
                }
            }
        }

        Ok(total)
    }

    pub fn block_path(&self, block_id: &str) -> PathBuf {
        self.data_path.join(shard_for(block_id)).join(block_id)
    }

    pub fn metadata_path(&self, block_id: &str) -> PathBuf {
        self.data_path
            .join(shard_for(block_id))
            .join(format!("{}{}", block_id, METADATA_SUFFIX))
    }
}

/// Shard directory for a block id, keyed by its first two characters.
/// Ids shorter than two characters use the `00` prefix. Hex prefixes name
/// their shard directly; anything else is folded onto the 256 shards.
pub fn shard_for(block_id: &str) -> String {
    let prefix: String = if block_id.chars().count() < 2 {
        "00".to_string()
    } else {
        block_id.chars().take(2).collect()
    };

    if prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return prefix.to_ascii_lowercase();
    }

    let digest = Sha256::digest(prefix.as_bytes());
    format!("{:02x}", digest[0])
}

pub fn validate_block_id(block_id: &str) -> Result<()> {
    if block_id.is_empty() {
        return Err(CraqError::Validation(
            "block id cannot be empty".to_string(),
        ));
    }

    if block_id == "." || block_id == ".." || block_id.contains(['/', '\\', '\0']) {
        return Err(CraqError::Validation(format!(
            "invalid block id: {}",
            block_id
        )));
    }

    if block_id.ends_with(METADATA_SUFFIX) || block_id.ends_with(TEMP_SUFFIX) {
        return Err(CraqError::Validation(format!(
            "block id uses a reserved suffix: {}",
            block_id
        )));
    }

    Ok(())
}

/// Writes `bytes` to a unique temporary file next to `path` and returns it.
async fn stage_file(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp_path = path.with_extension(format!("{}{}", ulid::Ulid::new(), TEMP_SUFFIX));

    let written: Result<()> = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    match written {
        Ok(()) => Ok(tmp_path),
        Err(error) => {
            discard_staged(&tmp_path).await;
            Err(error)
        }
    }
}

async fn discard_staged(tmp_path: &Path) {
    if let Err(error) = fs::remove_file(tmp_path).await {
        if error.kind() != ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", tmp_path.display(), error);
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = stage_file(path, bytes).await?;
    if let Err(error) = fs::rename(&tmp_path, path).await {
        discard_staged(&tmp_path).await;
        return Err(error.into());
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

async fn file_len(path: &Path) -> Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(0),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn open_store(dir: &tempfile::TempDir, capacity: u64) -> LocalBlockStore {
        let store = LocalBlockStore::new(dir.path().join("data"), capacity).unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn meta_for(data: &[u8], version: u64) -> BlockMetadata {
        BlockMetadata::new(data, version, Utc::now())
    }

    #[tokio::test]
    async fn test_block_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let body = Bytes::from("hello");
        let meta = meta_for(&body, 1);
        let outcome = store.write_block("abc123", body.clone(), &meta).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(dir.path().join("data/ab/abc123").exists());
        assert!(dir.path().join("data/ab/abc123.meta").exists());

        let read = store.read_block("abc123").await.unwrap();
        assert_eq!(read.data, body);
        assert_eq!(read.metadata, meta);

        // cache hit still consults disk metadata
        store.flush().await.unwrap();
        assert_eq!(store.cached_blocks().await, 0);
        let read = store.read_block("abc123").await.unwrap();
        assert_eq!(read.data, body);
        assert_eq!(store.cached_blocks().await, 1);

        let meta = store.read_block_metadata("abc123").await.unwrap().unwrap();
        assert_eq!(meta.checksum, crate::compute_hash(b"hello"));
        assert!(store.read_block_metadata("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_creates_all_shards() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open_store(&dir, 1024).await;

        for shard in ["00", "7f", "ff"] {
            assert!(dir.path().join("data").join(shard).is_dir());
        }
        let mut count = 0;
        for entry in std::fs::read_dir(dir.path().join("data")).unwrap() {
            if entry.unwrap().file_type().unwrap().is_dir() {
                count += 1;
            }
        }
        assert_eq!(count, SHARD_COUNT);
    }

    #[test]
    fn test_shard_selection() {
        assert_eq!(shard_for("a"), "00");
        assert_eq!(shard_for("a"), shard_for("00a"));
        assert_eq!(shard_for("AB12"), "ab");
        assert_eq!(shard_for("blk"), shard_for("bl-other"));
        assert_eq!(shard_for("blk").len(), 2);
        assert!(u8::from_str_radix(&shard_for("zz"), 16).is_ok());
        assert!(u8::from_str_radix(&shard_for("é"), 16).is_ok());
    }

    #[tokio::test]
    async fn test_short_block_id_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let body = Bytes::from_static(b"tiny");
        store
            .write_block("a", body.clone(), &meta_for(&body, 1))
            .await
            .unwrap();
        assert!(dir.path().join("data/00/a").exists());

        store.flush().await.unwrap();
        assert_eq!(store.read_block("a").await.unwrap().data, body);
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let body = Bytes::from_static(b"original bytes");
        store
            .write_block("c0ffee", body.clone(), &meta_for(&body, 1))
            .await
            .unwrap();

        std::fs::write(store.block_path("c0ffee"), b"corrupted bytes").unwrap();
        store.flush().await.unwrap();

        let result = store.read_block("c0ffee").await;
        assert!(matches!(result, Err(CraqError::ChecksumMismatch { .. })));
        assert_eq!(store.cached_blocks().await, 0);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let old = Bytes::from_static(b"old");
        store
            .write_block("beef", old.clone(), &meta_for(&old, 1))
            .await
            .unwrap();

        let new = b"new contents";
        std::fs::write(store.block_path("beef"), new).unwrap();
        std::fs::write(
            store.metadata_path("beef"),
            serde_json::to_vec(&meta_for(new, 2)).unwrap(),
        )
        .unwrap();

        let read = store.read_block("beef").await.unwrap();
        assert_eq!(read.data.as_ref(), new);
        assert_eq!(read.metadata.version, 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let body = Bytes::from_static(b"to be removed");
        store
            .write_block("dead01", body.clone(), &meta_for(&body, 1))
            .await
            .unwrap();
        assert!(store.contains("dead01").await.unwrap());

        store.delete_block("dead01").await.unwrap();
        store.delete_block("dead01").await.unwrap();

        assert!(!store.contains("dead01").await.unwrap());
        assert!(matches!(
            store.read_block("dead01").await,
            Err(CraqError::NotFound(_))
        ));
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_older_version_is_superseded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;

        let v2 = Bytes::from_static(b"second");
        store.write_block("ab", v2.clone(), &meta_for(&v2, 2)).await.unwrap();

        let v1 = Bytes::from_static(b"first");
        let outcome = store.write_block("ab", v1, &meta_for(b"first", 1)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Superseded { stored_version: 2 });
        assert_eq!(store.read_block("ab").await.unwrap().data, v2);

        let restarted = Bytes::from_static(b"restarted");
        store
            .replace_block("ab", restarted.clone(), &meta_for(&restarted, 1))
            .await
            .unwrap();
        let stored = store.read_block("ab").await.unwrap();
        assert_eq!(stored.data, restarted);
        assert_eq!(stored.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit_and_usage() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 400).await;

        let body = Bytes::from(vec![7u8; 100]);
        store
            .write_block("aa", body.clone(), &meta_for(&body, 1))
            .await
            .unwrap();
        assert_eq!(store.used_bytes(), store.used_space().await.unwrap());

        // rewriting the same block reuses its allowance
        store
            .write_block("aa", body.clone(), &meta_for(&body, 2))
            .await
            .unwrap();

        let big = Bytes::from(vec![1u8; 300]);
        let result = store.write_block("bb", big.clone(), &meta_for(&big, 1)).await;
        assert!(matches!(result, Err(CraqError::CapacityExceeded { .. })));
        assert!(!store.contains("bb").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_sidecar_write_leaves_no_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1 << 20).await;
        let before = store.used_bytes();

        // a directory squatting on the sidecar path makes its rename fail
        let metadata_path = store.metadata_path("blk");
        fs::create_dir_all(&metadata_path).await.unwrap();

        let body = Bytes::from_static(b"payload");
        let result = store
            .replace_block("blk", body.clone(), &meta_for(&body, 1))
            .await;
        assert!(matches!(result, Err(CraqError::Io(_))));
        assert!(!fs::try_exists(store.block_path("blk")).await.unwrap());
        assert_eq!(store.used_bytes(), before);
        assert_eq!(store.cached_blocks().await, 0);

        let shard_dir = metadata_path.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(shard_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("blk.meta")]);
        assert!(matches!(
            store.read_block("blk").await,
            Err(CraqError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_block_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1024).await;
        let body = Bytes::from_static(b"x");

        for id in ["", "..", "a/b", "a\\b", "abc.meta", "abc.tmp"] {
            let result = store.write_block(id, body.clone(), &meta_for(&body, 1)).await;
            assert!(matches!(result, Err(CraqError::Validation(_))), "id {:?}", id);
        }
    }

    #[test]
    fn test_new_validates_arguments() {
        assert!(LocalBlockStore::new(PathBuf::new(), 10).is_err());
        assert!(LocalBlockStore::new(PathBuf::from("/tmp/x"), 0).is_err());
    }
}
