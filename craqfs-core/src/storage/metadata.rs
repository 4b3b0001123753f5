use crate::error::{CraqError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata envelope stored next to every block as `<id>.meta` and carried
/// with every replicated version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub checksum: String,
    pub size: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl BlockMetadata {
    pub fn new(data: &[u8], version: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            checksum: compute_hash(data),
            size: data.len() as u64,
            version,
            created_at,
            last_modified: created_at,
        }
    }

    /// Metadata for a later version of the same block: keeps `created_at`.
    pub fn successor(&self, data: &[u8], version: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            checksum: compute_hash(data),
            size: data.len() as u64,
            version,
            created_at: self.created_at,
            last_modified: modified_at,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn verify(&self, data: &[u8]) -> Result<()> {
        verify_hash(data, &self.checksum)
    }
}

/// Compute SHA256 hash of data.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify data hash.
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual = compute_hash(data);
    if actual != expected_hash {
        return Err(CraqError::ChecksumMismatch {
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(())
}
