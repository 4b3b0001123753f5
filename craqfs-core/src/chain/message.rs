use crate::error::{CraqError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages exchanged between chain nodes. Every exchange is a request and
/// a single reply on the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainMessage {
    WriteForward {
        block_id: String,
        version: u64,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        #[serde(with = "base64_bytes")]
        metadata: Bytes,
    },
    WriteAck {
        block_id: String,
        version: u64,
    },
    /// The receiver is missing versions before the forwarded one.
    WriteGap {
        block_id: String,
        expected_version: u64,
    },
    VersionQuery {
        block_id: String,
    },
    VersionReply {
        block_id: String,
        latest_clean_version: u64,
    },
    ReadForward {
        block_id: String,
    },
    ReadReply {
        block_id: String,
        version: u64,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        #[serde(with = "base64_bytes")]
        metadata: Bytes,
    },
    DeleteForward {
        block_id: String,
    },
    DeleteAck {
        block_id: String,
    },
    NotFound {
        block_id: String,
    },
    Failure {
        code: String,
        message: String,
    },
}

impl ChainMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WriteForward { .. } => "write_forward",
            Self::WriteAck { .. } => "write_ack",
            Self::WriteGap { .. } => "write_gap",
            Self::VersionQuery { .. } => "version_query",
            Self::VersionReply { .. } => "version_reply",
            Self::ReadForward { .. } => "read_forward",
            Self::ReadReply { .. } => "read_reply",
            Self::DeleteForward { .. } => "delete_forward",
            Self::DeleteAck { .. } => "delete_ack",
            Self::NotFound { .. } => "not_found",
            Self::Failure { .. } => "failure",
        }
    }

    pub fn failure(error: &CraqError) -> Self {
        let (code, message) = error.wire_parts();
        Self::Failure {
            code: code.to_string(),
            message,
        }
    }

    /// Turns a `Failure` reply back into the error it carries.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Failure { code, message } => Err(CraqError::from_wire(&code, message)),
            other => Ok(other),
        }
    }

    pub fn unexpected(self, expected: &str) -> CraqError {
        CraqError::Protocol(format!(
            "expected {} reply, got {}",
            expected,
            self.kind()
        ))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
