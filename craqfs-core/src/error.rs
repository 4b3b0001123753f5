use thiserror::Error;

pub type Result<T> = std::result::Result<T, CraqError>;

#[derive(Error, Debug)]
pub enum CraqError {
    #[error("Chain is full: configured length is {0}")]
    ChainFull(usize),

    #[error("Chain has no nodes")]
    EmptyChain,

    #[error("Block not found: {0}")]
    NotFound(String),

    #[error("Block not ready: {0}")]
    NotReady(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Propagation timed out: {0}")]
    PropagationTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not the chain head, writes must originate at {head_id} ({head_address})")]
    NotHead {
        head_id: String,
        head_address: String,
    },

    #[error("Capacity exceeded: need {required} bytes, {available} available")]
    CapacityExceeded { required: u64, available: u64 },

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CraqError {
    /// Stable code and detail used when an error crosses the wire as a
    /// `Failure` reply.
    pub fn wire_parts(&self) -> (&'static str, String) {
        match self {
            Self::NotFound(detail) => ("not_found", detail.clone()),
            Self::NotReady(detail) => ("not_ready", detail.clone()),
            Self::PeerUnreachable(detail) => ("peer_unreachable", detail.clone()),
            Self::PropagationTimeout(detail) => ("propagation_timeout", detail.clone()),
            Self::Validation(detail) => ("validation", detail.clone()),
            Self::ShuttingDown => ("shutting_down", self.to_string()),
            Self::ChecksumMismatch { .. } => ("checksum_mismatch", self.to_string()),
            Self::CapacityExceeded { .. } => ("capacity_exceeded", self.to_string()),
            Self::Io(_) => ("io", self.to_string()),
            _ => ("internal", self.to_string()),
        }
    }

    /// Rebuilds an error received from a peer.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "not_found" => Self::NotFound(message),
            "not_ready" => Self::NotReady(message),
            "peer_unreachable" => Self::PeerUnreachable(message),
            "propagation_timeout" => Self::PropagationTimeout(message),
            "validation" => Self::Validation(message),
            "shutting_down" => Self::ShuttingDown,
            "io" => Self::Io(std::io::Error::other(message)),
            _ => Self::Protocol(format!("remote {} failure: {}", code, message)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
