//! Error types for the connections manager.

use thiserror::Error;

/// Failures surfaced from config-store load/save (§4.C).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is corrupt: {0}")]
    Corrupt(String),

    #[error("config checksum mismatch")]
    ChecksumMismatch,

    #[error("config version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Failures from the datacenter's protocol state machine (§4.D).
#[derive(Debug, Error)]
pub enum DatacenterError {
    #[error("no usable auth key for connection class {0:?}")]
    NoAuthKey(crate::connection::ConnectionClass),

    #[error("handshake already in progress for this key slot")]
    HandshakeInProgress,

    #[error("MAC verification failed while decrypting server response")]
    MacMismatch,

    #[error("salt pool is empty")]
    NoSalt,
}

/// The logical RPC error surfaced to a request's completion callback,
/// mirroring the wire `rpc_error` constructor (§3, §4.G response table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub text: String,
}

impl RpcError {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    /// Fabricated retry-limit exhaustion error (§4.G Phase 1, §7).
    pub fn retry_limit() -> Self {
        Self::new(-123, "RETRY_LIMIT")
    }

    /// Fabricated cancellation-during-cleanup error (§7).
    pub fn cancelled_by_cleanup() -> Self {
        Self::new(-1000, "")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.text)
    }
}

impl std::error::Error for RpcError {}
