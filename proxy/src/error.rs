/// Error types shared across the proxy

use thiserror::Error;

use crate::address::AddressError;
use crate::nonce::AllocatorError;
use crate::stratum::protocol::StratumError;

/// Fatal configuration problems. `main` prints these and exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address '{0}': {1}")]
    ListenAddress(String, String),
    #[error("listen address '{0}' must carry a non-zero port")]
    MissingPort(String),
    #[error("invalid daemon address '{0}': {1}")]
    DaemonAddress(String, String),
    #[error("invalid wallet address '{0}': {1}")]
    Wallet(String, AddressError),
    #[error("nonce prefix bits must be within 1..=8, got {0}")]
    PrefixBits(u8),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid API listen address '{0}': {1}")]
    ApiAddress(String, String),
}

/// Why a share was not forwarded or not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("invalid submit params: {0}")]
    InvalidParams(String),
    #[error("unknown job id '{0}'")]
    UnknownJob(String),
    #[error("stale share for template {submitted} (current {current})")]
    Stale { submitted: u64, current: u64 },
    #[error("duplicate share")]
    Duplicate,
    #[error("rejected by daemon: {0}")]
    Rejected(String),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

impl ShareError {
    /// Error object sent back to the miner.
    pub fn to_stratum(&self) -> StratumError {
        let code = match self {
            ShareError::InvalidParams(_) => StratumError::INVALID_PARAMS,
            ShareError::UnknownJob(_) | ShareError::Stale { .. } => StratumError::JOB_NOT_FOUND,
            ShareError::Duplicate => StratumError::DUPLICATE_SHARE,
            ShareError::Rejected(_) => StratumError::LOW_DIFFICULTY,
            ShareError::Unavailable(_) => StratumError::INTERNAL_ERROR,
        };
        StratumError::new(code, self.to_string())
    }

    /// Rejected locally, never reached the daemon.
    pub fn is_local(&self) -> bool {
        !matches!(self, ShareError::Rejected(_) | ShareError::Unavailable(_))
    }
}

/// Session-local handshake failures; the connection is closed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no login within {0}s")]
    Timeout(u64),
    #[error("connection closed before login")]
    Closed,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("expected login, got '{0}'")]
    NotLogin(String),
    #[error("invalid identity: {0}")]
    Identity(#[from] AddressError),
    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),
}

impl HandshakeError {
    pub fn to_stratum(&self) -> StratumError {
        match self {
            HandshakeError::Identity(_) => StratumError::new(StratumError::UNAUTHORIZED, self.to_string()),
            HandshakeError::NotLogin(_) => StratumError::new(StratumError::INVALID_METHOD, self.to_string()),
            HandshakeError::Malformed(_) => StratumError::invalid_params(self.to_string()),
            _ => StratumError::new(StratumError::INTERNAL_ERROR, self.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session id {0} already registered")]
    DuplicateId(u64),
    #[error("partitions exhausted: {0}")]
    Partitions(#[from] AllocatorError),
}
