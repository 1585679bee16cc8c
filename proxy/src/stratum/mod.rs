pub mod handshake;
pub mod protocol;
pub mod server;

// Re-exports
pub use handshake::{resolve_identity, share_identity, ConnectionPhase};
pub use protocol::{LoginParams, StratumError, StratumRequest, StratumResponse, SubmitParams};
pub use server::StratumServer;
