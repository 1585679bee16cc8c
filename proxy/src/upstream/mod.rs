pub mod client;
pub mod rpc_client;

pub use client::{Backoff, UpstreamClient, UpstreamHandle};
pub use rpc_client::{DaemonClient, JsonRpcDaemon, ShareSubmission, SubmitOutcome};
