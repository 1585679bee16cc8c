pub mod address;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod nonce;
pub mod proxy;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod stats;
pub mod stratum;
pub mod upstream;
pub mod work;

pub use proxy::Proxy;
