pub mod acquire;
pub mod cache;
pub mod config;
pub mod error;
pub mod security;
pub mod store;
pub mod token_endpoint;
pub mod utils;

pub use acquire::{AccessToken, TokenBroker};
pub use cache::UserIdentity;
pub use error::{AcquisitionFailure, BrokerError};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
