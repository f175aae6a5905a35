mod client;
mod error;
mod models;
mod pool;

#[cfg(test)]
pub use client::MockAviClient;
pub use client::{AviClient, AviClientConfig, DEFAULT_AVI_TIMEOUT, RestAviClient, base_url};
pub use error::{AviError, AviResult};
pub use models::*;
pub use pool::AviClientPool;
