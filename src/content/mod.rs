//! Content-addressed artifact store seam. Encryption and the deterministic
//! per-{identity, task} key derivation live behind the store, opaque to the
//! orchestration layer: bytes in, cid out.

pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::error::NetworkError;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String, NetworkError>;
    async fn get(&self, cid: &str) -> Result<Vec<u8>, NetworkError>;
}
