//! In-memory content store for tests and shadow runs. Addresses are the
//! keccak digest of the content, hex-encoded with a short prefix.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::keccak256;
use async_trait::async_trait;

use crate::error::NetworkError;

use super::ContentStore;

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        match self.blobs.lock() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, NetworkError> {
        let cid = format!("mem-{:x}", keccak256(bytes));
        let mut blobs = match self.blobs.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        blobs.insert(cid.clone(), bytes.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, NetworkError> {
        let blobs = match self.blobs.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        blobs
            .get(cid)
            .cloned()
            .ok_or_else(|| NetworkError::Transport(format!("content not found: {cid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentStore;

    #[tokio::test]
    async fn test_put_get_round_trip_is_content_addressed() {
        let store = MemoryStore::new();
        let cid_a = store.put(b"artifact-a").await.unwrap();
        let cid_b = store.put(b"artifact-a").await.unwrap();
        assert_eq!(cid_a, cid_b);
        assert_eq!(store.get(&cid_a).await.unwrap(), b"artifact-a");
        assert!(store.get("mem-unknown").await.is_err());
    }
}
