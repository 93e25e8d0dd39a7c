//! HTTP content-store gateway client.
//!
//! Protocol: `POST {base}/blobs` with the raw bytes returns
//! `{"cid": "..."}`; `GET {base}/blobs/{cid}` returns the bytes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::NetworkError;

use super::ContentStore;

#[derive(Deserialize)]
struct PutResponse {
    cid: String,
}

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { client, base_url }
    }
}

#[async_trait]
impl ContentStore for HttpStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, NetworkError> {
        let url = format!("{}/blobs", self.base_url);
        let response = self
            .client
            .post(&url)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| NetworkError::Transport(format!("content put failed: {e}")))?;
        if !response.status().is_success() {
            return Err(NetworkError::Transport(format!(
                "content store rejected put: HTTP {}",
                response.status()
            )));
        }
        let parsed: PutResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::Transport(format!("content put response invalid: {e}")))?;
        Ok(parsed.cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, NetworkError> {
        let url = format!("{}/blobs/{}", self.base_url, cid);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkError::Transport(format!("content get failed: {e}")))?;
        if !response.status().is_success() {
            return Err(NetworkError::Transport(format!(
                "content store miss for {cid}: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Transport(format!("content body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}
