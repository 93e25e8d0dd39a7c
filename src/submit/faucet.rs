//! Funding top-up collaborator. The submitter invokes it once per attempt
//! when the balance preflight comes up short.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::NetworkError;
use crate::gateway::sim::SimLedger;

#[async_trait]
pub trait FundingFaucet: Send + Sync {
    async fn top_up(&self, address: Address) -> Result<(), NetworkError>;
}

/// POSTs `{"address": "0x..."}` to a faucet service.
pub struct HttpFaucet {
    client: reqwest::Client,
    url: String,
}

impl HttpFaucet {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl FundingFaucet for HttpFaucet {
    async fn top_up(&self, address: Address) -> Result<(), NetworkError> {
        let payload = serde_json::json!({ "address": format!("{address:#x}") });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NetworkError::Transport(format!("faucet request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(NetworkError::Transport(format!(
                "faucet rejected top-up for {address:#x}: HTTP {}",
                response.status()
            )));
        }
        tracing::info!("[SUBMIT] faucet top-up requested for {address:#x}");
        Ok(())
    }
}

/// Credits the in-process ledger directly. Used by tests and shadow runs.
pub struct SimFaucet {
    sim: Arc<SimLedger>,
    amount: U256,
    top_ups: AtomicU64,
}

impl SimFaucet {
    pub fn new(sim: Arc<SimLedger>, amount: U256) -> Self {
        Self {
            sim,
            amount,
            top_ups: AtomicU64::new(0),
        }
    }

    pub fn top_up_count(&self) -> u64 {
        self.top_ups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FundingFaucet for SimFaucet {
    async fn top_up(&self, address: Address) -> Result<(), NetworkError> {
        self.sim.credit(address, self.amount);
        self.top_ups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
