//! Client-side consensus observation.
//!
//! No consensus math lives here: the ledger's aggregation contract is
//! authoritative and this wrapper only polls it, so lifecycle controllers
//! and oracle nodes can make liveness decisions (stop retrying, proceed to
//! settlement) without re-deriving quorum logic, and so operators get a
//! derived stage/progress view. Every query hits the ledger; cached local
//! state is never trusted before acting.

use std::sync::Arc;

use serde::Serialize;

use crate::config::ConsensusConfig;
use crate::error::NetworkError;
use crate::gateway::Ledger;
use crate::types::ConsensusStage;

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStatus {
    pub task_id: u64,
    pub stage: ConsensusStage,
    pub submissions: u64,
    /// submissions / max(quorum, observed active oracle count), capped at 1.
    pub progress: f64,
    pub time_remaining_secs: u64,
    pub final_score: Option<u8>,
}

pub struct ConsensusAggregator {
    ledger: Arc<dyn Ledger>,
    cfg: ConsensusConfig,
}

impl ConsensusAggregator {
    pub fn new(ledger: Arc<dyn Ledger>, cfg: ConsensusConfig) -> Self {
        Self { ledger, cfg }
    }

    pub async fn submission_count(&self, task_id: u64) -> Result<u64, NetworkError> {
        self.ledger.submission_count(task_id).await
    }

    pub async fn has_consensus(&self, task_id: u64) -> Result<bool, NetworkError> {
        self.ledger.has_consensus(task_id).await
    }

    pub async fn time_remaining(&self, task_id: u64) -> Result<u64, NetworkError> {
        self.ledger.time_remaining(task_id).await
    }

    /// Reconcile against the ledger and derive the observer view.
    pub async fn status(&self, task_id: u64) -> Result<ConsensusStatus, NetworkError> {
        let task = self.ledger.get_task(task_id).await?;
        let submissions = self.ledger.submission_count(task_id).await?;
        let time_remaining_secs = self.ledger.time_remaining(task_id).await?;

        let final_score = task.as_ref().and_then(|t| t.final_score);
        let stage = if final_score.is_some() {
            ConsensusStage::Finalized
        } else if self.ledger.has_consensus(task_id).await? {
            ConsensusStage::ConsensusReached
        } else {
            ConsensusStage::Collecting
        };

        let active = self.ledger.active_oracle_count().await?.max(1);
        let quorum = ((active * self.cfg.quorum_bps + 5_000) / 10_000).max(2);
        let denominator = quorum.max(active) as f64;
        let progress = (submissions as f64 / denominator).min(1.0);

        Ok(ConsensusStatus {
            task_id,
            stage,
            submissions,
            progress,
            time_remaining_secs,
            final_score,
        })
    }

    /// Whether observers can stop watching this task: finalized, or the
    /// submission window lapsed without consensus.
    pub async fn is_settled_or_expired(&self, task_id: u64) -> Result<bool, NetworkError> {
        let status = self.status(task_id).await?;
        Ok(matches!(status.stage, ConsensusStage::Finalized)
            || (status.time_remaining_secs == 0
                && matches!(status.stage, ConsensusStage::Collecting)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sim::SimLedger;
    use alloy::primitives::{Address, B256, U256};

    #[tokio::test]
    async fn test_status_progress_over_collecting_task() {
        let sim = Arc::new(SimLedger::default());
        for i in 0..3u8 {
            sim.register_oracle(Address::repeat_byte(0xa0 + i));
        }
        let provider = Address::repeat_byte(0x11);
        sim.credit(provider, U256::from(10u64.pow(18)));
        sim.submit(
            provider,
            &crate::gateway::LedgerCall::CommitTask {
                commit_hash: B256::repeat_byte(0xcc),
                market_id: 1,
            },
            crate::gateway::SubmitOptions {
                value: U256::from(1_000u64),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let aggregator =
            ConsensusAggregator::new(sim.clone() as Arc<dyn Ledger>, ConsensusConfig::default());
        let status = aggregator.status(1).await.unwrap();
        assert_eq!(status.stage, ConsensusStage::Collecting);
        assert_eq!(status.submissions, 0);
        assert_eq!(status.progress, 0.0);
        assert!(status.time_remaining_secs > 0);
    }
}
