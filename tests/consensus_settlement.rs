//! Consensus liveness and settlement: three in-band oracle scores finalize
//! at their median, and however many observers notice, exactly one
//! settlement transaction lands.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use veridex::config::{ConsensusConfig, IngestConfig, RoleConfig, SubmitterConfig};
use veridex::consensus::ConsensusAggregator;
use veridex::content::memory::MemoryStore;
use veridex::content::ContentStore;
use veridex::error::MarketError;
use veridex::gateway::sim::SimLedger;
use veridex::gateway::Ledger;
use veridex::ingest::{EventIngestionLoop, EventSink, TopicFilter};
use veridex::lifecycle::provider::ProviderController;
use veridex::lifecycle::ActionOutcome;
use veridex::oracle::scorer::{ScoreBreakdown, Scorer};
use veridex::oracle::OracleNode;
use veridex::submit::TransactionSubmitter;
use veridex::types::{ConsensusStage, TaskState};

const ONE_ETH: u128 = 1_000_000_000_000_000_000;

/// Scorer pinned to one composite score, for driving exact medians.
struct FixedScorer(f64);

#[async_trait]
impl Scorer for FixedScorer {
    async fn score(&self, _artifact: &[u8], _expectations: &str) -> Result<ScoreBreakdown, MarketError> {
        Ok(ScoreBreakdown {
            quality: self.0,
            alignment: self.0,
            integrity: self.0,
        })
    }
}

fn role_cfg() -> RoleConfig {
    RoleConfig {
        action_tick_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(200),
        task_creation_interval: Duration::from_secs(60),
    }
}

struct MeshHarness {
    sim: Arc<SimLedger>,
    provider: Arc<ProviderController>,
    oracles: Vec<Arc<OracleNode>>,
    oracle_loop: EventIngestionLoop,
    provider_loop: EventIngestionLoop,
    aggregator: Arc<ConsensusAggregator>,
}

impl MeshHarness {
    /// Three oracles whose fixed scores compose to {85, 88, 87}.
    fn new() -> Self {
        let sim = Arc::new(SimLedger::default());
        let ledger: Arc<dyn Ledger> = sim.clone();
        let content = Arc::new(MemoryStore::new());
        let aggregator = Arc::new(ConsensusAggregator::new(
            ledger.clone(),
            ConsensusConfig::default(),
        ));

        let provider_signer = PrivateKeySigner::random();
        sim.credit(provider_signer.address(), U256::from(10 * ONE_ETH));
        let provider = Arc::new(ProviderController::new(
            ledger.clone(),
            TransactionSubmitter::new(
                ledger.clone(),
                provider_signer.address(),
                None,
                SubmitterConfig::default(),
            ),
            content.clone() as Arc<dyn ContentStore>,
            role_cfg(),
        ));

        let mut oracles = Vec::new();
        let mut oracle_sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        for (idx, target) in [0.85f64, 0.88, 0.87].into_iter().enumerate() {
            let signer = PrivateKeySigner::random();
            sim.credit(signer.address(), U256::from(ONE_ETH));
            sim.register_oracle(signer.address());
            let node = Arc::new(OracleNode::new(
                idx,
                signer.clone(),
                ledger.clone(),
                TransactionSubmitter::new(
                    ledger.clone(),
                    signer.address(),
                    None,
                    SubmitterConfig::default(),
                ),
                Arc::new(FixedScorer(target)),
                content.clone() as Arc<dyn ContentStore>,
                aggregator.clone(),
                role_cfg(),
                String::new(),
            ));
            oracle_sinks.push(node.clone());
            oracles.push(node);
        }

        let ingest_cfg = IngestConfig {
            poll_interval: Duration::from_millis(50),
            lookback_blocks: 1_000,
            max_log_range_blocks: 1_000,
            seen_window_blocks: 10_000,
        };
        let oracle_loop = EventIngestionLoop::new(
            "oracle",
            ledger.clone(),
            TopicFilter::all(),
            oracle_sinks,
            ingest_cfg.clone(),
        );
        let provider_loop = EventIngestionLoop::new(
            "provider",
            ledger.clone(),
            TopicFilter::all(),
            vec![provider.clone() as Arc<dyn EventSink>],
            ingest_cfg,
        );

        Self {
            sim,
            provider,
            oracles,
            oracle_loop,
            provider_loop,
            aggregator,
        }
    }

    async fn commit_lock_reveal(&self) -> u64 {
        self.provider
            .commit_artifact(b"verified artifact body", 1, U256::from(1_000u64))
            .await
            .unwrap();
        let buyer = alloy::primitives::Address::repeat_byte(0x22);
        self.sim.credit(buyer, U256::from(10 * ONE_ETH));
        self.sim
            .submit(
                buyer,
                &veridex::gateway::LedgerCall::LockFunds { task_id: 1 },
                veridex::gateway::SubmitOptions {
                    value: U256::from(ONE_ETH / 100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        self.provider_loop.tick().await.unwrap();
        assert_eq!(
            self.sim.task_snapshot(1).unwrap().state,
            TaskState::Revealed
        );
        1
    }
}

#[tokio::test]
async fn test_three_in_band_scores_finalize_at_median() {
    let harness = MeshHarness::new();
    let task_id = harness.commit_lock_reveal().await;
    harness.sim.drain_submitted_calls();

    // Queue the reveal on every node, then let two verify.
    harness.oracle_loop.tick().await.unwrap();
    harness.oracles[0].tick().await;
    harness.oracles[1].tick().await;

    // Two in-band scores {85, 88}: consensus observable, not yet finalized
    // because the third active oracle has not spoken and the window is open.
    assert!(harness.aggregator.has_consensus(task_id).await.unwrap());
    let status = harness.aggregator.status(task_id).await.unwrap();
    assert_eq!(status.stage, ConsensusStage::ConsensusReached);
    assert_eq!(status.submissions, 2);

    harness.oracles[2].tick().await;
    let status = harness.aggregator.status(task_id).await.unwrap();
    assert_eq!(status.stage, ConsensusStage::Finalized);
    assert_eq!(status.final_score, Some(87));

    let task = harness.sim.task_snapshot(task_id).unwrap();
    assert_eq!(task.state, TaskState::Validated);
    assert_eq!(task.final_score, Some(87));

    // Each oracle submitted exactly once.
    let calls = harness.sim.drain_submitted_calls();
    let verifications = calls
        .iter()
        .filter(|(_, name)| name == "submitVerification")
        .count();
    assert_eq!(verifications, 3);
}

#[tokio::test]
async fn test_exactly_one_settlement_for_a_finalized_task() {
    let harness = MeshHarness::new();
    let task_id = harness.commit_lock_reveal().await;

    harness.oracle_loop.tick().await.unwrap();
    for oracle in &harness.oracles {
        oracle.tick().await;
    }
    assert_eq!(
        harness.sim.task_snapshot(task_id).unwrap().state,
        TaskState::Validated
    );
    harness.sim.drain_submitted_calls();

    // Every trigger path rushes to settle: the finalization event, the sweep,
    // and a manual retry. Only the first submission goes through.
    harness.provider_loop.tick().await.unwrap();
    harness.provider.tick().await;
    let second = harness.provider.try_settle(task_id).await.unwrap();

    let calls = harness.sim.drain_submitted_calls();
    let settlements = calls
        .iter()
        .filter(|(_, name)| name == "releaseFunds")
        .count();
    assert_eq!(settlements, 1);
    assert_eq!(second, ActionOutcome::SkippedAlreadyDone);
    assert_eq!(
        harness.sim.task_snapshot(task_id).unwrap().state,
        TaskState::Settled
    );
}

#[tokio::test]
async fn test_oracle_drops_task_after_consensus() {
    let harness = MeshHarness::new();
    let task_id = harness.commit_lock_reveal().await;

    harness.oracle_loop.tick().await.unwrap();
    for oracle in &harness.oracles {
        oracle.tick().await;
    }

    // Submitted entries watch consensus on the next tick, see finalization,
    // and leave the queue.
    for oracle in &harness.oracles {
        oracle.tick().await;
        let status = oracle.status().await;
        assert_eq!(status.queued, 0, "{} still watching task {task_id}", status.name);
        assert_eq!(status.verified, 1);
    }
}
