//! Shadow market rehearsal: the full agent stack against the in-process
//! ledger, no live chain required.
//!
//! Usage: `shadow_market [rounds]` (default 3). Each round commits one
//! artifact, lets the buyer escrow it, the oracle mesh verify it, and the
//! provider settle it, then prints a summary.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;

use veridex::config::{ConsensusConfig, IngestConfig, RoleConfig, SubmitterConfig};
use veridex::consensus::ConsensusAggregator;
use veridex::content::{memory::MemoryStore, ContentStore};
use veridex::gateway::sim::{SimLedger, SimLedgerConfig};
use veridex::gateway::Ledger;
use veridex::ingest::{EventIngestionLoop, EventSink, TopicFilter};
use veridex::lifecycle::buyer::BuyerController;
use veridex::lifecycle::provider::ProviderController;
use veridex::oracle::scorer::LexicalScorer;
use veridex::oracle::OracleNode;
use veridex::runtime::AgentOrchestrator;
use veridex::submit::TransactionSubmitter;
use veridex::types::{EventKind, TaskState};

const ONE_ETH: u128 = 1_000_000_000_000_000_000;

fn fast_ingest() -> IngestConfig {
    IngestConfig {
        poll_interval: Duration::from_millis(50),
        lookback_blocks: 100,
        max_log_range_blocks: 500,
        seen_window_blocks: 10_000,
    }
}

fn fast_role() -> RoleConfig {
    RoleConfig {
        action_tick_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(500),
        task_creation_interval: Duration::from_millis(200),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let rounds: usize = std::env::args()
        .nth(1)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(3);

    let sim = Arc::new(SimLedger::new(SimLedgerConfig::default()));
    let ledger: Arc<dyn Ledger> = sim.clone();
    let content = Arc::new(MemoryStore::new());
    let consensus = Arc::new(ConsensusAggregator::new(
        ledger.clone(),
        ConsensusConfig::default(),
    ));

    let provider_signer = PrivateKeySigner::random();
    let buyer_signer = PrivateKeySigner::random();
    let oracle_signers: Vec<PrivateKeySigner> =
        (0..3).map(|_| PrivateKeySigner::random()).collect();

    sim.credit(provider_signer.address(), U256::from(10 * ONE_ETH));
    sim.credit(buyer_signer.address(), U256::from(10 * ONE_ETH));
    for signer in &oracle_signers {
        sim.credit(signer.address(), U256::from(ONE_ETH));
        sim.register_oracle(signer.address());
    }

    let submitter_cfg = SubmitterConfig {
        confirmation_timeout: Duration::from_millis(500),
        ..SubmitterConfig::default()
    };

    let provider = Arc::new(ProviderController::new(
        ledger.clone(),
        TransactionSubmitter::new(
            ledger.clone(),
            provider_signer.address(),
            None,
            submitter_cfg.clone(),
        ),
        content.clone() as Arc<dyn ContentStore>,
        fast_role(),
    ));
    let buyer = Arc::new(BuyerController::new(
        ledger.clone(),
        TransactionSubmitter::new(
            ledger.clone(),
            buyer_signer.address(),
            None,
            submitter_cfg.clone(),
        ),
        fast_role(),
        HashSet::new(),
        U256::from(ONE_ETH / 100),
    ));

    let mut orchestrator = AgentOrchestrator::new(ledger.clone(), consensus.clone())
        .with_provider(provider.clone())
        .with_buyer(buyer.clone())
        .with_ingestion_loop(Arc::new(EventIngestionLoop::new(
            "provider",
            ledger.clone(),
            TopicFilter::only(&[
                EventKind::TaskCommitted,
                EventKind::FundsLocked,
                EventKind::TaskFinalized,
            ]),
            vec![provider.clone() as Arc<dyn EventSink>],
            fast_ingest(),
        )))
        .with_ingestion_loop(Arc::new(EventIngestionLoop::new(
            "buyer",
            ledger.clone(),
            TopicFilter::only(&[EventKind::TaskCommitted, EventKind::FundsLocked]),
            vec![buyer.clone() as Arc<dyn EventSink>],
            fast_ingest(),
        )));

    let scorer = Arc::new(LexicalScorer);
    let mut oracle_sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    for (idx, signer) in oracle_signers.into_iter().enumerate() {
        let node = Arc::new(OracleNode::new(
            idx,
            signer.clone(),
            ledger.clone(),
            TransactionSubmitter::new(ledger.clone(), signer.address(), None, submitter_cfg.clone()),
            scorer.clone(),
            content.clone() as Arc<dyn ContentStore>,
            consensus.clone(),
            fast_role(),
            "liquidity depth report".to_string(),
        ));
        oracle_sinks.push(node.clone());
        orchestrator = orchestrator.with_oracle(node);
    }
    orchestrator = orchestrator.with_ingestion_loop(Arc::new(EventIngestionLoop::new(
        "oracle",
        ledger.clone(),
        TopicFilter::only(&[
            EventKind::TaskRevealed,
            EventKind::VerificationSubmitted,
            EventKind::TaskFinalized,
        ]),
        oracle_sinks,
        fast_ingest(),
    )));

    let orchestrator = Arc::new(orchestrator);
    let failures = orchestrator.start().await;
    if !failures.is_empty() {
        anyhow::bail!("shadow startup failures: {failures:?}");
    }

    for round in 1..=rounds {
        let artifact = format!(
            "shadow liquidity depth report #{round}: spreads, volumes, and venue coverage\n"
        )
        .repeat(64);
        provider
            .commit_artifact(artifact.as_bytes(), 1, U256::from(ONE_ETH / 1_000))
            .await?;

        // Let the pipeline run the round to settlement.
        let settled = 'wait: {
            for _ in 0..200 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if let Some(task) = sim.task_snapshot(round as u64) {
                    if task.state == TaskState::Settled {
                        break 'wait true;
                    }
                }
            }
            false
        };

        let task = sim.task_snapshot(round as u64);
        println!(
            "[SHADOW] round {round}: settled={settled} state={:?} score={:?}",
            task.as_ref().map(|t| t.state),
            task.as_ref().and_then(|t| t.final_score),
        );
    }

    let snapshot = orchestrator.status_snapshot().await;
    println!("[SHADOW] final status: {snapshot}");
    orchestrator.shutdown().await;
    Ok(())
}
