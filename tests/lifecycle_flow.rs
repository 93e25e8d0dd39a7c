//! Provider/buyer lifecycle properties: escrow-guarded reveal, idempotent
//! reveal and settle, stale-deadline aborts, and the dispute/refund path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};

use veridex::config::{IngestConfig, RoleConfig, SubmitterConfig};
use veridex::content::memory::MemoryStore;
use veridex::content::ContentStore;
use veridex::gateway::sim::SimLedger;
use veridex::gateway::{Ledger, LedgerCall, SubmitOptions};
use veridex::ingest::{EventIngestionLoop, EventSink, TopicFilter};
use veridex::lifecycle::buyer::BuyerController;
use veridex::lifecycle::provider::ProviderController;
use veridex::lifecycle::ActionOutcome;
use veridex::submit::TransactionSubmitter;
use veridex::types::{EscrowState, TaskState};

const ONE_ETH: u128 = 1_000_000_000_000_000_000;

fn role_cfg() -> RoleConfig {
    RoleConfig {
        action_tick_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(200),
        task_creation_interval: Duration::from_secs(60),
    }
}

struct Harness {
    sim: Arc<SimLedger>,
    provider: Arc<ProviderController>,
    provider_loop: EventIngestionLoop,
    buyer_addr: Address,
}

impl Harness {
    fn new() -> Self {
        let sim = Arc::new(SimLedger::default());
        let provider_addr = Address::repeat_byte(0x11);
        let buyer_addr = Address::repeat_byte(0x22);
        sim.credit(provider_addr, U256::from(10 * ONE_ETH));
        sim.credit(buyer_addr, U256::from(10 * ONE_ETH));

        let content = Arc::new(MemoryStore::new());
        let provider = Arc::new(ProviderController::new(
            sim.clone() as Arc<dyn Ledger>,
            TransactionSubmitter::new(
                sim.clone() as Arc<dyn Ledger>,
                provider_addr,
                None,
                SubmitterConfig::default(),
            ),
            content as Arc<dyn ContentStore>,
            role_cfg(),
        ));
        let provider_loop = EventIngestionLoop::new(
            "provider",
            sim.clone() as Arc<dyn Ledger>,
            TopicFilter::all(),
            vec![provider.clone() as Arc<dyn EventSink>],
            IngestConfig {
                poll_interval: Duration::from_millis(50),
                lookback_blocks: 1_000,
                max_log_range_blocks: 1_000,
                seen_window_blocks: 10_000,
            },
        );

        Self {
            sim,
            provider,
            provider_loop,
            buyer_addr,
        }
    }

    async fn lock_escrow(&self, task_id: u64) {
        self.sim
            .submit(
                self.buyer_addr,
                &LedgerCall::LockFunds { task_id },
                SubmitOptions {
                    value: U256::from(ONE_ETH / 100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_reveal_waits_for_escrow_then_fires_once() {
    let harness = Harness::new();
    harness
        .provider
        .commit_artifact(b"liquidity depth report, venue coverage", 1, U256::from(1_000u64))
        .await
        .unwrap();
    harness.sim.drain_submitted_calls();

    // Commit observed, but no escrow yet: reveal must not happen.
    harness.provider_loop.tick().await.unwrap();
    assert_eq!(
        harness.provider.try_reveal(1).await.unwrap(),
        ActionOutcome::SkippedNotReady
    );
    assert_eq!(harness.sim.submitted_call_count(), 0);
    assert_eq!(
        harness.sim.task_snapshot(1).unwrap().state,
        TaskState::Committed
    );

    // Escrow lands; the FundsLocked delivery triggers exactly one reveal.
    harness.lock_escrow(1).await;
    harness.sim.drain_submitted_calls();
    harness.provider_loop.tick().await.unwrap();

    let calls = harness.sim.drain_submitted_calls();
    let reveals = calls.iter().filter(|(_, name)| name == "revealTask").count();
    assert_eq!(reveals, 1);
    assert_eq!(
        harness.sim.task_snapshot(1).unwrap().state,
        TaskState::Revealed
    );
}

#[tokio::test]
async fn test_reveal_path_is_idempotent_for_revealed_task() {
    let harness = Harness::new();
    harness
        .provider
        .commit_artifact(b"artifact body", 1, U256::from(1_000u64))
        .await
        .unwrap();
    harness.lock_escrow(1).await;
    harness.provider_loop.tick().await.unwrap();
    assert_eq!(
        harness.sim.task_snapshot(1).unwrap().state,
        TaskState::Revealed
    );
    harness.sim.drain_submitted_calls();

    // Second and third reveal attempts observe Revealed and submit nothing.
    assert_eq!(
        harness.provider.try_reveal(1).await.unwrap(),
        ActionOutcome::SkippedAlreadyDone
    );
    assert_eq!(
        harness.provider.try_reveal(1).await.unwrap(),
        ActionOutcome::SkippedAlreadyDone
    );
    assert_eq!(harness.sim.submitted_call_count(), 0);
}

#[tokio::test]
async fn test_expired_reveal_window_aborts_stale_without_submission() {
    let harness = Harness::new();
    harness
        .provider
        .commit_artifact(b"artifact body", 1, U256::from(1_000u64))
        .await
        .unwrap();
    harness.provider_loop.tick().await.unwrap();

    // Funds arrive only after the reveal deadline has already passed.
    harness.sim.advance_time(100_000);
    harness.lock_escrow(1).await;
    harness.sim.drain_submitted_calls();

    let outcome = harness.provider.try_reveal(1).await.unwrap();
    assert_eq!(outcome, ActionOutcome::AbortedStale);
    assert_eq!(harness.sim.submitted_call_count(), 0);
    assert_eq!(
        harness.sim.task_snapshot(1).unwrap().state,
        TaskState::Committed
    );
}

#[tokio::test]
async fn test_buyer_disputes_then_refunds_a_dead_task() {
    let sim = Arc::new(SimLedger::default());
    let provider_addr = Address::repeat_byte(0x11);
    let buyer_addr = Address::repeat_byte(0x22);
    sim.credit(provider_addr, U256::from(10 * ONE_ETH));
    sim.credit(buyer_addr, U256::from(10 * ONE_ETH));

    let buyer = Arc::new(BuyerController::new(
        sim.clone() as Arc<dyn Ledger>,
        TransactionSubmitter::new(
            sim.clone() as Arc<dyn Ledger>,
            buyer_addr,
            None,
            SubmitterConfig::default(),
        ),
        role_cfg(),
        HashSet::new(),
        U256::from(ONE_ETH / 100),
    ));
    let buyer_loop = EventIngestionLoop::new(
        "buyer",
        sim.clone() as Arc<dyn Ledger>,
        TopicFilter::all(),
        vec![buyer.clone() as Arc<dyn EventSink>],
        IngestConfig::default(),
    );

    // Provider commits and then vanishes without revealing.
    sim.submit(
        provider_addr,
        &LedgerCall::CommitTask {
            commit_hash: alloy::primitives::B256::repeat_byte(0xcc),
            market_id: 1,
        },
        SubmitOptions {
            value: U256::from(1_000u64),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    buyer_loop.tick().await.unwrap();
    assert_eq!(
        sim.get_escrow(1).await.unwrap().unwrap().state,
        EscrowState::Locked
    );

    // Validation window expires unanswered: the sweep raises the dispute.
    sim.advance_time(100_000);
    buyer.tick().await;
    assert_eq!(
        sim.get_escrow(1).await.unwrap().unwrap().state,
        EscrowState::Disputed
    );
    assert_eq!(sim.task_snapshot(1).unwrap().state, TaskState::Disputed);

    // Dispute window expires unresolved: the refund claim follows.
    sim.advance_time(100_000);
    buyer.tick().await;
    let escrow = sim.get_escrow(1).await.unwrap().unwrap();
    assert_eq!(escrow.state, EscrowState::Refunded);
    assert_eq!(sim.task_snapshot(1).unwrap().state, TaskState::Cancelled);

    let status = buyer.status().await;
    assert_eq!(status.refunded, 1);
}
