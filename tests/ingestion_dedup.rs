//! Ingestion-loop properties: at-most-once dispatch across overlapping
//! windows, the no-gap guarantee on failed ticks, range splitting under
//! provider caps, and per-log parse-failure isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;

use veridex::config::IngestConfig;
use veridex::error::{MarketError, NetworkError};
use veridex::gateway::sim::SimLedger;
use veridex::gateway::{
    ConfirmationStatus, Ledger, LedgerCall, SubmitOptions, TxHandle,
};
use veridex::ingest::{EventIngestionLoop, EventSink, TopicFilter};
use veridex::types::{Escrow, LogEntry, MarketEvent, Task};

struct CountingSink {
    deliveries: Mutex<HashMap<(String, u64), u32>>,
}

impl CountingSink {
    fn new() -> Self {
        Self {
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    async fn count(&self, kind: &str, task_id: u64) -> u32 {
        self.deliveries
            .lock()
            .await
            .get(&(kind.to_string(), task_id))
            .copied()
            .unwrap_or(0)
    }

    async fn total(&self) -> u32 {
        self.deliveries.lock().await.values().sum()
    }
}

#[async_trait]
impl EventSink for CountingSink {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn deliver(&self, event: &MarketEvent) -> Result<(), MarketError> {
        let key = (event.kind().as_str().to_string(), event.task_id());
        *self.deliveries.lock().await.entry(key).or_insert(0) += 1;
        Ok(())
    }
}

fn cfg(max_range: u64) -> IngestConfig {
    IngestConfig {
        poll_interval: Duration::from_millis(50),
        lookback_blocks: 1_000,
        max_log_range_blocks: max_range,
        seen_window_blocks: 10_000,
    }
}

async fn commit_task(sim: &SimLedger, provider: Address) {
    sim.submit(
        provider,
        &LedgerCall::CommitTask {
            commit_hash: B256::repeat_byte(0xcc),
            market_id: 1,
        },
        SubmitOptions {
            value: U256::from(1_000u64),
            ..Default::default()
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_mid_tick_failure_replays_without_duplicate_dispatch() {
    let sim = Arc::new(SimLedger::default());
    let provider = Address::repeat_byte(0x11);
    sim.credit(provider, U256::from(10u64.pow(18)));

    // Three commits land in three consecutive blocks.
    for _ in 0..3 {
        commit_task(&sim, provider).await;
    }

    let sink = Arc::new(CountingSink::new());
    let ingestion = EventIngestionLoop::new(
        "test",
        sim.clone() as Arc<dyn Ledger>,
        TopicFilter::all(),
        vec![sink.clone()],
        cfg(2),
    );

    // Head is 4; chunks are [0,1] [2,3] [4,4]. Serve two queries, then fail:
    // the tick dispatches blocks 2-3 and dies before block 4, leaving the
    // watermark untouched.
    sim.fail_get_logs_after(2, 1);
    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(err, NetworkError::Transport(_)));
    assert_eq!(sink.count("TaskCommitted", 1).await, 1);
    assert_eq!(sink.count("TaskCommitted", 2).await, 1);
    assert_eq!(sink.count("TaskCommitted", 3).await, 0);

    // Retry tick re-queries the same range from the same watermark (no gap),
    // skips the two already-dispatched logs, and delivers only block 4's.
    let report = ingestion.tick().await.unwrap();
    assert_eq!(report.scanned_from, 0);
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(sink.count("TaskCommitted", 1).await, 1);
    assert_eq!(sink.count("TaskCommitted", 2).await, 1);
    assert_eq!(sink.count("TaskCommitted", 3).await, 1);
    assert_eq!(sink.total().await, 3);
}

#[tokio::test]
async fn test_quiet_ticks_do_not_redispatch() {
    let sim = Arc::new(SimLedger::default());
    let provider = Address::repeat_byte(0x11);
    sim.credit(provider, U256::from(10u64.pow(18)));
    commit_task(&sim, provider).await;

    let sink = Arc::new(CountingSink::new());
    let ingestion = EventIngestionLoop::new(
        "test",
        sim.clone() as Arc<dyn Ledger>,
        TopicFilter::all(),
        vec![sink.clone()],
        cfg(100),
    );

    ingestion.tick().await.unwrap();
    ingestion.tick().await.unwrap();
    ingestion.tick().await.unwrap();
    assert_eq!(sink.total().await, 1);
}

#[tokio::test]
async fn test_provider_range_cap_splits_queries() {
    let sim = Arc::new(SimLedger::default());
    let provider = Address::repeat_byte(0x11);
    sim.credit(provider, U256::from(10u64.pow(18)));
    for _ in 0..4 {
        commit_task(&sim, provider).await;
    }

    // The loop is configured wider than the provider actually allows; the
    // RangeTooWide failures force binary splits down to accepted widths.
    sim.set_max_log_range(2);
    let sink = Arc::new(CountingSink::new());
    let ingestion = EventIngestionLoop::new(
        "test",
        sim.clone() as Arc<dyn Ledger>,
        TopicFilter::all(),
        vec![sink.clone()],
        cfg(100),
    );

    let report = ingestion.tick().await.unwrap();
    assert_eq!(report.dispatched, 4);
    assert_eq!(sink.total().await, 4);
}

/// Delegating gateway that corrupts the payload of one log, to prove a bad
/// log is skipped without poisoning its batch.
struct CorruptingLedger {
    inner: Arc<SimLedger>,
    corrupt_block: u64,
}

#[async_trait]
impl Ledger for CorruptingLedger {
    async fn block_number(&self) -> Result<u64, NetworkError> {
        self.inner.block_number().await
    }
    async fn ledger_timestamp(&self) -> Result<u64, NetworkError> {
        self.inner.ledger_timestamp().await
    }
    async fn balance_of(&self, address: Address) -> Result<U256, NetworkError> {
        self.inner.balance_of(address).await
    }
    async fn transaction_count(&self, address: Address) -> Result<u64, NetworkError> {
        self.inner.transaction_count(address).await
    }
    async fn gas_price(&self) -> Result<u128, NetworkError> {
        self.inner.gas_price().await
    }
    async fn get_task(&self, task_id: u64) -> Result<Option<Task>, NetworkError> {
        self.inner.get_task(task_id).await
    }
    async fn get_escrow(&self, task_id: u64) -> Result<Option<Escrow>, NetworkError> {
        self.inner.get_escrow(task_id).await
    }
    async fn can_reveal(&self, task_id: u64) -> Result<bool, NetworkError> {
        self.inner.can_reveal(task_id).await
    }
    async fn can_validate(&self, task_id: u64) -> Result<bool, NetworkError> {
        self.inner.can_validate(task_id).await
    }
    async fn submission_count(&self, task_id: u64) -> Result<u64, NetworkError> {
        self.inner.submission_count(task_id).await
    }
    async fn has_consensus(&self, task_id: u64) -> Result<bool, NetworkError> {
        self.inner.has_consensus(task_id).await
    }
    async fn time_remaining(&self, task_id: u64) -> Result<u64, NetworkError> {
        self.inner.time_remaining(task_id).await
    }
    async fn is_active_oracle(&self, oracle: Address) -> Result<bool, NetworkError> {
        self.inner.is_active_oracle(oracle).await
    }
    async fn active_oracle_count(&self) -> Result<u64, NetworkError> {
        self.inner.active_oracle_count().await
    }
    async fn estimate_gas(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<u64, NetworkError> {
        self.inner.estimate_gas(from, call, value).await
    }
    async fn simulate(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<(), MarketError> {
        self.inner.simulate(from, call, value).await
    }
    async fn submit(
        &self,
        from: Address,
        call: &LedgerCall,
        opts: SubmitOptions,
    ) -> Result<TxHandle, MarketError> {
        self.inner.submit(from, call, opts).await
    }
    async fn wait_for_confirmation(
        &self,
        handle: &TxHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, NetworkError> {
        self.inner.wait_for_confirmation(handle, timeout).await
    }
    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, NetworkError> {
        let mut logs = self.inner.get_logs(from_block, to_block).await?;
        for log in &mut logs {
            if log.block_number == self.corrupt_block {
                log.payload = serde_json::json!({"event": 42});
            }
        }
        Ok(logs)
    }
}

#[tokio::test]
async fn test_unparsable_log_is_isolated_from_its_batch() {
    let sim = Arc::new(SimLedger::default());
    let provider = Address::repeat_byte(0x11);
    sim.credit(provider, U256::from(10u64.pow(18)));
    for _ in 0..3 {
        commit_task(&sim, provider).await;
    }

    // Commits landed in blocks 2, 3, 4; corrupt the middle one.
    let corrupting = Arc::new(CorruptingLedger {
        inner: sim.clone(),
        corrupt_block: 3,
    });
    let sink = Arc::new(CountingSink::new());
    let ingestion = EventIngestionLoop::new(
        "test",
        corrupting as Arc<dyn Ledger>,
        TopicFilter::all(),
        vec![sink.clone()],
        cfg(100),
    );

    let report = ingestion.tick().await.unwrap();
    assert_eq!(report.parse_failures, 1);
    assert_eq!(report.dispatched, 2);
    assert_eq!(sink.count("TaskCommitted", 1).await, 1);
    assert_eq!(sink.count("TaskCommitted", 3).await, 1);

    // The bad log stays skipped on later ticks instead of being retried
    // forever.
    let report = ingestion.tick().await.unwrap();
    assert_eq!(report.parse_failures, 0);
    assert_eq!(report.dispatched, 0);
}
