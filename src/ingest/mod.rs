//! Polling event ingestion with exactly-once dispatch.
//!
//! Polling instead of long-lived subscriptions is deliberate: bounded-range
//! repeated queries with explicit dedup survive provider filter limits and
//! re-delivered logs. The watermark (`last_processed_block`) only advances
//! after a fully successful tick, so a failed query can never open a gap;
//! the `seen` set absorbs the resulting re-deliveries.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::config::IngestConfig;
use crate::error::{MarketError, NetworkError};
use crate::gateway::Ledger;
use crate::types::{parse_event, EventKind, LogEntry, MarketEvent, ProcessedEventKey};

/// Receives parsed events. Delivery failures are contained per event; a sink
/// returning an error never aborts the batch or the loop.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, event: &MarketEvent) -> Result<(), MarketError>;
}

/// Which event kinds a loop dispatches. Loops are per role; ordering is
/// guaranteed within one loop only.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    kinds: HashSet<EventKind>,
}

impl TopicFilter {
    pub fn all() -> Self {
        Self {
            kinds: EventKind::ALL.into_iter().collect(),
        }
    }

    pub fn only(kinds: &[EventKind]) -> Self {
        Self {
            kinds: kinds.iter().copied().collect(),
        }
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }
}

struct IngestState {
    /// Next block to scan from. `None` until the first successful head read
    /// establishes the cold-start lookback.
    last_processed_block: Option<u64>,
    seen: HashSet<ProcessedEventKey>,
    seen_order: VecDeque<ProcessedEventKey>,
}

/// Outcome of one poll tick, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned_from: u64,
    pub scanned_to: u64,
    pub logs_seen: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
}

pub struct EventIngestionLoop {
    name: &'static str,
    ledger: Arc<dyn Ledger>,
    filter: TopicFilter,
    sinks: Vec<Arc<dyn EventSink>>,
    cfg: IngestConfig,
    state: Mutex<IngestState>,
    stopped: AtomicBool,
    ticks_completed: AtomicU64,
    ticks_failed: AtomicU64,
}

impl EventIngestionLoop {
    pub fn new(
        name: &'static str,
        ledger: Arc<dyn Ledger>,
        filter: TopicFilter,
        sinks: Vec<Arc<dyn EventSink>>,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            name,
            ledger,
            filter,
            sinks,
            cfg,
            state: Mutex::new(IngestState {
                last_processed_block: None,
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
            stopped: AtomicBool::new(false),
            ticks_completed: AtomicU64::new(0),
            ticks_failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Idempotent: halts scheduling of further ticks. An in-flight tick is
    /// allowed to complete.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn tick_counts(&self) -> (u64, u64) {
        (
            self.ticks_completed.load(Ordering::Relaxed),
            self.ticks_failed.load(Ordering::Relaxed),
        )
    }

    /// Drive the loop until stopped. Ticks are non-reentrant: the next tick
    /// never starts before the previous one finished.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.cfg.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    self.stop();
                }
            }
            if self.is_stopped() {
                tracing::info!("[INGEST] loop `{}` stopped", self.name);
                return;
            }
            match self.tick().await {
                Ok(report) => {
                    self.ticks_completed.fetch_add(1, Ordering::Relaxed);
                    if report.dispatched > 0 || report.parse_failures > 0 {
                        tracing::info!(
                            "[INGEST] `{}` scanned [{},{}]: {} logs, {} dispatched, {} dup, {} unparsable",
                            self.name,
                            report.scanned_from,
                            report.scanned_to,
                            report.logs_seen,
                            report.dispatched,
                            report.duplicates,
                            report.parse_failures,
                        );
                    }
                }
                Err(err) => {
                    // Watermark untouched: the same range is retried next tick.
                    self.ticks_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[INGEST] `{}` tick failed, will retry: {}", self.name, err);
                }
            }
        }
    }

    /// One poll cycle. On error the watermark is left untouched, so no block
    /// is ever skipped; duplicates on the retry path are absorbed by `seen`.
    pub async fn tick(&self) -> Result<TickReport, NetworkError> {
        let head = self.ledger.block_number().await?;
        let mut state = self.state.lock().await;

        let from = match state.last_processed_block {
            Some(block) => block,
            None => head.saturating_sub(self.cfg.lookback_blocks),
        };
        if from > head {
            return Ok(TickReport::default());
        }

        let mut report = TickReport {
            scanned_from: from,
            scanned_to: head,
            ..Default::default()
        };

        // Chunked scan: each chunk is fetched and dispatched before the next,
        // but the watermark only moves once the whole tick succeeds. A
        // mid-tick failure therefore re-delivers the already-dispatched
        // chunks next tick, where `seen` filters them out.
        let width = self.cfg.max_log_range_blocks.max(1);
        let mut start = from;
        while start <= head {
            let end = start.saturating_add(width - 1).min(head);
            let logs = self.fetch_chunk(start, end).await?;
            self.process_logs(&mut state, &logs, &mut report).await;
            start = end + 1;
        }

        state.last_processed_block = Some(head + 1);
        Self::trim_seen(&mut state, head, self.cfg.seen_window_blocks);
        Ok(report)
    }

    /// Query `[from, to]`, splitting into sub-ranges when the provider caps
    /// the width. Transport failures at single-block width propagate.
    async fn fetch_chunk(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, NetworkError> {
        let mut out = Vec::new();
        let mut pending: VecDeque<(u64, u64)> = VecDeque::new();
        pending.push_back((from, to));

        while let Some((lo, hi)) = pending.pop_front() {
            match self.ledger.get_logs(lo, hi).await {
                Ok(mut logs) => out.append(&mut logs),
                Err(NetworkError::RangeTooWide { .. }) if hi > lo => {
                    let mid = lo + (hi - lo) / 2;
                    pending.push_front((mid + 1, hi));
                    pending.push_front((lo, mid));
                }
                Err(err) => return Err(err),
            }
        }

        out.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(out)
    }

    async fn process_logs(
        &self,
        state: &mut IngestState,
        logs: &[LogEntry],
        report: &mut TickReport,
    ) {
        for entry in logs {
            report.logs_seen += 1;
            let key = entry.key();
            if state.seen.contains(&key) {
                report.duplicates += 1;
                continue;
            }
            match parse_event(entry) {
                Ok(event) => {
                    if self.filter.matches(event.kind()) {
                        self.dispatch(&event).await;
                        report.dispatched += 1;
                    }
                    // Filtered-out logs are still marked seen; they will not
                    // become relevant on re-delivery.
                    state.seen.insert(key);
                    state.seen_order.push_back(key);
                }
                Err(err) => {
                    // One bad log never aborts the batch.
                    report.parse_failures += 1;
                    state.seen.insert(key);
                    state.seen_order.push_back(key);
                    tracing::warn!(
                        "[INGEST] `{}` skipping unparsable log at block {} index {}: {}",
                        self.name,
                        entry.block_number,
                        entry.log_index,
                        err
                    );
                }
            }
        }
    }

    async fn dispatch(&self, event: &MarketEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(event).await {
                tracing::warn!(
                    "[INGEST] `{}` sink `{}` rejected {} for task {}: {}",
                    self.name,
                    sink.name(),
                    event.kind().as_str(),
                    event.task_id(),
                    err
                );
            }
        }
    }

    fn trim_seen(state: &mut IngestState, head: u64, window: u64) {
        let cutoff = head.saturating_sub(window);
        while let Some(front) = state.seen_order.front() {
            if front.block_number < cutoff {
                let key = *front;
                state.seen_order.pop_front();
                state.seen.remove(&key);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn key(block: u64, idx: u64) -> ProcessedEventKey {
        ProcessedEventKey {
            block_number: block,
            tx_hash: B256::repeat_byte(0x01),
            log_index: idx,
        }
    }

    #[test]
    fn test_trim_seen_drops_only_pre_window_keys() {
        let mut state = IngestState {
            last_processed_block: Some(0),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        };
        for block in [5u64, 50, 500] {
            let k = key(block, 0);
            state.seen.insert(k);
            state.seen_order.push_back(k);
        }
        EventIngestionLoop::trim_seen(&mut state, 600, 100);
        assert!(!state.seen.contains(&key(5, 0)));
        assert!(!state.seen.contains(&key(50, 0)));
        assert!(state.seen.contains(&key(500, 0)));
    }

    #[test]
    fn test_topic_filter_only() {
        let filter = TopicFilter::only(&[EventKind::TaskRevealed]);
        assert!(filter.matches(EventKind::TaskRevealed));
        assert!(!filter.matches(EventKind::TaskCommitted));
        assert!(TopicFilter::all().matches(EventKind::TaskCommitted));
    }
}
