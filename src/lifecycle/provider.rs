//! Provider-side lifecycle: commit an artifact, reveal it once a paying
//! escrow exists, settle once the oracle network has finalized a score.
//!
//! Reveals are the sensitive step. Revealing without a locked escrow gives
//! the artifact away for free, and the race window between the decision and
//! the send is real: `can_reveal` is re-verified immediately before
//! submission and a flip aborts without submitting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::config::RoleConfig;
use crate::content::ContentStore;
use crate::error::{MarketError, StaleStateError};
use crate::gateway::{Ledger, LedgerCall};
use crate::ingest::EventSink;
use crate::submit::TransactionSubmitter;
use crate::types::{MarketEvent, TaskState};

use super::{ActionOutcome, InFlightSet};

#[derive(Debug, Clone)]
struct TrackedTask {
    cid: String,
    escrow_seen: bool,
    retry_streak: u32,
    next_attempt_at: Instant,
}

struct ProviderState {
    /// Commits submitted whose TaskCommitted event has not arrived yet,
    /// keyed by commit hash.
    pending_commits: HashMap<B256, String>,
    /// Task -> artifact cid, owned by this role alone.
    tracked: HashMap<u64, TrackedTask>,
    revealed: u64,
    settled: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub address: String,
    pub tracked: usize,
    pub revealed: u64,
    pub settled: u64,
    pub last_error: Option<String>,
}

pub struct ProviderController {
    ledger: Arc<dyn Ledger>,
    submitter: TransactionSubmitter,
    content: Arc<dyn ContentStore>,
    cfg: RoleConfig,
    in_flight: InFlightSet,
    state: Mutex<ProviderState>,
}

impl ProviderController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        submitter: TransactionSubmitter,
        content: Arc<dyn ContentStore>,
        cfg: RoleConfig,
    ) -> Self {
        Self {
            ledger,
            submitter,
            content,
            cfg,
            in_flight: InFlightSet::new(),
            state: Mutex::new(ProviderState {
                pending_commits: HashMap::new(),
                tracked: HashMap::new(),
                revealed: 0,
                settled: 0,
                last_error: None,
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.submitter.identity()
    }

    pub async fn status(&self) -> ProviderStatus {
        let state = self.state.lock().await;
        ProviderStatus {
            address: format!("{:#x}", self.address()),
            tracked: state.tracked.len(),
            revealed: state.revealed,
            settled: state.settled,
            last_error: state.last_error.clone(),
        }
    }

    /// Publish a new artifact: store the bytes, commit its hash with the
    /// stake. The cid stays local until the escrow-guarded reveal.
    pub async fn commit_artifact(
        &self,
        artifact: &[u8],
        market_id: u64,
        stake: U256,
    ) -> Result<B256, MarketError> {
        let cid = self.content.put(artifact).await?;
        let commit_hash = keccak256(artifact);
        {
            let mut state = self.state.lock().await;
            state.pending_commits.insert(commit_hash, cid.clone());
        }

        let call = LedgerCall::CommitTask {
            commit_hash,
            market_id,
        };
        match self.submitter.execute(&call, stake).await {
            Ok(_) => {
                tracing::info!(
                    "[PROVIDER] committed artifact {commit_hash:#x} to market {market_id} (stake {stake})"
                );
                Ok(commit_hash)
            }
            Err(err) => {
                self.state.lock().await.pending_commits.remove(&commit_hash);
                Err(err)
            }
        }
    }

    /// Reveal path. Idempotent: a task already revealed is a silent skip, so
    /// overlapping triggers (event delivery and the periodic sweep) cannot
    /// produce a second submission.
    pub async fn try_reveal(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(_guard) = self.in_flight.try_claim(task_id) else {
            return Ok(ActionOutcome::SkippedInFlight);
        };

        let cid = {
            let state = self.state.lock().await;
            match state.tracked.get(&task_id) {
                Some(entry) if entry.next_attempt_at <= Instant::now() => entry.cid.clone(),
                Some(_) => return Ok(ActionOutcome::Deferred),
                None => return Ok(ActionOutcome::SkippedNotReady),
            }
        };

        let Some(task) = self.ledger.get_task(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        match task.state {
            TaskState::Committed => {}
            TaskState::Revealed | TaskState::Validated | TaskState::Settled => {
                crate::utils::audit::record(
                    "provider",
                    "reveal-skip-already-revealed",
                    Some(serde_json::json!({"taskId": task_id})),
                );
                return Ok(ActionOutcome::SkippedAlreadyDone);
            }
            TaskState::Disputed | TaskState::Cancelled => {
                self.untrack(task_id).await;
                return Ok(ActionOutcome::SkippedAlreadyDone);
            }
        }

        // Never reveal speculatively: a reveal without a paying escrow hands
        // the artifact out for free.
        let Some(escrow) = self.ledger.get_escrow(task_id).await? else {
            crate::utils::audit::record(
                "provider",
                "reveal-skip-no-escrow",
                Some(serde_json::json!({"taskId": task_id})),
            );
            return Ok(ActionOutcome::SkippedNotReady);
        };
        tracing::debug!(
            "[PROVIDER] task {task_id} escrow locked by {:#x} for {}",
            escrow.buyer,
            escrow.amount
        );

        // Guard re-check immediately before submission; the window between
        // decision and send is where deadline races live.
        if !self.ledger.can_reveal(task_id).await? {
            let stale = StaleStateError(format!(
                "task {task_id}: reveal no longer allowed (deadline passed or state advanced)"
            ));
            tracing::warn!("[PROVIDER] aborting reveal: {stale}");
            crate::utils::audit::record(
                "provider",
                "reveal-abort-stale",
                Some(serde_json::json!({"taskId": task_id})),
            );
            self.untrack(task_id).await;
            return Ok(ActionOutcome::AbortedStale);
        }

        let call = LedgerCall::RevealTask {
            task_id,
            cid: cid.clone(),
        };
        match self.submitter.execute(&call, U256::ZERO).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.revealed += 1;
                state.last_error = None;
                if let Some(entry) = state.tracked.get_mut(&task_id) {
                    entry.retry_streak = 0;
                    entry.next_attempt_at = Instant::now();
                }
                tracing::info!("[PROVIDER] revealed task {task_id} (cid {cid})");
                Ok(ActionOutcome::Submitted)
            }
            Err(MarketError::Revert(revert)) if !revert.is_time_window() => {
                // The ledger disagreed with our view; treat as the race it is.
                tracing::warn!("[PROVIDER] reveal for task {task_id} rejected: {revert}");
                self.untrack(task_id).await;
                Ok(ActionOutcome::AbortedStale)
            }
            Err(err) if err.is_transient() => {
                self.defer(task_id, format!("reveal deferred: {err}")).await;
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Settlement path. Idempotent: an already-settled task is skipped
    /// silently, whichever observer got there first.
    pub async fn try_settle(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(_guard) = self.in_flight.try_claim(task_id) else {
            return Ok(ActionOutcome::SkippedInFlight);
        };

        let Some(task) = self.ledger.get_task(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        match task.state {
            TaskState::Settled => {
                self.untrack(task_id).await;
                return Ok(ActionOutcome::SkippedAlreadyDone);
            }
            TaskState::Validated => {}
            _ => return Ok(ActionOutcome::SkippedNotReady),
        }

        let call = LedgerCall::ReleaseFunds { task_id };
        match self.submitter.execute(&call, U256::ZERO).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.settled += 1;
                state.last_error = None;
                state.tracked.remove(&task_id);
                tracing::info!(
                    "[PROVIDER] settled task {task_id} (final score {:?})",
                    task.final_score
                );
                crate::utils::telemetry::emit_success(
                    "settlement",
                    format!("task {task_id} settled at score {:?}", task.final_score),
                );
                Ok(ActionOutcome::Submitted)
            }
            Err(MarketError::Revert(revert)) if revert.reason.contains("already settled") => {
                tracing::info!("[PROVIDER] task {task_id} already settled by another actor");
                self.untrack(task_id).await;
                Ok(ActionOutcome::SkippedAlreadyDone)
            }
            Err(err) if err.is_transient() => {
                self.defer(task_id, format!("settle deferred: {err}")).await;
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Periodic sweep: the secondary trigger feeding the same idempotent
    /// reveal/settle operations the event path uses.
    pub async fn tick(&self) {
        let task_ids: Vec<u64> = {
            let state = self.state.lock().await;
            state.tracked.keys().copied().collect()
        };
        for task_id in task_ids {
            let Ok(Some(task)) = self.ledger.get_task(task_id).await else {
                continue;
            };
            let result = match task.state {
                TaskState::Committed => {
                    // The sweep also discovers escrows whose FundsLocked
                    // event this process never saw.
                    let escrow_known =
                        { self.state.lock().await.tracked.get(&task_id).map(|e| e.escrow_seen) };
                    match escrow_known {
                        Some(true) => {}
                        Some(false) => match self.ledger.get_escrow(task_id).await {
                            Ok(Some(_)) => {
                                if let Some(entry) =
                                    self.state.lock().await.tracked.get_mut(&task_id)
                                {
                                    entry.escrow_seen = true;
                                }
                            }
                            _ => continue,
                        },
                        None => continue,
                    }
                    self.try_reveal(task_id).await
                }
                TaskState::Validated => self.try_settle(task_id).await,
                TaskState::Settled | TaskState::Cancelled => {
                    self.untrack(task_id).await;
                    continue;
                }
                _ => continue,
            };
            if let Err(err) = result {
                tracing::warn!("[PROVIDER] sweep action for task {task_id} failed: {err}");
                self.state.lock().await.last_error = Some(err.to_string());
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.cfg.action_tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    tracing::info!("[PROVIDER] controller stopping");
                    return;
                }
            }
        }
    }

    async fn untrack(&self, task_id: u64) {
        self.state.lock().await.tracked.remove(&task_id);
    }

    async fn defer(&self, task_id: u64, reason: String) {
        tracing::warn!("[PROVIDER] {reason}");
        let mut state = self.state.lock().await;
        state.last_error = Some(reason);
        if let Some(entry) = state.tracked.get_mut(&task_id) {
            entry.retry_streak = entry.retry_streak.saturating_add(1);
            let backoff_ms = crate::utils::backoff::bounded_exponential_backoff_ms(
                self.cfg.retry_backoff.as_millis() as u64 / 8,
                entry.retry_streak,
                self.cfg.retry_backoff.as_millis() as u64,
            );
            entry.next_attempt_at = Instant::now() + Duration::from_millis(backoff_ms);
        }
    }
}

#[async_trait]
impl EventSink for ProviderController {
    fn name(&self) -> &'static str {
        "provider"
    }

    async fn deliver(&self, event: &MarketEvent) -> Result<(), MarketError> {
        match event {
            MarketEvent::TaskCommitted {
                task_id,
                commit_hash,
                provider,
                ..
            } if *provider == self.address() => {
                let mut state = self.state.lock().await;
                let Some(cid) = state.pending_commits.remove(commit_hash) else {
                    // A commit from a previous run of this identity; the cid
                    // is gone with the old process, nothing to reveal.
                    tracing::warn!(
                        "[PROVIDER] observed own commit for task {task_id} with no local cid; ignoring"
                    );
                    return Ok(());
                };
                state.tracked.insert(
                    *task_id,
                    TrackedTask {
                        cid,
                        escrow_seen: false,
                        retry_streak: 0,
                        next_attempt_at: Instant::now(),
                    },
                );
                tracing::info!("[PROVIDER] tracking committed task {task_id}");
                Ok(())
            }
            MarketEvent::FundsLocked { task_id, .. } => {
                let is_tracked = {
                    let mut state = self.state.lock().await;
                    match state.tracked.get_mut(task_id) {
                        Some(entry) => {
                            entry.escrow_seen = true;
                            true
                        }
                        None => false,
                    }
                };
                if is_tracked {
                    // Escrow in place: reveal is now worth attempting.
                    let _ = self.try_reveal(*task_id).await?;
                }
                Ok(())
            }
            MarketEvent::TaskFinalized { task_id, .. } => {
                let is_tracked = { self.state.lock().await.tracked.contains_key(task_id) };
                if is_tracked {
                    let _ = self.try_settle(*task_id).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
