//! Buyer-side lifecycle: lock escrow for committed tasks in the markets this
//! buyer follows, then watch the clock. A task that never validates gets
//! disputed once its window lapses, and a dispute the network never resolves
//! becomes a refund claim.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::config::RoleConfig;
use crate::error::MarketError;
use crate::gateway::{Ledger, LedgerCall};
use crate::ingest::EventSink;
use crate::submit::TransactionSubmitter;
use crate::types::{EscrowState, MarketEvent, TaskState};

use super::{ActionOutcome, InFlightSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurchasePhase {
    /// Seen the commit, escrow not locked yet.
    Pending,
    /// Escrow locked, waiting on validation/settlement.
    Locked,
    /// Dispute raised, waiting out the dispute window.
    Disputed,
}

#[derive(Debug, Clone)]
struct Purchase {
    phase: PurchasePhase,
    retry_streak: u32,
    next_attempt_at: Instant,
}

struct BuyerState {
    purchases: HashMap<u64, Purchase>,
    completed: u64,
    refunded: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyerStatus {
    pub address: String,
    pub open_purchases: usize,
    pub completed: u64,
    pub refunded: u64,
    pub last_error: Option<String>,
}

pub struct BuyerController {
    ledger: Arc<dyn Ledger>,
    submitter: TransactionSubmitter,
    cfg: RoleConfig,
    /// Markets this buyer purchases from; empty set means every market.
    markets: HashSet<u64>,
    /// Escrow amount locked per purchase.
    purchase_amount: U256,
    in_flight: InFlightSet,
    state: Mutex<BuyerState>,
}

impl BuyerController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        submitter: TransactionSubmitter,
        cfg: RoleConfig,
        markets: HashSet<u64>,
        purchase_amount: U256,
    ) -> Self {
        Self {
            ledger,
            submitter,
            cfg,
            markets,
            purchase_amount,
            in_flight: InFlightSet::new(),
            state: Mutex::new(BuyerState {
                purchases: HashMap::new(),
                completed: 0,
                refunded: 0,
                last_error: None,
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.submitter.identity()
    }

    pub async fn status(&self) -> BuyerStatus {
        let state = self.state.lock().await;
        BuyerStatus {
            address: format!("{:#x}", self.address()),
            open_purchases: state.purchases.len(),
            completed: state.completed,
            refunded: state.refunded,
            last_error: state.last_error.clone(),
        }
    }

    fn follows_market(&self, market_id: u64) -> bool {
        self.markets.is_empty() || self.markets.contains(&market_id)
    }

    /// Lock escrow for a committed task. Idempotent: an existing escrow
    /// (ours or anyone's) is a skip, never a second lock.
    pub async fn try_lock_funds(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(_guard) = self.in_flight.try_claim(task_id) else {
            return Ok(ActionOutcome::SkippedInFlight);
        };

        let Some(task) = self.ledger.get_task(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        if task.state != TaskState::Committed {
            self.forget(task_id).await;
            return Ok(ActionOutcome::AbortedStale);
        }
        if self.ledger.get_escrow(task_id).await?.is_some() {
            crate::utils::audit::record(
                "buyer",
                "lock-skip-escrow-exists",
                Some(serde_json::json!({"taskId": task_id})),
            );
            let mut state = self.state.lock().await;
            if let Some(purchase) = state.purchases.get_mut(&task_id) {
                purchase.phase = PurchasePhase::Locked;
            }
            return Ok(ActionOutcome::SkippedAlreadyDone);
        }

        let call = LedgerCall::LockFunds { task_id };
        match self.submitter.execute(&call, self.purchase_amount).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.last_error = None;
                if let Some(purchase) = state.purchases.get_mut(&task_id) {
                    purchase.phase = PurchasePhase::Locked;
                    purchase.retry_streak = 0;
                }
                tracing::info!(
                    "[BUYER] locked {} against task {task_id}",
                    self.purchase_amount
                );
                Ok(ActionOutcome::Submitted)
            }
            Err(MarketError::Revert(revert)) if revert.reason.contains("already locked") => {
                tracing::info!("[BUYER] task {task_id} already has an escrow; skipping");
                Ok(ActionOutcome::SkippedAlreadyDone)
            }
            Err(err) if err.is_transient() => {
                self.defer(task_id, format!("lock deferred: {err}")).await;
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Raise a dispute once the validation window lapsed without a verdict.
    pub async fn try_dispute(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(_guard) = self.in_flight.try_claim(task_id) else {
            return Ok(ActionOutcome::SkippedInFlight);
        };

        let Some(task) = self.ledger.get_task(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        if matches!(task.state, TaskState::Validated | TaskState::Settled) {
            // The network came through after all.
            return Ok(ActionOutcome::AbortedStale);
        }
        if task.state == TaskState::Disputed {
            let mut state = self.state.lock().await;
            if let Some(purchase) = state.purchases.get_mut(&task_id) {
                purchase.phase = PurchasePhase::Disputed;
            }
            return Ok(ActionOutcome::SkippedAlreadyDone);
        }
        let now = self.ledger.ledger_timestamp().await?;
        if now <= task.validation_deadline {
            return Ok(ActionOutcome::SkippedNotReady);
        }

        let call = LedgerCall::RaiseDispute { task_id };
        match self.submitter.execute(&call, U256::ZERO).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.last_error = None;
                if let Some(purchase) = state.purchases.get_mut(&task_id) {
                    purchase.phase = PurchasePhase::Disputed;
                    purchase.retry_streak = 0;
                }
                tracing::warn!("[BUYER] disputed task {task_id}: validation window expired");
                crate::utils::audit::record(
                    "buyer",
                    "dispute-raised",
                    Some(serde_json::json!({"taskId": task_id})),
                );
                Ok(ActionOutcome::Submitted)
            }
            Err(err) if err.is_transient() => {
                self.defer(task_id, format!("dispute deferred: {err}")).await;
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Claim the refund once the dispute window lapsed unresolved.
    pub async fn try_refund(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(_guard) = self.in_flight.try_claim(task_id) else {
            return Ok(ActionOutcome::SkippedInFlight);
        };

        let Some(escrow) = self.ledger.get_escrow(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        match escrow.state {
            EscrowState::Refunded => {
                let mut state = self.state.lock().await;
                state.purchases.remove(&task_id);
                state.refunded += 1;
                return Ok(ActionOutcome::SkippedAlreadyDone);
            }
            EscrowState::Disputed => {}
            _ => return Ok(ActionOutcome::SkippedNotReady),
        }
        let now = self.ledger.ledger_timestamp().await?;
        if now <= escrow.dispute_deadline {
            return Ok(ActionOutcome::SkippedNotReady);
        }

        let call = LedgerCall::RefundEscrow { task_id };
        match self.submitter.execute(&call, U256::ZERO).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.purchases.remove(&task_id);
                state.refunded += 1;
                state.last_error = None;
                tracing::info!("[BUYER] refunded escrow for task {task_id}");
                Ok(ActionOutcome::Submitted)
            }
            Err(err) if err.is_transient() => {
                self.defer(task_id, format!("refund deferred: {err}")).await;
                Ok(ActionOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn tick(&self) {
        let due: Vec<(u64, PurchasePhase)> = {
            let state = self.state.lock().await;
            let now = Instant::now();
            state
                .purchases
                .iter()
                .filter(|(_, p)| p.next_attempt_at <= now)
                .map(|(id, p)| (*id, p.phase))
                .collect()
        };

        for (task_id, phase) in due {
            let result = match phase {
                PurchasePhase::Pending => self.try_lock_funds(task_id).await,
                PurchasePhase::Locked => self.watch_locked(task_id).await,
                PurchasePhase::Disputed => self.try_refund(task_id).await,
            };
            if let Err(err) = result {
                tracing::warn!("[BUYER] action for task {task_id} failed: {err}");
                self.state.lock().await.last_error = Some(err.to_string());
            }
        }
    }

    /// A locked purchase either completes with settlement or rots into a
    /// dispute; this decides which.
    async fn watch_locked(&self, task_id: u64) -> Result<ActionOutcome, MarketError> {
        let Some(task) = self.ledger.get_task(task_id).await? else {
            return Ok(ActionOutcome::SkippedNotReady);
        };
        match task.state {
            TaskState::Settled => {
                let mut state = self.state.lock().await;
                state.purchases.remove(&task_id);
                state.completed += 1;
                tracing::info!(
                    "[BUYER] purchase complete for task {task_id} (score {:?})",
                    task.final_score
                );
                Ok(ActionOutcome::SkippedAlreadyDone)
            }
            TaskState::Cancelled => {
                self.forget(task_id).await;
                Ok(ActionOutcome::SkippedAlreadyDone)
            }
            TaskState::Disputed => {
                let mut state = self.state.lock().await;
                if let Some(purchase) = state.purchases.get_mut(&task_id) {
                    purchase.phase = PurchasePhase::Disputed;
                }
                Ok(ActionOutcome::SkippedNotReady)
            }
            TaskState::Committed | TaskState::Revealed => {
                let now = self.ledger.ledger_timestamp().await?;
                if now > task.validation_deadline {
                    self.try_dispute(task_id).await
                } else {
                    Ok(ActionOutcome::SkippedNotReady)
                }
            }
            TaskState::Validated => Ok(ActionOutcome::SkippedNotReady),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.cfg.action_tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    tracing::info!("[BUYER] controller stopping");
                    return;
                }
            }
        }
    }

    async fn forget(&self, task_id: u64) {
        self.state.lock().await.purchases.remove(&task_id);
    }

    async fn defer(&self, task_id: u64, reason: String) {
        tracing::warn!("[BUYER] {reason}");
        let mut state = self.state.lock().await;
        state.last_error = Some(reason);
        if let Some(purchase) = state.purchases.get_mut(&task_id) {
            purchase.retry_streak = purchase.retry_streak.saturating_add(1);
            let backoff_ms = crate::utils::backoff::bounded_exponential_backoff_ms(
                self.cfg.retry_backoff.as_millis() as u64 / 8,
                purchase.retry_streak,
                self.cfg.retry_backoff.as_millis() as u64,
            );
            purchase.next_attempt_at = Instant::now() + Duration::from_millis(backoff_ms);
        }
    }
}

#[async_trait]
impl EventSink for BuyerController {
    fn name(&self) -> &'static str {
        "buyer"
    }

    async fn deliver(&self, event: &MarketEvent) -> Result<(), MarketError> {
        match event {
            MarketEvent::TaskCommitted {
                task_id,
                provider,
                market_id,
                ..
            } => {
                if *provider == self.address() || !self.follows_market(*market_id) {
                    return Ok(());
                }
                {
                    let mut state = self.state.lock().await;
                    if state.purchases.contains_key(task_id) {
                        return Ok(());
                    }
                    state.purchases.insert(
                        *task_id,
                        Purchase {
                            phase: PurchasePhase::Pending,
                            retry_streak: 0,
                            next_attempt_at: Instant::now(),
                        },
                    );
                }
                tracing::info!(
                    "[BUYER] queued purchase for task {task_id} in market {market_id}"
                );
                let _ = self.try_lock_funds(*task_id).await?;
                Ok(())
            }
            MarketEvent::FundsLocked { task_id, buyer, .. } if *buyer == self.address() => {
                let mut state = self.state.lock().await;
                if let Some(purchase) = state.purchases.get_mut(task_id) {
                    purchase.phase = PurchasePhase::Locked;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
