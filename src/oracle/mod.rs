//! Independent verification agents.
//!
//! Each node runs the same protocol, unaware of its peers except through the
//! ledger: consume TaskRevealed, fetch the artifact, score it, submit a
//! signed verification, and watch consensus to know when to let go. N nodes
//! with distinct identities give the market redundancy; nothing here
//! coordinates them.

pub mod scorer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{keccak256, Address, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::RoleConfig;
use crate::consensus::ConsensusAggregator;
use crate::content::ContentStore;
use crate::error::MarketError;
use crate::gateway::{Ledger, LedgerCall};
use crate::ingest::EventSink;
use crate::submit::{SubmitOutcome, TransactionSubmitter};
use crate::types::MarketEvent;

use scorer::Scorer;

#[derive(Debug, Clone)]
struct QueueEntry {
    cid: String,
    retry_streak: u32,
    next_attempt_at: Instant,
    submitted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleNodeStatus {
    pub name: String,
    pub address: String,
    pub registered: bool,
    pub queued: usize,
    pub verified: u64,
    pub last_error: Option<String>,
}

struct OracleState {
    queue: HashMap<u64, QueueEntry>,
    /// Tasks this node already attempted; guards against double submission
    /// across overlapping event deliveries.
    attempted: std::collections::HashSet<u64>,
    verified: u64,
    registered: bool,
    last_error: Option<String>,
}

pub struct OracleNode {
    name: String,
    signer: PrivateKeySigner,
    ledger: Arc<dyn Ledger>,
    submitter: TransactionSubmitter,
    scorer: Arc<dyn Scorer>,
    content: Arc<dyn ContentStore>,
    consensus: Arc<ConsensusAggregator>,
    cfg: RoleConfig,
    /// Market expectations handed to the scorer. Market-metadata lookup is a
    /// collaborator concern; the node carries the hint it was configured with.
    expectations: String,
    state: Mutex<OracleState>,
}

impl OracleNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        signer: PrivateKeySigner,
        ledger: Arc<dyn Ledger>,
        submitter: TransactionSubmitter,
        scorer: Arc<dyn Scorer>,
        content: Arc<dyn ContentStore>,
        consensus: Arc<ConsensusAggregator>,
        cfg: RoleConfig,
        expectations: String,
    ) -> Self {
        Self {
            name: format!("oracle-{index}"),
            signer,
            ledger,
            submitter,
            scorer,
            content,
            consensus,
            cfg,
            expectations,
            state: Mutex::new(OracleState {
                queue: HashMap::new(),
                attempted: std::collections::HashSet::new(),
                verified: 0,
                registered: false,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn action_interval(&self) -> Duration {
        self.cfg.action_tick_interval
    }

    /// Registration is logged, never gated on: the ledger-side policy decides
    /// whether an unregistered submission is accepted.
    pub async fn check_registration(&self) {
        match self.ledger.is_active_oracle(self.address()).await {
            Ok(true) => {
                self.state.lock().await.registered = true;
                tracing::info!("[ORACLE] {} ({:#x}) is registered", self.name, self.address());
            }
            Ok(false) => {
                tracing::warn!(
                    "[ORACLE] {} ({:#x}) is not registered; submitting anyway, the ledger decides",
                    self.name,
                    self.address()
                );
            }
            Err(err) => {
                tracing::warn!(
                    "[ORACLE] {} registration check failed: {err}; continuing",
                    self.name
                );
            }
        }
    }

    pub async fn status(&self) -> OracleNodeStatus {
        let state = self.state.lock().await;
        OracleNodeStatus {
            name: self.name.clone(),
            address: format!("{:#x}", self.address()),
            registered: state.registered,
            queued: state.queue.len(),
            verified: state.verified,
            last_error: state.last_error.clone(),
        }
    }

    fn sign_score(&self, task_id: u64, score: u8) -> Result<Bytes, MarketError> {
        let mut message = Vec::with_capacity(8 + 1 + 20);
        message.extend_from_slice(&task_id.to_be_bytes());
        message.push(score);
        message.extend_from_slice(self.address().as_slice());
        let digest = keccak256(&message);
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| crate::error::NetworkError::Transport(format!("signing failed: {e}")))?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }

    /// One pass over the local queue. Called from the role action-timer;
    /// non-reentrant per node.
    pub async fn tick(&self) {
        let due: Vec<(u64, QueueEntry)> = {
            let state = self.state.lock().await;
            let now = Instant::now();
            state
                .queue
                .iter()
                .filter(|(_, entry)| entry.next_attempt_at <= now)
                .map(|(id, entry)| (*id, entry.clone()))
                .collect()
        };

        for (task_id, entry) in due {
            if entry.submitted {
                self.watch_consensus(task_id).await;
            } else {
                self.attempt_verification(task_id, &entry.cid).await;
            }
        }
    }

    /// Steps 1-5 of the node protocol for one task.
    async fn attempt_verification(&self, task_id: u64, cid: &str) {
        // Submission window check before any expensive work.
        match self.ledger.can_validate(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    "[ORACLE] {} abandoning task {task_id}: validation window closed",
                    self.name
                );
                crate::utils::audit::record(
                    "oracle",
                    "abandon-window-closed",
                    Some(serde_json::json!({"node": self.name.clone(), "taskId": task_id})),
                );
                self.drop_task(task_id).await;
                return;
            }
            Err(err) => {
                self.defer(task_id, format!("canValidate failed: {err}")).await;
                return;
            }
        }

        let artifact = match self.content.get(cid).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.defer(task_id, format!("artifact fetch failed: {err}")).await;
                return;
            }
        };

        let breakdown = match self.scorer.score(&artifact, &self.expectations).await {
            Ok(b) => b,
            Err(err) => {
                self.defer(task_id, format!("scoring failed: {err}")).await;
                return;
            }
        };
        let score = breakdown.composite();
        tracing::info!(
            "[ORACLE] {} scored task {task_id}: quality={:.2} alignment={:.2} integrity={:.2} -> {score}",
            self.name,
            breakdown.quality,
            breakdown.alignment,
            breakdown.integrity,
        );

        let signature = match self.sign_score(task_id, score) {
            Ok(sig) => sig,
            Err(err) => {
                self.defer(task_id, format!("signing failed: {err}")).await;
                return;
            }
        };

        let call = LedgerCall::SubmitVerification {
            task_id,
            score,
            signature,
        };
        match self.submitter.execute(&call, U256::ZERO).await {
            Ok(SubmitOutcome::Confirmed(_)) => {
                let mut state = self.state.lock().await;
                state.attempted.insert(task_id);
                state.verified += 1;
                state.last_error = None;
                if let Some(entry) = state.queue.get_mut(&task_id) {
                    entry.submitted = true;
                    entry.retry_streak = 0;
                    entry.next_attempt_at = Instant::now();
                }
            }
            Ok(SubmitOutcome::Pending(_)) => {
                // The submission may still land; treat as submitted and let
                // consensus observation decide. Resubmitting blindly risks a
                // duplicate-vote revert.
                let mut state = self.state.lock().await;
                state.attempted.insert(task_id);
                if let Some(entry) = state.queue.get_mut(&task_id) {
                    entry.submitted = true;
                }
            }
            Err(MarketError::Revert(revert)) => {
                // Deterministic rejection (window raced shut, duplicate vote,
                // policy refusal). Not retriable verbatim.
                tracing::warn!(
                    "[ORACLE] {} submission for task {task_id} rejected: {revert}",
                    self.name
                );
                crate::utils::audit::record(
                    "oracle",
                    "submission-rejected",
                    Some(serde_json::json!({
                        "node": self.name.clone(),
                        "taskId": task_id,
                        "reason": revert.reason.clone(),
                    })),
                );
                let mut state = self.state.lock().await;
                state.attempted.insert(task_id);
                state.queue.remove(&task_id);
            }
            Err(err) => {
                self.defer(task_id, format!("submission failed: {err}")).await;
            }
        }
    }

    /// Step 6: after submitting, watch until consensus then drop.
    async fn watch_consensus(&self, task_id: u64) {
        match self.consensus.is_settled_or_expired(task_id).await {
            Ok(true) => {
                tracing::info!(
                    "[ORACLE] {} done with task {task_id}: consensus settled or window expired",
                    self.name
                );
                self.drop_task(task_id).await;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(
                    "[ORACLE] {} consensus poll for task {task_id} failed: {err}",
                    self.name
                );
            }
        }
    }

    async fn drop_task(&self, task_id: u64) {
        self.state.lock().await.queue.remove(&task_id);
    }

    async fn defer(&self, task_id: u64, reason: String) {
        tracing::warn!("[ORACLE] {} deferring task {task_id}: {reason}", self.name);
        let mut state = self.state.lock().await;
        state.last_error = Some(reason);
        if let Some(entry) = state.queue.get_mut(&task_id) {
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
impl EventSink for OracleNode {
    fn name(&self) -> &'static str {
        "oracle"
    }

    async fn deliver(&self, event: &MarketEvent) -> Result<(), MarketError> {
        match event {
            MarketEvent::TaskRevealed { task_id, cid, .. } => {
                let mut state = self.state.lock().await;
                // Local dedup: never enqueue a task already attempted, even
                // when overlapping poll windows re-deliver the reveal.
                if state.attempted.contains(task_id) || state.queue.contains_key(task_id) {
                    return Ok(());
                }
                state.queue.insert(
                    *task_id,
                    QueueEntry {
                        cid: cid.clone(),
                        retry_streak: 0,
                        next_attempt_at: Instant::now(),
                        submitted: false,
                    },
                );
                tracing::info!(
                    "[ORACLE] {} queued task {task_id} for verification (cid {cid})",
                    self.name
                );
                Ok(())
            }
            MarketEvent::VerificationSubmitted { task_id, oracle, .. }
                if *oracle == self.address() =>
            {
                // Our own submission observed on the ledger, possibly from a
                // previous run of this identity.
                let mut state = self.state.lock().await;
                state.attempted.insert(*task_id);
                if let Some(entry) = state.queue.get_mut(task_id) {
                    entry.submitted = true;
                }
                Ok(())
            }
            MarketEvent::TaskFinalized { task_id, .. } => {
                self.drop_task(*task_id).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
