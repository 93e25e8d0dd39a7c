//! Deterministic in-process ledger implementing the [`Ledger`] seam.
//!
//! Used by the integration suites and the `shadow_market` binary to rehearse
//! the full agent stack without a live chain. The market rules here (state
//! transitions, deadlines, and the median/quorum consensus math) emulate
//! what the deployed contract enforces; client code never calls into them
//! directly, it only observes them through the trait.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use serde_json::json;

use crate::error::{MarketError, NetworkError, RevertError};
use crate::types::{Escrow, EscrowState, LogEntry, Task, TaskState, VerificationSubmission};

use super::{ConfirmationStatus, Ledger, LedgerCall, SubmitOptions, TxHandle, TxReceipt};

const SIM_GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug, Clone)]
pub struct SimLedgerConfig {
    /// Timestamp advance per mined block.
    pub block_time_secs: u64,
    pub reveal_window_secs: u64,
    pub validation_window_secs: u64,
    pub dispute_window_secs: u64,
    pub quorum_bps: u64,
    pub score_tolerance_bps: u64,
    pub gas_per_call: u64,
    pub gas_price: u128,
}

impl Default for SimLedgerConfig {
    fn default() -> Self {
        Self {
            block_time_secs: 12,
            reveal_window_secs: 600,
            validation_window_secs: 600,
            dispute_window_secs: 600,
            quorum_bps: 6_667,
            score_tolerance_bps: 1_500,
            gas_per_call: 120_000,
            gas_price: 1_000_000_000,
        }
    }
}

/// Consensus snapshot as the contract computes it: consensus holds once at
/// least `quorum` submissions sit within the tolerance band around the
/// running median.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusSnapshot {
    pub has_consensus: bool,
    pub median: u8,
    pub in_band: usize,
    pub quorum: usize,
}

/// Round-half-up median of the submitted scores.
pub fn median_score(scores: &[u8]) -> u8 {
    if scores.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u16> = scores.iter().map(|s| *s as u16).collect();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid] as u8
    } else {
        ((sorted[mid - 1] + sorted[mid] + 1) / 2) as u8
    }
}

/// Quorum count for `active` oracles at `quorum_bps`, rounded half-up with a
/// floor of two: one opinion is never a consensus.
pub fn quorum_count(active: usize, quorum_bps: u64) -> usize {
    let rounded = (active as u64 * quorum_bps + 5_000) / 10_000;
    (rounded as usize).max(2)
}

pub fn consensus_snapshot(
    scores: &[u8],
    active_oracles: usize,
    quorum_bps: u64,
    tolerance_bps: u64,
) -> ConsensusSnapshot {
    let quorum = quorum_count(active_oracles.max(scores.len()), quorum_bps);
    let median = median_score(scores);
    // Integer-exact band check: |score - median| * 10000 <= median * tolerance_bps.
    let in_band = scores
        .iter()
        .filter(|score| {
            let diff = (**score as i64 - median as i64).unsigned_abs();
            diff * 10_000 <= median as u64 * tolerance_bps
        })
        .count();
    ConsensusSnapshot {
        has_consensus: !scores.is_empty() && in_band >= quorum,
        median,
        in_band,
        quorum,
    }
}

struct SimState {
    block_number: u64,
    timestamp: u64,
    tasks: BTreeMap<u64, Task>,
    escrows: HashMap<u64, Escrow>,
    submissions: HashMap<u64, Vec<VerificationSubmission>>,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    active_oracles: HashSet<Address>,
    logs: Vec<LogEntry>,
    receipts: HashMap<B256, TxReceipt>,
    next_task_id: u64,
    tx_counter: u64,
    next_log_index: u64,
    // Test hooks.
    fail_get_logs: u32,
    logs_ok_before_fail: u32,
    max_log_range: Option<u64>,
    hold_receipts: u32,
    submitted_calls: VecDeque<(Address, String)>,
}

pub struct SimLedger {
    cfg: SimLedgerConfig,
    state: Mutex<SimState>,
}

impl SimLedger {
    pub fn new(cfg: SimLedgerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(SimState {
                block_number: 1,
                timestamp: SIM_GENESIS_TIMESTAMP,
                tasks: BTreeMap::new(),
                escrows: HashMap::new(),
                submissions: HashMap::new(),
                balances: HashMap::new(),
                nonces: HashMap::new(),
                active_oracles: HashSet::new(),
                logs: Vec::new(),
                receipts: HashMap::new(),
                next_task_id: 1,
                tx_counter: 0,
                next_log_index: 0,
                fail_get_logs: 0,
                logs_ok_before_fail: 0,
                max_log_range: None,
                hold_receipts: 0,
                submitted_calls: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    // -- test/shadow harness hooks ---------------------------------------

    pub fn credit(&self, address: Address, amount: U256) {
        let mut state = self.lock();
        let entry = state.balances.entry(address).or_insert(U256::ZERO);
        *entry = entry.saturating_add(amount);
    }

    pub fn register_oracle(&self, oracle: Address) {
        self.lock().active_oracles.insert(oracle);
    }

    pub fn advance_blocks(&self, count: u64) {
        let mut state = self.lock();
        state.block_number += count;
        state.timestamp += count * self.cfg.block_time_secs;
    }

    pub fn advance_time(&self, secs: u64) {
        let mut state = self.lock();
        let blocks = (secs / self.cfg.block_time_secs.max(1)).max(1);
        state.block_number += blocks;
        state.timestamp += secs;
    }

    /// Make the next `count` getLogs queries fail with a transport error.
    pub fn fail_next_get_logs(&self, count: u32) {
        let mut state = self.lock();
        state.fail_get_logs = count;
        state.logs_ok_before_fail = 0;
    }

    /// Serve `skip` getLogs queries, then fail the following `count`.
    pub fn fail_get_logs_after(&self, skip: u32, count: u32) {
        let mut state = self.lock();
        state.logs_ok_before_fail = skip;
        state.fail_get_logs = count;
    }

    /// Enforce a provider-style range cap on getLogs queries.
    pub fn set_max_log_range(&self, cap: u64) {
        self.lock().max_log_range = Some(cap);
    }

    /// Make receipts for the next `count` submissions invisible until the
    /// hold is released, so confirmation waits time out as Pending.
    pub fn hold_next_receipts(&self, count: u32) {
        self.lock().hold_receipts = count;
    }

    /// Names of calls accepted by `submit`, oldest first. Drains the record.
    pub fn drain_submitted_calls(&self) -> Vec<(Address, String)> {
        self.lock().submitted_calls.drain(..).collect()
    }

    pub fn submitted_call_count(&self) -> usize {
        self.lock().submitted_calls.len()
    }

    pub fn current_timestamp(&self) -> u64 {
        self.lock().timestamp
    }

    pub fn task_snapshot(&self, task_id: u64) -> Option<Task> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn submissions_for(&self, task_id: u64) -> Vec<VerificationSubmission> {
        self.lock()
            .submissions
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    // -- contract emulation ----------------------------------------------

    fn gas_cost(&self) -> U256 {
        U256::from(self.cfg.gas_per_call as u128 * self.cfg.gas_price)
    }

    fn emit(state: &mut SimState, payload: serde_json::Value, tx_hash: B256) {
        let entry = LogEntry {
            block_number: state.block_number,
            tx_hash,
            log_index: state.next_log_index,
            payload,
        };
        state.next_log_index += 1;
        state.logs.push(entry);
    }

    /// Apply one state-changing call against `state`. `tx_hash` is zero for
    /// simulations, which run against a cloned state and emit nothing real.
    fn apply_call(
        &self,
        state: &mut SimState,
        from: Address,
        call: &LedgerCall,
        value: U256,
        tx_hash: B256,
    ) -> Result<(), RevertError> {
        let now = state.timestamp;
        match call {
            LedgerCall::CommitTask {
                commit_hash,
                market_id,
            } => {
                if value.is_zero() {
                    return Err(RevertError::executed("commit: zero stake"));
                }
                let task_id = state.next_task_id;
                state.next_task_id += 1;
                let task = Task {
                    id: task_id,
                    commit_hash: *commit_hash,
                    provider: from,
                    market_id: *market_id,
                    stake: value,
                    state: TaskState::Committed,
                    cid: None,
                    reveal_deadline: now + self.cfg.reveal_window_secs,
                    validation_deadline: now
                        + self.cfg.reveal_window_secs
                        + self.cfg.validation_window_secs,
                    final_score: None,
                };
                state.tasks.insert(task_id, task);
                Self::emit(
                    state,
                    json!({
                        "event": "TaskCommitted",
                        "taskId": task_id,
                        "commitHash": format!("{commit_hash:#x}"),
                        "provider": format!("{from:#x}"),
                        "marketId": market_id,
                        "stake": value.to_string(),
                        "timestamp": now,
                    }),
                    tx_hash,
                );
                Ok(())
            }
            LedgerCall::RevealTask { task_id, cid } => {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                if task.provider != from {
                    return Err(RevertError::executed("reveal: not the provider"));
                }
                if task.state != TaskState::Committed {
                    return Err(RevertError::executed("reveal: task not committed"));
                }
                if now > task.reveal_deadline {
                    return Err(RevertError::executed("reveal: window closed"));
                }
                if cid.is_empty() {
                    return Err(RevertError::executed("reveal: empty cid"));
                }
                task.state = TaskState::Revealed;
                task.cid = Some(cid.clone());
                let task_id = *task_id;
                Self::emit(
                    state,
                    json!({
                        "event": "TaskRevealed",
                        "taskId": task_id,
                        "cid": cid,
                        "timestamp": now,
                    }),
                    tx_hash,
                );
                Ok(())
            }
            LedgerCall::LockFunds { task_id } => {
                let task = state
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                if task.state.is_terminal() {
                    return Err(RevertError::executed("escrow: task closed"));
                }
                if state.escrows.contains_key(task_id) {
                    return Err(RevertError::executed("escrow: already locked"));
                }
                if value.is_zero() {
                    return Err(RevertError::executed("escrow: zero amount"));
                }
                let provider = task.provider;
                let escrow = Escrow {
                    task_id: *task_id,
                    buyer: from,
                    provider,
                    amount: value,
                    state: EscrowState::Locked,
                    dispute_deadline: task.validation_deadline + self.cfg.dispute_window_secs,
                };
                state.escrows.insert(*task_id, escrow);
                Self::emit(
                    state,
                    json!({
                        "event": "FundsLocked",
                        "taskId": task_id,
                        "buyer": format!("{from:#x}"),
                        "provider": format!("{provider:#x}"),
                        "amount": value.to_string(),
                        "timestamp": now,
                    }),
                    tx_hash,
                );
                Ok(())
            }
            LedgerCall::SubmitVerification {
                task_id,
                score,
                signature,
            } => {
                let task = state
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                if task.state != TaskState::Revealed {
                    return Err(RevertError::executed("verify: task not revealed"));
                }
                if now > task.validation_deadline {
                    return Err(RevertError::executed("verify: window closed"));
                }
                if *score > 100 {
                    return Err(RevertError::executed("verify: score out of range"));
                }
                let submissions = state.submissions.entry(*task_id).or_default();
                if submissions.iter().any(|s| s.oracle == from) {
                    return Err(RevertError::executed("verify: duplicate submission"));
                }
                submissions.push(VerificationSubmission {
                    task_id: *task_id,
                    oracle: from,
                    score: *score,
                    signature: signature.clone(),
                    timestamp: now,
                });
                let task_id = *task_id;
                let score = *score;
                Self::emit(
                    state,
                    json!({
                        "event": "VerificationSubmitted",
                        "taskId": task_id,
                        "oracle": format!("{from:#x}"),
                        "score": score,
                        "timestamp": now,
                    }),
                    tx_hash,
                );
                self.maybe_finalize(state, task_id, tx_hash);
                Ok(())
            }
            LedgerCall::ReleaseFunds { task_id } => {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                if task.state == TaskState::Settled {
                    return Err(RevertError::executed("settle: already settled"));
                }
                if task.state != TaskState::Validated {
                    return Err(RevertError::executed("settle: task not validated"));
                }
                let escrow = state
                    .escrows
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("escrow: none locked"))?;
                if escrow.state != EscrowState::Locked {
                    return Err(RevertError::executed("escrow: not locked"));
                }
                task.state = TaskState::Settled;
                escrow.state = EscrowState::Released;
                let provider = escrow.provider;
                let payout = escrow.amount.saturating_add(task.stake);
                let entry = state.balances.entry(provider).or_insert(U256::ZERO);
                *entry = entry.saturating_add(payout);
                Ok(())
            }
            LedgerCall::RaiseDispute { task_id } => {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                let escrow = state
                    .escrows
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("escrow: none locked"))?;
                if escrow.buyer != from {
                    return Err(RevertError::executed("dispute: not the buyer"));
                }
                if escrow.state != EscrowState::Locked {
                    return Err(RevertError::executed("dispute: escrow not locked"));
                }
                if matches!(task.state, TaskState::Validated | TaskState::Settled) {
                    return Err(RevertError::executed("dispute: task already validated"));
                }
                if now <= task.validation_deadline {
                    return Err(RevertError::executed("dispute: validation window still open"));
                }
                task.state = TaskState::Disputed;
                escrow.state = EscrowState::Disputed;
                escrow.dispute_deadline = now + self.cfg.dispute_window_secs;
                Ok(())
            }
            LedgerCall::RefundEscrow { task_id } => {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("task: unknown id"))?;
                let escrow = state
                    .escrows
                    .get_mut(task_id)
                    .ok_or_else(|| RevertError::executed("escrow: none locked"))?;
                if escrow.state != EscrowState::Disputed {
                    return Err(RevertError::executed("refund: escrow not disputed"));
                }
                if now <= escrow.dispute_deadline {
                    return Err(RevertError::executed("refund: dispute window still open"));
                }
                escrow.state = EscrowState::Refunded;
                task.state = TaskState::Cancelled;
                let buyer = escrow.buyer;
                let amount = escrow.amount;
                let entry = state.balances.entry(buyer).or_insert(U256::ZERO);
                *entry = entry.saturating_add(amount);
                Ok(())
            }
        }
    }

    /// Finalization rule: once consensus holds, the score locks in when every
    /// active oracle has spoken or the window has expired, whichever first.
    /// The contract performs this inline with the triggering submission.
    fn maybe_finalize(&self, state: &mut SimState, task_id: u64, tx_hash: B256) {
        let Some(task) = state.tasks.get(&task_id) else {
            return;
        };
        if task.state != TaskState::Revealed {
            return;
        }
        let submissions = match state.submissions.get(&task_id) {
            Some(s) if !s.is_empty() => s,
            _ => return,
        };
        let scores: Vec<u8> = submissions.iter().map(|s| s.score).collect();
        let active = state.active_oracles.len();
        let snapshot = consensus_snapshot(
            &scores,
            active,
            self.cfg.quorum_bps,
            self.cfg.score_tolerance_bps,
        );
        if !snapshot.has_consensus {
            return;
        }
        let all_submitted = active > 0 && submissions.len() >= active;
        let window_expired = state.timestamp > task.validation_deadline;
        if !all_submitted && !window_expired {
            return;
        }

        let verifiers: Vec<String> = submissions
            .iter()
            .map(|s| format!("{:#x}", s.oracle))
            .collect();
        let now = state.timestamp;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.state = TaskState::Validated;
            task.final_score = Some(snapshot.median);
        }
        Self::emit(
            state,
            json!({
                "event": "TaskFinalized",
                "taskId": task_id,
                "finalScore": snapshot.median,
                "verifiers": verifiers,
                "timestamp": now,
            }),
            tx_hash,
        );
    }

    fn clone_for_simulation(state: &SimState) -> SimState {
        SimState {
            block_number: state.block_number,
            timestamp: state.timestamp,
            tasks: state.tasks.clone(),
            escrows: state.escrows.clone(),
            submissions: state.submissions.clone(),
            balances: state.balances.clone(),
            nonces: state.nonces.clone(),
            active_oracles: state.active_oracles.clone(),
            logs: Vec::new(),
            receipts: HashMap::new(),
            next_task_id: state.next_task_id,
            tx_counter: state.tx_counter,
            next_log_index: 0,
            fail_get_logs: 0,
            logs_ok_before_fail: 0,
            max_log_range: None,
            hold_receipts: 0,
            submitted_calls: VecDeque::new(),
        }
    }
}

impl Default for SimLedger {
    fn default() -> Self {
        Self::new(SimLedgerConfig::default())
    }
}

#[async_trait]
impl Ledger for SimLedger {
    async fn block_number(&self) -> Result<u64, NetworkError> {
        Ok(self.lock().block_number)
    }

    async fn ledger_timestamp(&self) -> Result<u64, NetworkError> {
        Ok(self.lock().timestamp)
    }

    async fn balance_of(&self, address: Address) -> Result<U256, NetworkError> {
        Ok(self
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, NetworkError> {
        Ok(self.lock().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn gas_price(&self) -> Result<u128, NetworkError> {
        Ok(self.cfg.gas_price)
    }

    async fn get_task(&self, task_id: u64) -> Result<Option<Task>, NetworkError> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    async fn get_escrow(&self, task_id: u64) -> Result<Option<Escrow>, NetworkError> {
        Ok(self.lock().escrows.get(&task_id).cloned())
    }

    async fn can_reveal(&self, task_id: u64) -> Result<bool, NetworkError> {
        let state = self.lock();
        Ok(state
            .tasks
            .get(&task_id)
            .map(|task| task.state == TaskState::Committed && state.timestamp <= task.reveal_deadline)
            .unwrap_or(false))
    }

    async fn can_validate(&self, task_id: u64) -> Result<bool, NetworkError> {
        let state = self.lock();
        Ok(state
            .tasks
            .get(&task_id)
            .map(|task| {
                task.state == TaskState::Revealed && state.timestamp <= task.validation_deadline
            })
            .unwrap_or(false))
    }

    async fn submission_count(&self, task_id: u64) -> Result<u64, NetworkError> {
        Ok(self
            .lock()
            .submissions
            .get(&task_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn has_consensus(&self, task_id: u64) -> Result<bool, NetworkError> {
        let state = self.lock();
        if let Some(task) = state.tasks.get(&task_id) {
            if task.final_score.is_some() {
                return Ok(true);
            }
        }
        let scores: Vec<u8> = state
            .submissions
            .get(&task_id)
            .map(|subs| subs.iter().map(|s| s.score).collect())
            .unwrap_or_default();
        let snapshot = consensus_snapshot(
            &scores,
            state.active_oracles.len(),
            self.cfg.quorum_bps,
            self.cfg.score_tolerance_bps,
        );
        Ok(snapshot.has_consensus)
    }

    async fn time_remaining(&self, task_id: u64) -> Result<u64, NetworkError> {
        let state = self.lock();
        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(0);
        };
        let deadline = match task.state {
            TaskState::Committed => task.reveal_deadline,
            TaskState::Revealed => task.validation_deadline,
            _ => return Ok(0),
        };
        Ok(deadline.saturating_sub(state.timestamp))
    }

    async fn is_active_oracle(&self, oracle: Address) -> Result<bool, NetworkError> {
        Ok(self.lock().active_oracles.contains(&oracle))
    }

    async fn active_oracle_count(&self) -> Result<u64, NetworkError> {
        Ok(self.lock().active_oracles.len() as u64)
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _call: &LedgerCall,
        _value: U256,
    ) -> Result<u64, NetworkError> {
        Ok(self.cfg.gas_per_call)
    }

    async fn simulate(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<(), MarketError> {
        let state = self.lock();
        let mut scratch = Self::clone_for_simulation(&state);
        drop(state);
        self.apply_call(&mut scratch, from, call, value, B256::ZERO)
            .map_err(|revert| RevertError::simulated(revert.reason).into())
    }

    async fn submit(
        &self,
        from: Address,
        call: &LedgerCall,
        opts: SubmitOptions,
    ) -> Result<TxHandle, MarketError> {
        let mut state = self.lock();

        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if let Some(nonce) = opts.nonce {
            if nonce < expected {
                return Err(MarketError::Net(NetworkError::Transport(format!(
                    "nonce too low: expected {expected}, got {nonce}"
                ))));
            }
            if nonce > expected {
                return Err(MarketError::Net(NetworkError::Transport(format!(
                    "nonce gap: expected {expected}, got {nonce}"
                ))));
            }
        }

        let gas_cost = self.gas_cost();
        let needed = opts.value.saturating_add(gas_cost);
        let available = state.balances.get(&from).copied().unwrap_or(U256::ZERO);
        if available < needed {
            return Err(MarketError::Net(NetworkError::Transport(format!(
                "insufficient funds for gas * price + value: have {available}, want {needed}"
            ))));
        }

        // Mine: debit sender, advance one block, apply, record the receipt.
        {
            let entry = state.balances.entry(from).or_insert(U256::ZERO);
            *entry = entry.saturating_sub(needed);
        }
        *state.nonces.entry(from).or_insert(0) = expected + 1;
        state.block_number += 1;
        state.timestamp += self.cfg.block_time_secs;
        state.tx_counter += 1;
        let mut seed = [0u8; 28];
        seed[..8].copy_from_slice(&state.tx_counter.to_be_bytes());
        seed[8..].copy_from_slice(from.as_slice());
        let tx_hash = keccak256(seed);

        let result = self.apply_call(&mut state, from, call, opts.value, tx_hash);
        let (success, revert_reason) = match &result {
            Ok(()) => (true, None),
            Err(revert) => (false, Some(revert.reason.clone())),
        };
        if !success {
            // Failed transactions still consume gas but return the value.
            let entry = state.balances.entry(from).or_insert(U256::ZERO);
            *entry = entry.saturating_add(opts.value);
        } else {
            state
                .submitted_calls
                .push_back((from, call.name().to_string()));
        }

        let receipt = TxReceipt {
            tx_hash,
            block_number: state.block_number,
            success,
            revert_reason,
            gas_used: self.cfg.gas_per_call,
        };
        if state.hold_receipts > 0 {
            state.hold_receipts -= 1;
        } else {
            state.receipts.insert(tx_hash, receipt);
        }

        Ok(TxHandle { hash: tx_hash })
    }

    async fn wait_for_confirmation(
        &self,
        handle: &TxHandle,
        wait: Duration,
    ) -> Result<ConfirmationStatus, NetworkError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(receipt) = self.lock().receipts.get(&handle.hash).cloned() {
                return Ok(ConfirmationStatus::Confirmed(receipt));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ConfirmationStatus::Pending(*handle));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, NetworkError> {
        let mut state = self.lock();
        if state.fail_get_logs > 0 {
            if state.logs_ok_before_fail > 0 {
                state.logs_ok_before_fail -= 1;
            } else {
                state.fail_get_logs -= 1;
                return Err(NetworkError::Transport(
                    "connection reset by peer".to_string(),
                ));
            }
        }
        let asked = to_block.saturating_sub(from_block).saturating_add(1);
        if let Some(cap) = state.max_log_range {
            if asked > cap {
                return Err(NetworkError::RangeTooWide { asked, cap });
            }
        }
        let mut entries: Vec<LogEntry> = state
            .logs
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_rounds_half_up_on_even_sets() {
        assert_eq!(median_score(&[85, 88, 87]), 87);
        assert_eq!(median_score(&[85, 88]), 87);
        assert_eq!(median_score(&[80]), 80);
        assert_eq!(median_score(&[]), 0);
    }

    #[test]
    fn test_quorum_two_thirds_of_three_is_two() {
        assert_eq!(quorum_count(3, 6_667), 2);
        assert_eq!(quorum_count(4, 6_667), 3);
        assert_eq!(quorum_count(6, 6_667), 4);
        // Floor of two even for degenerate oracle sets.
        assert_eq!(quorum_count(1, 6_667), 2);
    }

    #[test]
    fn test_consensus_scenario_three_in_band_scores() {
        // Median 87, tolerance 15% -> 13.05; all of {85, 88, 87} in band.
        let snapshot = consensus_snapshot(&[85, 88, 87], 3, 6_667, 1_500);
        assert!(snapshot.has_consensus);
        assert_eq!(snapshot.median, 87);
        assert_eq!(snapshot.in_band, 3);
    }

    #[test]
    fn test_outlier_does_not_fake_consensus() {
        // {10, 90}: median 50, band 7.5 -> neither inside, no consensus.
        let snapshot = consensus_snapshot(&[10, 90], 3, 6_667, 1_500);
        assert!(!snapshot.has_consensus);
    }

    #[tokio::test]
    async fn test_commit_reveal_emits_ordered_logs() {
        let sim = SimLedger::default();
        let provider = Address::repeat_byte(0x11);
        sim.credit(provider, U256::from(10u64.pow(18)));

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

        sim.submit(
            provider,
            &LedgerCall::RevealTask {
                task_id: 1,
                cid: "bafy-artifact".into(),
            },
            SubmitOptions::default(),
        )
        .await
        .unwrap();

        let logs = sim.get_logs(0, 100).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].block_number < logs[1].block_number);
        assert_eq!(
            sim.task_snapshot(1).unwrap().state,
            TaskState::Revealed
        );
    }

    #[tokio::test]
    async fn test_reveal_after_deadline_reverts_with_window_reason() {
        let sim = SimLedger::default();
        let provider = Address::repeat_byte(0x11);
        sim.credit(provider, U256::from(10u64.pow(18)));
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

        sim.advance_time(100_000);

        let err = sim
            .simulate(
                provider,
                &LedgerCall::RevealTask {
                    task_id: 1,
                    cid: "bafy".into(),
                },
                U256::ZERO,
            )
            .await
            .unwrap_err();
        match err {
            MarketError::Revert(revert) => {
                assert!(revert.reason.contains("window"));
                assert!(revert.is_time_window());
            }
            other => panic!("expected revert, got {other:?}"),
        }
    }
}
