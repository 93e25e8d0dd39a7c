//! The ledger seam. Everything above this module speaks in typed reads and
//! [`LedgerCall`] mutations; everything below it is either JSON-RPC against
//! the live market contract ([`rpc::RpcGateway`]) or the deterministic
//! in-process ledger used by tests and shadow runs ([`sim::SimLedger`]).
//!
//! No caching anywhere on this seam: every call reflects ledger state at
//! call time.

pub mod rpc;
pub mod sim;

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::{MarketError, NetworkError};
use crate::types::{Escrow, LogEntry, Task};

/// State-changing market-contract calls. The payable amount travels in
/// [`SubmitOptions::value`], not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    CommitTask {
        commit_hash: B256,
        market_id: u64,
    },
    RevealTask {
        task_id: u64,
        cid: String,
    },
    LockFunds {
        task_id: u64,
    },
    ReleaseFunds {
        task_id: u64,
    },
    SubmitVerification {
        task_id: u64,
        score: u8,
        signature: Bytes,
    },
    RaiseDispute {
        task_id: u64,
    },
    RefundEscrow {
        task_id: u64,
    },
}

impl LedgerCall {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::CommitTask { .. } => "commitTask",
            LedgerCall::RevealTask { .. } => "revealTask",
            LedgerCall::LockFunds { .. } => "lockFunds",
            LedgerCall::ReleaseFunds { .. } => "releaseFunds",
            LedgerCall::SubmitVerification { .. } => "submitVerification",
            LedgerCall::RaiseDispute { .. } => "raiseDispute",
            LedgerCall::RefundEscrow { .. } => "refundEscrow",
        }
    }

    /// Task the call touches; commits create their task and have none yet.
    pub fn task_id(&self) -> Option<u64> {
        match self {
            LedgerCall::CommitTask { .. } => None,
            LedgerCall::RevealTask { task_id, .. }
            | LedgerCall::LockFunds { task_id }
            | LedgerCall::ReleaseFunds { task_id }
            | LedgerCall::SubmitVerification { task_id, .. }
            | LedgerCall::RaiseDispute { task_id }
            | LedgerCall::RefundEscrow { task_id } => Some(*task_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    /// Populated when the ledger (or a replay simulation) yields a decoded
    /// revert reason for a failed transaction.
    pub revert_reason: Option<String>,
    pub gas_used: u64,
}

/// Outcome of a bounded confirmation wait. `Pending` means the wait timed
/// out; the caller decides whether to keep waiting or resubmit, and must
/// never resubmit blindly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed(TxReceipt),
    Pending(TxHandle),
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub value: U256,
    /// Explicit nonce, sequenced per signer by the submitter. `None` lets the
    /// gateway fetch the current transaction count.
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // -- chain state ------------------------------------------------------

    async fn block_number(&self) -> Result<u64, NetworkError>;
    async fn ledger_timestamp(&self) -> Result<u64, NetworkError>;
    async fn balance_of(&self, address: Address) -> Result<U256, NetworkError>;
    async fn transaction_count(&self, address: Address) -> Result<u64, NetworkError>;
    async fn gas_price(&self) -> Result<u128, NetworkError>;

    // -- market reads -----------------------------------------------------

    async fn get_task(&self, task_id: u64) -> Result<Option<Task>, NetworkError>;
    async fn get_escrow(&self, task_id: u64) -> Result<Option<Escrow>, NetworkError>;
    async fn can_reveal(&self, task_id: u64) -> Result<bool, NetworkError>;
    async fn can_validate(&self, task_id: u64) -> Result<bool, NetworkError>;
    async fn submission_count(&self, task_id: u64) -> Result<u64, NetworkError>;
    async fn has_consensus(&self, task_id: u64) -> Result<bool, NetworkError>;
    async fn time_remaining(&self, task_id: u64) -> Result<u64, NetworkError>;
    async fn is_active_oracle(&self, oracle: Address) -> Result<bool, NetworkError>;
    async fn active_oracle_count(&self) -> Result<u64, NetworkError>;

    // -- mutations --------------------------------------------------------

    async fn estimate_gas(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<u64, NetworkError>;

    /// Dry-run the call at current ledger state. A [`RevertError`] here means
    /// the same submission would burn gas and fail; it is the primary defense
    /// against broken calls.
    ///
    /// [`RevertError`]: crate::error::RevertError
    async fn simulate(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<(), MarketError>;

    async fn submit(
        &self,
        from: Address,
        call: &LedgerCall,
        opts: SubmitOptions,
    ) -> Result<TxHandle, MarketError>;

    async fn wait_for_confirmation(
        &self,
        handle: &TxHandle,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, NetworkError>;

    // -- logs -------------------------------------------------------------

    /// Market-contract logs in `[from_block, to_block]`, ascending by
    /// (block, log index). Ranges wider than the provider cap fail with
    /// [`NetworkError::RangeTooWide`]; callers split and retry.
    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_names_match_contract_methods() {
        let call = LedgerCall::RevealTask {
            task_id: 3,
            cid: "bafy".into(),
        };
        assert_eq!(call.name(), "revealTask");
        assert_eq!(call.task_id(), Some(3));

        let commit = LedgerCall::CommitTask {
            commit_hash: B256::ZERO,
            market_id: 1,
        };
        assert_eq!(commit.task_id(), None);
    }
}
