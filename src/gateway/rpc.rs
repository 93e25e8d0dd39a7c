//! JSON-RPC implementation of the [`Ledger`] seam against the deployed
//! market contract.

use std::collections::HashMap;
use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::types::eth::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::Http;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::time::{sleep, timeout};

use crate::error::{MarketError, NetworkError, RevertError};
use crate::types::{Escrow, EscrowState, LogEntry, Task, TaskState};
use crate::utils::error::compact_error_message;

use super::{ConfirmationStatus, Ledger, LedgerCall, SubmitOptions, TxHandle, TxReceipt};

pub type HttpProvider = RootProvider<Http<Client>>;

const RPC_ERR_MAX_LEN: usize = 260;
const RECEIPT_POLL_INTERVAL_MS: u64 = 1_000;

alloy::sol! {
    interface ITaskBoard {
        struct TaskView {
            uint64 id;
            bytes32 commitHash;
            address provider;
            uint64 marketId;
            uint256 stake;
            uint8 state;
            string cid;
            uint64 revealDeadline;
            uint64 validationDeadline;
            uint8 finalScore;
            bool hasFinalScore;
            bool exists;
        }

        struct EscrowView {
            uint64 taskId;
            address buyer;
            address provider;
            uint256 amount;
            uint8 state;
            uint64 disputeDeadline;
            bool exists;
        }

        function commitTask(bytes32 commitHash, uint64 marketId) external payable returns (uint64 taskId);
        function revealTask(uint64 taskId, string cid) external;
        function lockFunds(uint64 taskId) external payable;
        function releaseFunds(uint64 taskId) external;
        function submitVerification(uint64 taskId, uint8 score, bytes signature) external;
        function raiseDispute(uint64 taskId) external;
        function refundEscrow(uint64 taskId) external;

        function getTask(uint64 taskId) external view returns (TaskView task);
        function getEscrow(uint64 taskId) external view returns (EscrowView escrow);
        function canReveal(uint64 taskId) external view returns (bool allowed);
        function canValidate(uint64 taskId) external view returns (bool allowed);
        function submissionCount(uint64 taskId) external view returns (uint64 count);
        function hasConsensus(uint64 taskId) external view returns (bool reached);
        function timeRemaining(uint64 taskId) external view returns (uint64 seconds_);
        function isActiveOracle(address oracle) external view returns (bool active);
        function activeOracleCount() external view returns (uint64 count);

        event TaskCommitted(uint64 indexed taskId, bytes32 commitHash, address indexed provider, uint64 marketId, uint256 stake, uint64 timestamp);
        event TaskRevealed(uint64 indexed taskId, string cid, uint64 timestamp);
        event FundsLocked(uint64 indexed taskId, address indexed buyer, address indexed provider, uint256 amount, uint64 timestamp);
        event VerificationSubmitted(uint64 indexed taskId, address indexed oracle, uint8 score, uint64 timestamp);
        event TaskFinalized(uint64 indexed taskId, uint8 finalScore, address[] verifiers, uint64 timestamp);
    }
}

fn encode_call(call: &LedgerCall) -> Bytes {
    match call {
        LedgerCall::CommitTask {
            commit_hash,
            market_id,
        } => ITaskBoard::commitTaskCall {
            commitHash: *commit_hash,
            marketId: *market_id,
        }
        .abi_encode()
        .into(),
        LedgerCall::RevealTask { task_id, cid } => ITaskBoard::revealTaskCall {
            taskId: *task_id,
            cid: cid.clone(),
        }
        .abi_encode()
        .into(),
        LedgerCall::LockFunds { task_id } => ITaskBoard::lockFundsCall { taskId: *task_id }
            .abi_encode()
            .into(),
        LedgerCall::ReleaseFunds { task_id } => ITaskBoard::releaseFundsCall { taskId: *task_id }
            .abi_encode()
            .into(),
        LedgerCall::SubmitVerification {
            task_id,
            score,
            signature,
        } => ITaskBoard::submitVerificationCall {
            taskId: *task_id,
            score: *score,
            signature: signature.clone(),
        }
        .abi_encode()
        .into(),
        LedgerCall::RaiseDispute { task_id } => ITaskBoard::raiseDisputeCall { taskId: *task_id }
            .abi_encode()
            .into(),
        LedgerCall::RefundEscrow { task_id } => ITaskBoard::refundEscrowCall { taskId: *task_id }
            .abi_encode()
            .into(),
    }
}

fn decode_task_state(raw: u8) -> TaskState {
    match raw {
        0 => TaskState::Committed,
        1 => TaskState::Revealed,
        2 => TaskState::Validated,
        3 => TaskState::Settled,
        4 => TaskState::Disputed,
        _ => TaskState::Cancelled,
    }
}

fn decode_escrow_state(raw: u8) -> EscrowState {
    match raw {
        0 => EscrowState::Locked,
        1 => EscrowState::Released,
        2 => EscrowState::Disputed,
        _ => EscrowState::Refunded,
    }
}

/// Pull a human reason out of a provider error string. Providers disagree on
/// framing; the marker scan covers geth, erigon and the common proxies.
pub fn extract_revert_reason(message: &str) -> String {
    for marker in [
        "execution reverted:",
        "execution reverted with reason:",
        "revert:",
        "reverted:",
    ] {
        if let Some(idx) = message.find(marker) {
            let tail = message[idx + marker.len()..].trim();
            if !tail.is_empty() {
                return compact_error_message(tail, RPC_ERR_MAX_LEN);
            }
        }
    }
    if message.to_ascii_lowercase().contains("revert") {
        return "reverted without reason".to_string();
    }
    compact_error_message(message, RPC_ERR_MAX_LEN)
}

fn is_revert_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("revert")
}

pub struct RpcGateway {
    provider: HttpProvider,
    contract: Address,
    chain_id: u64,
    call_timeout: Duration,
    signers: HashMap<Address, PrivateKeySigner>,
}

impl RpcGateway {
    pub fn new(
        rpc_url: &str,
        contract: Address,
        chain_id: u64,
        call_timeout: Duration,
        signers: Vec<PrivateKeySigner>,
    ) -> anyhow::Result<Self> {
        let url = rpc_url
            .parse::<reqwest::Url>()
            .map_err(|e| anyhow::anyhow!("invalid ledger RPC url `{rpc_url}`: {e}"))?;
        // Bare RootProvider on purpose: nonce, gas, and fees are filled
        // explicitly by the submitter, never by provider-side magic.
        let provider = RootProvider::new(ClientBuilder::default().http(url));
        let signers = signers
            .into_iter()
            .map(|signer| (signer.address(), signer))
            .collect();
        Ok(Self {
            provider,
            contract,
            chain_id,
            call_timeout,
            signers,
        })
    }

    fn net_err(&self, context: &str, err: impl std::fmt::Display) -> NetworkError {
        NetworkError::Transport(format!(
            "{context}: {}",
            compact_error_message(&err.to_string(), RPC_ERR_MAX_LEN)
        ))
    }

    async fn bounded<F, T>(&self, context: &'static str, fut: F) -> Result<T, NetworkError>
    where
        F: std::future::IntoFuture<Output = Result<T, alloy::transports::TransportError>>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.net_err(context, err)),
            Err(_) => Err(NetworkError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: context.to_string(),
            }),
        }
    }

    fn read_request(&self, input: Bytes) -> TransactionRequest {
        TransactionRequest::default()
            .with_to(self.contract)
            .with_input(input)
    }

    /// eth_call a view method and hand back the raw return bytes.
    async fn view(&self, context: &'static str, input: Bytes) -> Result<Bytes, NetworkError> {
        let request = self.read_request(input);
        match timeout(self.call_timeout, self.provider.call(&request)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(self.net_err(context, err)),
            Err(_) => Err(NetworkError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: context.to_string(),
            }),
        }
    }

    fn decode_log_entry(log: &alloy::rpc::types::eth::Log) -> Option<LogEntry> {
        let block_number = log.block_number?;
        let tx_hash = log.transaction_hash?;
        let log_index = log.log_index?;
        let topic0 = log.topic0()?;

        let payload = if *topic0 == ITaskBoard::TaskCommitted::SIGNATURE_HASH {
            let decoded = ITaskBoard::TaskCommitted::decode_log(&log.inner, true).ok()?;
            json!({
                "event": "TaskCommitted",
                "taskId": decoded.data.taskId,
                "commitHash": format!("{:#x}", decoded.data.commitHash),
                "provider": format!("{:#x}", decoded.data.provider),
                "marketId": decoded.data.marketId,
                "stake": decoded.data.stake.to_string(),
                "timestamp": decoded.data.timestamp,
            })
        } else if *topic0 == ITaskBoard::TaskRevealed::SIGNATURE_HASH {
            let decoded = ITaskBoard::TaskRevealed::decode_log(&log.inner, true).ok()?;
            json!({
                "event": "TaskRevealed",
                "taskId": decoded.data.taskId,
                "cid": decoded.data.cid,
                "timestamp": decoded.data.timestamp,
            })
        } else if *topic0 == ITaskBoard::FundsLocked::SIGNATURE_HASH {
            let decoded = ITaskBoard::FundsLocked::decode_log(&log.inner, true).ok()?;
            json!({
                "event": "FundsLocked",
                "taskId": decoded.data.taskId,
                "buyer": format!("{:#x}", decoded.data.buyer),
                "provider": format!("{:#x}", decoded.data.provider),
                "amount": decoded.data.amount.to_string(),
                "timestamp": decoded.data.timestamp,
            })
        } else if *topic0 == ITaskBoard::VerificationSubmitted::SIGNATURE_HASH {
            let decoded = ITaskBoard::VerificationSubmitted::decode_log(&log.inner, true).ok()?;
            json!({
                "event": "VerificationSubmitted",
                "taskId": decoded.data.taskId,
                "oracle": format!("{:#x}", decoded.data.oracle),
                "score": decoded.data.score,
                "timestamp": decoded.data.timestamp,
            })
        } else if *topic0 == ITaskBoard::TaskFinalized::SIGNATURE_HASH {
            let decoded = ITaskBoard::TaskFinalized::decode_log(&log.inner, true).ok()?;
            let verifiers: Vec<String> = decoded
                .data
                .verifiers
                .iter()
                .map(|addr| format!("{addr:#x}"))
                .collect();
            json!({
                "event": "TaskFinalized",
                "taskId": decoded.data.taskId,
                "finalScore": decoded.data.finalScore,
                "verifiers": verifiers,
                "timestamp": decoded.data.timestamp,
            })
        } else {
            // Foreign log on the contract address (proxy admin noise etc).
            return None;
        };

        Some(LogEntry {
            block_number,
            tx_hash,
            log_index,
            payload,
        })
    }
}

#[async_trait]
impl Ledger for RpcGateway {
    async fn block_number(&self) -> Result<u64, NetworkError> {
        self.bounded("eth_blockNumber", self.provider.get_block_number())
            .await
    }

    async fn ledger_timestamp(&self) -> Result<u64, NetworkError> {
        let block = self
            .bounded(
                "eth_getBlockByNumber",
                self.provider.get_block(
                    alloy::eips::BlockNumberOrTag::Latest.into(),
                    alloy::rpc::types::eth::BlockTransactionsKind::Hashes,
                ),
            )
            .await?;
        block
            .map(|b| b.header.timestamp)
            .ok_or_else(|| NetworkError::Transport("latest block unavailable".to_string()))
    }

    async fn balance_of(&self, address: Address) -> Result<U256, NetworkError> {
        self.bounded("eth_getBalance", self.provider.get_balance(address))
            .await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, NetworkError> {
        self.bounded(
            "eth_getTransactionCount",
            self.provider.get_transaction_count(address),
        )
        .await
    }

    async fn gas_price(&self) -> Result<u128, NetworkError> {
        self.bounded("eth_gasPrice", self.provider.get_gas_price())
            .await
    }

    async fn get_task(&self, task_id: u64) -> Result<Option<Task>, NetworkError> {
        let input = ITaskBoard::getTaskCall { taskId: task_id }.abi_encode();
        let raw = self.view("getTask", input.into()).await?;
        let decoded = ITaskBoard::getTaskCall::abi_decode_returns(&raw, true)
            .map_err(|e| self.net_err("getTask decode", e))?;
        let view = decoded.task;
        if !view.exists {
            return Ok(None);
        }
        Ok(Some(Task {
            id: view.id,
            commit_hash: view.commitHash,
            provider: view.provider,
            market_id: view.marketId,
            stake: view.stake,
            state: decode_task_state(view.state),
            cid: if view.cid.is_empty() {
                None
            } else {
                Some(view.cid)
            },
            reveal_deadline: view.revealDeadline,
            validation_deadline: view.validationDeadline,
            final_score: view.hasFinalScore.then_some(view.finalScore),
        }))
    }

    async fn get_escrow(&self, task_id: u64) -> Result<Option<Escrow>, NetworkError> {
        let input = ITaskBoard::getEscrowCall { taskId: task_id }.abi_encode();
        let raw = self.view("getEscrow", input.into()).await?;
        let decoded = ITaskBoard::getEscrowCall::abi_decode_returns(&raw, true)
            .map_err(|e| self.net_err("getEscrow decode", e))?;
        let view = decoded.escrow;
        if !view.exists {
            return Ok(None);
        }
        Ok(Some(Escrow {
            task_id: view.taskId,
            buyer: view.buyer,
            provider: view.provider,
            amount: view.amount,
            state: decode_escrow_state(view.state),
            dispute_deadline: view.disputeDeadline,
        }))
    }

    async fn can_reveal(&self, task_id: u64) -> Result<bool, NetworkError> {
        let input = ITaskBoard::canRevealCall { taskId: task_id }.abi_encode();
        let raw = self.view("canReveal", input.into()).await?;
        ITaskBoard::canRevealCall::abi_decode_returns(&raw, true)
            .map(|r| r.allowed)
            .map_err(|e| self.net_err("canReveal decode", e))
    }

    async fn can_validate(&self, task_id: u64) -> Result<bool, NetworkError> {
        let input = ITaskBoard::canValidateCall { taskId: task_id }.abi_encode();
        let raw = self.view("canValidate", input.into()).await?;
        ITaskBoard::canValidateCall::abi_decode_returns(&raw, true)
            .map(|r| r.allowed)
            .map_err(|e| self.net_err("canValidate decode", e))
    }

    async fn submission_count(&self, task_id: u64) -> Result<u64, NetworkError> {
        let input = ITaskBoard::submissionCountCall { taskId: task_id }.abi_encode();
        let raw = self.view("submissionCount", input.into()).await?;
        ITaskBoard::submissionCountCall::abi_decode_returns(&raw, true)
            .map(|r| r.count)
            .map_err(|e| self.net_err("submissionCount decode", e))
    }

    async fn has_consensus(&self, task_id: u64) -> Result<bool, NetworkError> {
        let input = ITaskBoard::hasConsensusCall { taskId: task_id }.abi_encode();
        let raw = self.view("hasConsensus", input.into()).await?;
        ITaskBoard::hasConsensusCall::abi_decode_returns(&raw, true)
            .map(|r| r.reached)
            .map_err(|e| self.net_err("hasConsensus decode", e))
    }

    async fn time_remaining(&self, task_id: u64) -> Result<u64, NetworkError> {
        let input = ITaskBoard::timeRemainingCall { taskId: task_id }.abi_encode();
        let raw = self.view("timeRemaining", input.into()).await?;
        ITaskBoard::timeRemainingCall::abi_decode_returns(&raw, true)
            .map(|r| r.seconds_)
            .map_err(|e| self.net_err("timeRemaining decode", e))
    }

    async fn is_active_oracle(&self, oracle: Address) -> Result<bool, NetworkError> {
        let input = ITaskBoard::isActiveOracleCall { oracle }.abi_encode();
        let raw = self.view("isActiveOracle", input.into()).await?;
        ITaskBoard::isActiveOracleCall::abi_decode_returns(&raw, true)
            .map(|r| r.active)
            .map_err(|e| self.net_err("isActiveOracle decode", e))
    }

    async fn active_oracle_count(&self) -> Result<u64, NetworkError> {
        let input = ITaskBoard::activeOracleCountCall {}.abi_encode();
        let raw = self.view("activeOracleCount", input.into()).await?;
        ITaskBoard::activeOracleCountCall::abi_decode_returns(&raw, true)
            .map(|r| r.count)
            .map_err(|e| self.net_err("activeOracleCount decode", e))
    }

    async fn estimate_gas(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<u64, NetworkError> {
        let request = self
            .read_request(encode_call(call))
            .with_from(from)
            .with_value(value);
        self.bounded("eth_estimateGas", self.provider.estimate_gas(&request))
            .await
    }

    async fn simulate(
        &self,
        from: Address,
        call: &LedgerCall,
        value: U256,
    ) -> Result<(), MarketError> {
        let request = self
            .read_request(encode_call(call))
            .with_from(from)
            .with_value(value);
        match timeout(self.call_timeout, self.provider.call(&request)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                let message = err.to_string();
                if is_revert_message(&message) {
                    Err(RevertError::simulated(extract_revert_reason(&message)).into())
                } else {
                    Err(MarketError::Net(self.net_err("eth_call simulate", err)))
                }
            }
            Err(_) => Err(MarketError::Net(NetworkError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: format!("simulate {}", call.name()),
            })),
        }
    }

    async fn submit(
        &self,
        from: Address,
        call: &LedgerCall,
        opts: SubmitOptions,
    ) -> Result<TxHandle, MarketError> {
        let signer = self.signers.get(&from).ok_or_else(|| {
            MarketError::Net(NetworkError::Transport(format!(
                "no signer registered for {from:#x}"
            )))
        })?;

        let nonce = match opts.nonce {
            Some(n) => n,
            None => self.transaction_count(from).await?,
        };
        let gas_limit = match opts.gas_limit {
            Some(g) => g,
            None => self.estimate_gas(from, call, opts.value).await?,
        };
        // Fee policy: double the spot price as the ceiling, a tenth as the
        // tip. Coordination traffic is not latency-priced; overshooting the
        // ceiling only burns the safety margin the balance check reserved.
        let gas_price = self
            .bounded("eth_gasPrice", self.provider.get_gas_price())
            .await?;
        let max_priority_fee = (gas_price / 10).max(1);
        let max_fee = gas_price.saturating_mul(2).max(max_priority_fee);

        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(self.contract)
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_value(opts.value)
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(max_fee)
            .with_max_priority_fee_per_gas(max_priority_fee)
            .with_input(encode_call(call));

        let wallet = EthereumWallet::from(signer.clone());
        let envelope = request
            .build(&wallet)
            .await
            .map_err(|e| MarketError::Net(self.net_err("tx signing", e)))?;
        let raw = envelope.encoded_2718();

        match timeout(
            self.call_timeout,
            self.provider.send_raw_transaction(&raw),
        )
        .await
        {
            Ok(Ok(pending)) => Ok(TxHandle {
                hash: *pending.tx_hash(),
            }),
            Ok(Err(err)) => {
                let message = err.to_string();
                if is_revert_message(&message) {
                    Err(RevertError::simulated(extract_revert_reason(&message)).into())
                } else {
                    Err(MarketError::Net(self.net_err("eth_sendRawTransaction", err)))
                }
            }
            Err(_) => Err(MarketError::Net(NetworkError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: format!("submit {}", call.name()),
            })),
        }
    }

    async fn wait_for_confirmation(
        &self,
        handle: &TxHandle,
        wait: Duration,
    ) -> Result<ConfirmationStatus, NetworkError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match timeout(
                self.call_timeout,
                self.provider.get_transaction_receipt(handle.hash),
            )
            .await
            {
                Ok(Ok(Some(receipt))) => {
                    return Ok(ConfirmationStatus::Confirmed(TxReceipt {
                        tx_hash: handle.hash,
                        block_number: receipt.block_number.unwrap_or_default(),
                        success: receipt.status(),
                        revert_reason: None,
                        gas_used: receipt.gas_used as u64,
                    }));
                }
                Ok(Ok(None)) => {}
                // Transient lookup failures only burn wait budget; the
                // transaction may still confirm underneath them.
                Ok(Err(err)) => {
                    tracing::debug!(
                        "[GATEWAY] receipt poll for {:#x} failed: {}",
                        handle.hash,
                        compact_error_message(&err.to_string(), RPC_ERR_MAX_LEN)
                    );
                }
                Err(_) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(ConfirmationStatus::Pending(*handle));
            }
            sleep(Duration::from_millis(RECEIPT_POLL_INTERVAL_MS)).await;
        }
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, NetworkError> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from_block)
            .to_block(to_block);
        let logs = match timeout(self.call_timeout, self.provider.get_logs(&filter)).await {
            Ok(Ok(logs)) => logs,
            Ok(Err(err)) => {
                let message = err.to_string().to_ascii_lowercase();
                // Provider-imposed range caps come back as plain errors; map
                // them so the ingestion loop can split the window.
                if message.contains("range") || message.contains("too many") {
                    return Err(NetworkError::RangeTooWide {
                        asked: to_block.saturating_sub(from_block).saturating_add(1),
                        cap: 0,
                    });
                }
                return Err(self.net_err("eth_getLogs", err));
            }
            Err(_) => {
                return Err(NetworkError::Timeout {
                    waited_ms: self.call_timeout.as_millis() as u64,
                    context: "eth_getLogs".to_string(),
                })
            }
        };

        let mut entries: Vec<LogEntry> = logs.iter().filter_map(Self::decode_log_entry).collect();
        entries.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_revert_reason_variants() {
        assert_eq!(
            extract_revert_reason("server returned an error: execution reverted: escrow: not locked"),
            "escrow: not locked"
        );
        assert_eq!(
            extract_revert_reason("transaction reverted"),
            "reverted without reason"
        );
    }

    #[test]
    fn test_encode_call_produces_distinct_selectors() {
        let reveal = encode_call(&LedgerCall::RevealTask {
            task_id: 1,
            cid: "bafy".into(),
        });
        let settle = encode_call(&LedgerCall::ReleaseFunds { task_id: 1 });
        assert_ne!(reveal[..4], settle[..4]);
    }

    #[test]
    fn test_task_state_decoding_covers_all_variants() {
        assert_eq!(decode_task_state(0), TaskState::Committed);
        assert_eq!(decode_task_state(3), TaskState::Settled);
        assert_eq!(decode_task_state(9), TaskState::Cancelled);
        assert_eq!(decode_escrow_state(2), EscrowState::Disputed);
    }
}
