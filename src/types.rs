use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// On-ledger task lifecycle. Transitions are monotonic and one-directional,
/// except Disputed which may resolve to Settled or Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Committed,
    Revealed,
    Validated,
    Settled,
    Disputed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Committed => "committed",
            TaskState::Revealed => "revealed",
            TaskState::Validated => "validated",
            TaskState::Settled => "settled",
            TaskState::Disputed => "disputed",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Terminal states need no further client-side action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Settled | TaskState::Cancelled)
    }
}

/// The unit of exchange: a provider's committed artifact moving through the
/// commit -> reveal -> validate -> settle lifecycle. Read-only mirror of the
/// ledger record; this layer never owns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub commit_hash: B256,
    pub provider: Address,
    pub market_id: u64,
    pub stake: U256,
    pub state: TaskState,
    /// Content address, empty until Revealed.
    pub cid: Option<String>,
    pub reveal_deadline: u64,
    pub validation_deadline: u64,
    /// 0-100, set at most once, present from Validated onward.
    pub final_score: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    Locked,
    Released,
    Disputed,
    Refunded,
}

impl EscrowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowState::Locked => "locked",
            EscrowState::Released => "released",
            EscrowState::Disputed => "disputed",
            EscrowState::Refunded => "refunded",
        }
    }
}

/// Buyer funds locked against a task. Cannot reach Released/Refunded before
/// the task is Validated or the deadline lapses; the ledger enforces this,
/// clients only observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escrow {
    pub task_id: u64,
    pub buyer: Address,
    pub provider: Address,
    pub amount: U256,
    pub state: EscrowState,
    pub dispute_deadline: u64,
}

/// One oracle's opinion. Append-only, never mutated, many per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSubmission {
    pub task_id: u64,
    pub oracle: Address,
    pub score: u8,
    pub signature: Bytes,
    pub timestamp: u64,
}

/// Dedup key guaranteeing at-most-once dispatch across overlapping poll
/// windows. Lives only in process memory; handlers stay idempotent so a
/// post-restart re-scan is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessedEventKey {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Derived, client-side view of how far a task's verification has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusStage {
    Collecting,
    ConsensusReached,
    Finalized,
}

impl ConsensusStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusStage::Collecting => "collecting",
            ConsensusStage::ConsensusReached => "consensus-reached",
            ConsensusStage::Finalized => "finalized",
        }
    }
}

/// Logical market events decoded from ledger logs. Field sets mirror the
/// ledger contract's event declarations, not any particular wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    TaskCommitted {
        task_id: u64,
        commit_hash: B256,
        provider: Address,
        market_id: u64,
        stake: U256,
        timestamp: u64,
    },
    TaskRevealed {
        task_id: u64,
        cid: String,
        timestamp: u64,
    },
    FundsLocked {
        task_id: u64,
        buyer: Address,
        provider: Address,
        amount: U256,
        timestamp: u64,
    },
    VerificationSubmitted {
        task_id: u64,
        oracle: Address,
        score: u8,
        timestamp: u64,
    },
    TaskFinalized {
        task_id: u64,
        final_score: u8,
        verifiers: Vec<Address>,
        timestamp: u64,
    },
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::TaskCommitted { .. } => EventKind::TaskCommitted,
            MarketEvent::TaskRevealed { .. } => EventKind::TaskRevealed,
            MarketEvent::FundsLocked { .. } => EventKind::FundsLocked,
            MarketEvent::VerificationSubmitted { .. } => EventKind::VerificationSubmitted,
            MarketEvent::TaskFinalized { .. } => EventKind::TaskFinalized,
        }
    }

    pub fn task_id(&self) -> u64 {
        match self {
            MarketEvent::TaskCommitted { task_id, .. }
            | MarketEvent::TaskRevealed { task_id, .. }
            | MarketEvent::FundsLocked { task_id, .. }
            | MarketEvent::VerificationSubmitted { task_id, .. }
            | MarketEvent::TaskFinalized { task_id, .. } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskCommitted,
    TaskRevealed,
    FundsLocked,
    VerificationSubmitted,
    TaskFinalized,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::TaskCommitted,
        EventKind::TaskRevealed,
        EventKind::FundsLocked,
        EventKind::VerificationSubmitted,
        EventKind::TaskFinalized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCommitted => "TaskCommitted",
            EventKind::TaskRevealed => "TaskRevealed",
            EventKind::FundsLocked => "FundsLocked",
            EventKind::VerificationSubmitted => "VerificationSubmitted",
            EventKind::TaskFinalized => "TaskFinalized",
        }
    }
}

/// A raw log entry as returned by the gateway. The payload keeps the decoded
/// event fields as JSON so one shape serves both the RPC gateway (ABI-decoded
/// upstream) and the in-process ledger; parsing into a [`MarketEvent`] happens
/// in the ingestion loop where per-log failures can be isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub payload: serde_json::Value,
}

impl LogEntry {
    pub fn key(&self) -> ProcessedEventKey {
        ProcessedEventKey {
            block_number: self.block_number,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }
}

fn payload_u64(payload: &serde_json::Value, field: &str) -> Result<u64, ParseError> {
    payload
        .get(field)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ParseError::new(format!("missing or non-integer field `{field}`")))
}

fn payload_u8(payload: &serde_json::Value, field: &str) -> Result<u8, ParseError> {
    let raw = payload_u64(payload, field)?;
    u8::try_from(raw).map_err(|_| ParseError::new(format!("field `{field}`={raw} exceeds u8")))
}

fn payload_str<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str, ParseError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::new(format!("missing or non-string field `{field}`")))
}

fn payload_address(payload: &serde_json::Value, field: &str) -> Result<Address, ParseError> {
    let raw = payload_str(payload, field)?;
    raw.parse::<Address>()
        .map_err(|e| ParseError::new(format!("field `{field}`: invalid address `{raw}`: {e}")))
}

fn payload_u256(payload: &serde_json::Value, field: &str) -> Result<U256, ParseError> {
    let raw = payload_str(payload, field)?;
    crate::utils::hex::to_u256(raw)
        .ok_or_else(|| ParseError::new(format!("field `{field}`: invalid amount `{raw}`")))
}

fn payload_b256(payload: &serde_json::Value, field: &str) -> Result<B256, ParseError> {
    let raw = payload_str(payload, field)?;
    raw.parse::<B256>()
        .map_err(|e| ParseError::new(format!("field `{field}`: invalid hash `{raw}`: {e}")))
}

/// Decode one log payload into a logical event. A failure here is contained
/// to the single log by the ingestion loop; it never aborts a batch.
pub fn parse_event(entry: &LogEntry) -> Result<MarketEvent, ParseError> {
    let payload = &entry.payload;
    let name = payload_str(payload, "event")?;
    match name {
        "TaskCommitted" => Ok(MarketEvent::TaskCommitted {
            task_id: payload_u64(payload, "taskId")?,
            commit_hash: payload_b256(payload, "commitHash")?,
            provider: payload_address(payload, "provider")?,
            market_id: payload_u64(payload, "marketId")?,
            stake: payload_u256(payload, "stake")?,
            timestamp: payload_u64(payload, "timestamp")?,
        }),
        "TaskRevealed" => Ok(MarketEvent::TaskRevealed {
            task_id: payload_u64(payload, "taskId")?,
            cid: payload_str(payload, "cid")?.to_string(),
            timestamp: payload_u64(payload, "timestamp")?,
        }),
        "FundsLocked" => Ok(MarketEvent::FundsLocked {
            task_id: payload_u64(payload, "taskId")?,
            buyer: payload_address(payload, "buyer")?,
            provider: payload_address(payload, "provider")?,
            amount: payload_u256(payload, "amount")?,
            timestamp: payload_u64(payload, "timestamp")?,
        }),
        "VerificationSubmitted" => Ok(MarketEvent::VerificationSubmitted {
            task_id: payload_u64(payload, "taskId")?,
            oracle: payload_address(payload, "oracle")?,
            score: payload_u8(payload, "score")?,
            timestamp: payload_u64(payload, "timestamp")?,
        }),
        "TaskFinalized" => {
            let verifiers = payload
                .get("verifiers")
                .and_then(|v| v.as_array())
                .ok_or_else(|| ParseError::new("missing field `verifiers`"))?
                .iter()
                .map(|entry| {
                    entry
                        .as_str()
                        .ok_or_else(|| ParseError::new("non-string verifier entry"))?
                        .parse::<Address>()
                        .map_err(|e| ParseError::new(format!("invalid verifier address: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MarketEvent::TaskFinalized {
                task_id: payload_u64(payload, "taskId")?,
                final_score: payload_u8(payload, "finalScore")?,
                verifiers,
                timestamp: payload_u64(payload, "timestamp")?,
            })
        }
        other => Err(ParseError::new(format!("unknown event `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(payload: serde_json::Value) -> LogEntry {
        LogEntry {
            block_number: 12,
            tx_hash: B256::repeat_byte(0xab),
            log_index: 0,
            payload,
        }
    }

    #[test]
    fn test_parse_task_revealed() {
        let parsed = parse_event(&entry(json!({
            "event": "TaskRevealed",
            "taskId": 7,
            "cid": "bafy-demo",
            "timestamp": 1_700_000_000u64,
        })))
        .unwrap();
        assert_eq!(
            parsed,
            MarketEvent::TaskRevealed {
                task_id: 7,
                cid: "bafy-demo".to_string(),
                timestamp: 1_700_000_000,
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let err = parse_event(&entry(json!({"event": "Upgraded", "taskId": 1}))).unwrap_err();
        assert!(err.context.contains("unknown event"));
    }

    #[test]
    fn test_parse_rejects_score_overflow() {
        let err = parse_event(&entry(json!({
            "event": "VerificationSubmitted",
            "taskId": 3,
            "oracle": "0x00000000000000000000000000000000000000aa",
            "score": 512,
            "timestamp": 5,
        })))
        .unwrap_err();
        assert!(err.context.contains("exceeds u8"));
    }

    #[test]
    fn test_log_entry_key_identity() {
        let a = entry(json!({}));
        let mut b = a.clone();
        assert_eq!(a.key(), b.key());
        b.log_index = 1;
        assert_ne!(a.key(), b.key());
    }
}
