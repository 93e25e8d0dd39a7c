use alloy::primitives::U256;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("network error: {0}")]
    Net(#[from] NetworkError),
    #[error("revert: {0}")]
    Revert(#[from] RevertError),
    #[error("funding error: {0}")]
    Funding(#[from] InsufficientFundsError),
    #[error("stale state: {0}")]
    Stale(#[from] StaleStateError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MarketError {
    /// Transient errors return control to the previous lifecycle state with a
    /// bounded backoff instead of escalating.
    pub fn is_transient(&self) -> bool {
        match self {
            MarketError::Net(net) => net.is_retryable(),
            MarketError::Funding(_) => false,
            MarketError::Revert(revert) => revert.is_time_window(),
            MarketError::Stale(_) => false,
            MarketError::Parse(_) => false,
            MarketError::Config(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("call timed out after {waited_ms}ms: {context}")]
    Timeout { waited_ms: u64, context: String },
    #[error("log range too wide: asked {asked} blocks, provider cap {cap}")]
    RangeTooWide { asked: u64, cap: u64 },
}

impl NetworkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Transport(message) => is_retryable_rpc_error(message),
            NetworkError::Timeout { .. } => true,
            // Range errors are not retried verbatim; the caller must narrow the query.
            NetworkError::RangeTooWide { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertPhase {
    /// Caught by preflight simulation; nothing was submitted.
    Simulation,
    /// A mined transaction reverted on-ledger. Gas was spent.
    Execution,
}

impl std::fmt::Display for RevertPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevertPhase::Simulation => write!(f, "simulation"),
            RevertPhase::Execution => write!(f, "execution"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{phase} revert: {reason}")]
pub struct RevertError {
    pub phase: RevertPhase,
    pub reason: String,
}

impl RevertError {
    pub fn simulated(reason: impl Into<String>) -> Self {
        Self {
            phase: RevertPhase::Simulation,
            reason: reason.into(),
        }
    }

    pub fn executed(reason: impl Into<String>) -> Self {
        Self {
            phase: RevertPhase::Execution,
            reason: reason.into(),
        }
    }

    /// Reverts caused by a not-yet-open or already-closed time window may
    /// resolve on their own; callers are allowed to schedule a delayed
    /// re-attempt for these and only these.
    pub fn is_time_window(&self) -> bool {
        let reason = self.reason.to_ascii_lowercase();
        ["window", "deadline", "too early", "too late", "not yet open"]
            .iter()
            .any(|needle| reason.contains(needle))
    }
}

#[derive(Debug, Error)]
#[error("insufficient funds: required {required} wei, available {available} wei")]
pub struct InsufficientFundsError {
    pub required: U256,
    pub available: U256,
    /// Whether a faucet top-up was attempted before giving up.
    pub topped_up: bool,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StaleStateError(pub String);

#[derive(Debug, Error)]
#[error("{context}")]
pub struct ParseError {
    pub context: String,
}

impl ParseError {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub fn is_retryable_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    let non_retryable = [
        "method not found",
        "-32601",
        "invalid params",
        "-32602",
        "execution reverted",
        "revert",
        "unknown variant",
        "did not match any variant",
        "parse error",
        "-32700",
    ];
    !non_retryable.iter().any(|needle| msg.contains(needle))
}

pub fn is_rate_limited_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("429")
        || msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("compute units per second")
        || msg.contains("throughput")
}

/// Nonce conflicts mean another submission from the same signer landed first;
/// the cached nonce must be resynced before retrying.
pub fn is_nonce_conflict(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    ["nonce too low", "account has nonce", "already known", "already imported"]
        .iter()
        .any(|needle| msg.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_revert_is_not_transient() {
        let err = MarketError::Revert(RevertError::simulated("escrow: not locked"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_time_window_revert_is_transient() {
        let err = MarketError::Revert(RevertError::simulated("reveal window not yet open"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_transport_errors_retry_unless_reverted() {
        assert!(NetworkError::Transport("connection reset by peer".into()).is_retryable());
        assert!(!NetworkError::Transport("execution reverted: bad task".into()).is_retryable());
    }

    #[test]
    fn test_nonce_conflict_classification() {
        assert!(is_nonce_conflict("Nonce too low: next nonce 14"));
        assert!(is_nonce_conflict("ALREADY KNOWN"));
        assert!(!is_nonce_conflict("gas required exceeds allowance"));
    }
}
