use std::env;
use std::time::Duration;

use alloy::primitives::Address;

use crate::error::{ConfigError, Result};

const DEFAULT_ORACLE_COUNT: usize = 3;
const MIN_ORACLE_COUNT: usize = 3;
const DEFAULT_QUORUM_BPS: u64 = 6_667; // 2/3
const DEFAULT_SCORE_TOLERANCE_BPS: u64 = 1_500; // 15% of the running median
const DEFAULT_SUBMISSION_WINDOW_SECS: u64 = 600;
const DEFAULT_TASK_CREATION_INTERVAL_SECS: u64 = 120;
const DEFAULT_EVENT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_LOOKBACK_BLOCKS: u64 = 1_000;
const DEFAULT_MAX_LOG_RANGE_BLOCKS: u64 = 2_000;
const DEFAULT_SEEN_WINDOW_BLOCKS: u64 = 10_000;
const DEFAULT_GAS_SAFETY_BPS: u64 = 12_000; // 1.2x
const DEFAULT_RPC_CALL_TIMEOUT_MS: u64 = 1_500;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ACTION_RETRY_BACKOFF_MS: u64 = 30_000;
const DEFAULT_ACTION_TICK_INTERVAL_MS: u64 = 2_000;
const DEFAULT_FAUCET_SETTLE_MS: u64 = 3_000;
const DEFAULT_HEALTH_BIND_ADDR: &str = "127.0.0.1:7180";

fn load_u64(var: &str, default: u64, min: u64, max: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn load_usize(var: &str, default: usize, min: usize, max: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn load_bool(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw
        .parse::<reqwest::Url>()
        .map_err(|e| ConfigError::Invalid(format!("{name} must be a valid URL, got `{raw}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

fn validate_private_key(name: &str, raw: &str) -> Result<()> {
    let trimmed = crate::utils::hex::clean_hex(raw);
    let hexish = trimmed.len() == 64 && trimmed.as_bytes().iter().all(|b| b.is_ascii_hexdigit());
    if !hexish {
        return Err(ConfigError::Invalid(format!(
            "{name} must be a 32-byte hex key (optionally 0x-prefixed)"
        ))
        .into());
    }
    Ok(())
}

/// Tunables for one event-ingestion loop.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    /// Cold-start lookback: the first tick scans `head - lookback_blocks`.
    pub lookback_blocks: u64,
    /// Ledger providers cap `getLogs` ranges; wider queries are split.
    pub max_log_range_blocks: u64,
    /// How far behind the watermark dedup keys are retained.
    pub seen_window_blocks: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_EVENT_POLL_INTERVAL_MS),
            lookback_blocks: DEFAULT_LOOKBACK_BLOCKS,
            max_log_range_blocks: DEFAULT_MAX_LOG_RANGE_BLOCKS,
            seen_window_blocks: DEFAULT_SEEN_WINDOW_BLOCKS,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(load_u64(
                "EVENT_POLL_INTERVAL_MS",
                DEFAULT_EVENT_POLL_INTERVAL_MS,
                250,
                120_000,
            )),
            lookback_blocks: load_u64("EVENT_LOOKBACK_BLOCKS", DEFAULT_LOOKBACK_BLOCKS, 0, 500_000),
            max_log_range_blocks: load_u64(
                "MAX_LOG_RANGE_BLOCKS",
                DEFAULT_MAX_LOG_RANGE_BLOCKS,
                1,
                100_000,
            ),
            seen_window_blocks: load_u64(
                "EVENT_SEEN_WINDOW_BLOCKS",
                DEFAULT_SEEN_WINDOW_BLOCKS,
                100,
                1_000_000,
            ),
        }
    }
}

/// Tunables for the transaction submitter.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Gas cost safety multiplier applied to the balance preflight, in bps.
    pub gas_safety_bps: u64,
    /// Bounded wait for a single RPC call.
    pub rpc_call_timeout: Duration,
    /// Bounded wait for inclusion. Distinct from the RPC timeout: this one
    /// tracks the ledger's block time, not the transport.
    pub confirmation_timeout: Duration,
    /// Transient-error retry attempts around submission.
    pub submit_retry_attempts: u32,
    /// How long to let a faucet top-up settle before the single re-check.
    pub faucet_settle: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            gas_safety_bps: DEFAULT_GAS_SAFETY_BPS,
            rpc_call_timeout: Duration::from_millis(DEFAULT_RPC_CALL_TIMEOUT_MS),
            confirmation_timeout: Duration::from_millis(DEFAULT_CONFIRMATION_TIMEOUT_MS),
            submit_retry_attempts: 3,
            faucet_settle: Duration::from_millis(DEFAULT_FAUCET_SETTLE_MS),
        }
    }
}

impl SubmitterConfig {
    pub fn from_env() -> Self {
        Self {
            gas_safety_bps: load_u64("GAS_SAFETY_MULTIPLIER_BPS", DEFAULT_GAS_SAFETY_BPS, 10_000, 30_000),
            rpc_call_timeout: Duration::from_millis(load_u64(
                "RPC_CALL_TIMEOUT_MS",
                DEFAULT_RPC_CALL_TIMEOUT_MS,
                250,
                20_000,
            )),
            confirmation_timeout: Duration::from_millis(load_u64(
                "CONFIRMATION_TIMEOUT_MS",
                DEFAULT_CONFIRMATION_TIMEOUT_MS,
                1_000,
                600_000,
            )),
            submit_retry_attempts: load_u64("SUBMIT_RETRY_ATTEMPTS", 3, 1, 10) as u32,
            faucet_settle: Duration::from_millis(load_u64(
                "FAUCET_SETTLE_MS",
                DEFAULT_FAUCET_SETTLE_MS,
                100,
                60_000,
            )),
        }
    }
}

/// Consensus observation parameters. The authoritative math lives in the
/// ledger contract; these mirror its deployed parameters so derived progress
/// reporting lines up with what the contract will decide.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub quorum_bps: u64,
    pub score_tolerance_bps: u64,
    pub submission_window: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_bps: DEFAULT_QUORUM_BPS,
            score_tolerance_bps: DEFAULT_SCORE_TOLERANCE_BPS,
            submission_window: Duration::from_secs(DEFAULT_SUBMISSION_WINDOW_SECS),
        }
    }
}

impl ConsensusConfig {
    pub fn from_env() -> Self {
        Self {
            quorum_bps: load_u64("CONSENSUS_QUORUM_BPS", DEFAULT_QUORUM_BPS, 5_000, 10_000),
            score_tolerance_bps: load_u64(
                "SCORE_TOLERANCE_BPS",
                DEFAULT_SCORE_TOLERANCE_BPS,
                100,
                5_000,
            ),
            submission_window: Duration::from_secs(load_u64(
                "SUBMISSION_WINDOW_SECS",
                DEFAULT_SUBMISSION_WINDOW_SECS,
                30,
                86_400,
            )),
        }
    }
}

/// Role-loop cadence and retry policy.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub action_tick_interval: Duration,
    /// Backoff before re-entering the previous state after a transient
    /// failure. Most causes (balance, timing window, RPC hiccup) are
    /// self-resolving.
    pub retry_backoff: Duration,
    pub task_creation_interval: Duration,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            action_tick_interval: Duration::from_millis(DEFAULT_ACTION_TICK_INTERVAL_MS),
            retry_backoff: Duration::from_millis(DEFAULT_ACTION_RETRY_BACKOFF_MS),
            task_creation_interval: Duration::from_secs(DEFAULT_TASK_CREATION_INTERVAL_SECS),
        }
    }
}

impl RoleConfig {
    pub fn from_env() -> Self {
        Self {
            action_tick_interval: Duration::from_millis(load_u64(
                "ACTION_TICK_INTERVAL_MS",
                DEFAULT_ACTION_TICK_INTERVAL_MS,
                100,
                60_000,
            )),
            retry_backoff: Duration::from_millis(load_u64(
                "ACTION_RETRY_BACKOFF_MS",
                DEFAULT_ACTION_RETRY_BACKOFF_MS,
                500,
                600_000,
            )),
            task_creation_interval: Duration::from_secs(load_u64(
                "TASK_CREATION_INTERVAL_SECS",
                DEFAULT_TASK_CREATION_INTERVAL_SECS,
                5,
                86_400,
            )),
        }
    }
}

/// Top-level configuration for the orchestrator binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub ledger_rpc_url: String,
    pub market_contract: Address,
    pub chain_id: u64,
    pub provider_private_key: Option<String>,
    pub buyer_private_key: Option<String>,
    pub oracle_private_keys: Vec<String>,
    pub oracle_count: usize,
    pub content_store_url: Option<String>,
    pub faucet_url: Option<String>,
    pub health_bind_addr: String,
    pub health_enabled: bool,
    pub ingest: IngestConfig,
    pub submitter: SubmitterConfig,
    pub consensus: ConsensusConfig,
    pub role: RoleConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let ledger_rpc_url = env::var("LEDGER_RPC_URL")
            .map_err(|_| ConfigError::Missing("LEDGER_RPC_URL must be set".to_string()))?;
        validate_http_url("LEDGER_RPC_URL", &ledger_rpc_url)?;

        let market_contract_raw = env::var("MARKET_CONTRACT")
            .map_err(|_| ConfigError::Missing("MARKET_CONTRACT must be set".to_string()))?;
        let market_contract = market_contract_raw.trim().parse::<Address>().map_err(|e| {
            ConfigError::Invalid(format!(
                "MARKET_CONTRACT must be an address, got `{market_contract_raw}`: {e}"
            ))
        })?;

        let chain_id_raw = env::var("CHAIN_ID")
            .map_err(|_| ConfigError::Missing("CHAIN_ID must be set".to_string()))?;
        let chain_id = chain_id_raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("CHAIN_ID must be a valid u64, got `{chain_id_raw}`"))
        })?;

        let provider_private_key = env::var("PROVIDER_PRIVATE_KEY").ok();
        if let Some(key) = provider_private_key.as_deref() {
            validate_private_key("PROVIDER_PRIVATE_KEY", key)?;
        }
        let buyer_private_key = env::var("BUYER_PRIVATE_KEY").ok();
        if let Some(key) = buyer_private_key.as_deref() {
            validate_private_key("BUYER_PRIVATE_KEY", key)?;
        }

        // Comma-separated list of distinct oracle identities; fan-out for
        // redundancy requires every node to carry its own key.
        let oracle_private_keys: Vec<String> = env::var("ORACLE_PRIVATE_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for (idx, key) in oracle_private_keys.iter().enumerate() {
            validate_private_key(&format!("ORACLE_PRIVATE_KEYS[{idx}]"), key)?;
        }

        let oracle_count = load_usize("ORACLE_COUNT", DEFAULT_ORACLE_COUNT, MIN_ORACLE_COUNT, 64);
        if !oracle_private_keys.is_empty() && oracle_private_keys.len() < oracle_count {
            return Err(ConfigError::Invalid(format!(
                "ORACLE_COUNT={} but only {} ORACLE_PRIVATE_KEYS provided",
                oracle_count,
                oracle_private_keys.len()
            ))
            .into());
        }

        let content_store_url = env::var("CONTENT_STORE_URL").ok();
        if let Some(url) = content_store_url.as_deref() {
            validate_http_url("CONTENT_STORE_URL", url)?;
        }
        let faucet_url = env::var("FAUCET_URL").ok();
        if let Some(url) = faucet_url.as_deref() {
            validate_http_url("FAUCET_URL", url)?;
        }

        Ok(Self {
            ledger_rpc_url,
            market_contract,
            chain_id,
            provider_private_key,
            buyer_private_key,
            oracle_private_keys,
            oracle_count,
            content_store_url,
            faucet_url,
            health_bind_addr: env::var("HEALTH_BIND_ADDR")
                .unwrap_or_else(|_| DEFAULT_HEALTH_BIND_ADDR.to_string()),
            health_enabled: load_bool("HEALTH_ENDPOINT_ENABLED", true),
            ingest: IngestConfig::from_env(),
            submitter: SubmitterConfig::from_env(),
            consensus: ConsensusConfig::from_env(),
            role: RoleConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_parameters() {
        let consensus = ConsensusConfig::default();
        assert_eq!(consensus.quorum_bps, 6_667);
        assert_eq!(consensus.score_tolerance_bps, 1_500);

        let submitter = SubmitterConfig::default();
        assert_eq!(submitter.gas_safety_bps, 12_000);
        assert!(submitter.confirmation_timeout > submitter.rpc_call_timeout);
    }

    #[test]
    fn test_validate_private_key_rejects_short_keys() {
        assert!(validate_private_key("TEST_KEY", "0xabcd").is_err());
        let ok = "11".repeat(32);
        assert!(validate_private_key("TEST_KEY", &ok).is_ok());
    }

    #[test]
    fn test_validate_http_url_rejects_ws() {
        assert!(validate_http_url("TEST_URL", "ws://localhost:8546").is_err());
        assert!(validate_http_url("TEST_URL", "http://localhost:8545").is_ok());
    }
}
