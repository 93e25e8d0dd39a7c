//! Startup status emission for operator visibility.

use crate::config::Config;

pub fn emit_startup_status(config: &Config) {
    let roles = {
        let mut enabled: Vec<&str> = Vec::new();
        if config.provider_private_key.is_some() {
            enabled.push("provider");
        }
        if config.buyer_private_key.is_some() {
            enabled.push("buyer");
        }
        if !config.oracle_private_keys.is_empty() {
            enabled.push("oracles");
        }
        if enabled.is_empty() {
            "none (observer mode)".to_string()
        } else {
            enabled.join("+")
        }
    };

    tracing::info!(
        "[OPS] Runtime resolved: chain={} contract={:#x} roles={} oracles={} health={}",
        config.chain_id,
        config.market_contract,
        roles,
        config.oracle_count,
        if config.health_enabled {
            config.health_bind_addr.as_str()
        } else {
            "disabled"
        },
    );
    tracing::info!(
        "[OPS] Consensus parameters: quorum={}bps tolerance={}bps window={:?}",
        config.consensus.quorum_bps,
        config.consensus.score_tolerance_bps,
        config.consensus.submission_window,
    );
    tracing::info!(
        "[OPS] Ingestion: poll={:?} lookback={} blocks, range cap={} blocks",
        config.ingest.poll_interval,
        config.ingest.lookback_blocks,
        config.ingest.max_log_range_blocks,
    );
    tracing::info!(
        "[OPS] Submission: gas safety={}bps rpc timeout={:?} confirmation timeout={:?}",
        config.submitter.gas_safety_bps,
        config.submitter.rpc_call_timeout,
        config.submitter.confirmation_timeout,
    );
}
