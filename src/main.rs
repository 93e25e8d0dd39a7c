use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;

use veridex::config::Config;
use veridex::consensus::ConsensusAggregator;
use veridex::content::{http::HttpStore, memory::MemoryStore, ContentStore};
use veridex::gateway::rpc::RpcGateway;
use veridex::gateway::Ledger;
use veridex::ingest::{EventIngestionLoop, EventSink, TopicFilter};
use veridex::lifecycle::buyer::BuyerController;
use veridex::lifecycle::provider::ProviderController;
use veridex::oracle::scorer::LexicalScorer;
use veridex::oracle::OracleNode;
use veridex::runtime::{health, status, AgentOrchestrator};
use veridex::submit::faucet::{FundingFaucet, HttpFaucet};
use veridex::submit::TransactionSubmitter;
use veridex::types::EventKind;

fn parse_signer(name: &str, raw: &str) -> anyhow::Result<PrivateKeySigner> {
    let clean = veridex::utils::hex::clean_hex(raw);
    PrivateKeySigner::from_str(clean).map_err(|e| anyhow::anyhow!("{name} is not a valid key: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to `info` when RUST_LOG is unset or invalid to avoid silent
    // startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    veridex::utils::audit::install_panic_hook_once();
    veridex::utils::telemetry::init_telemetry();

    let config = Config::load()?;
    status::emit_startup_status(&config);

    // Collect every identity that will sign submissions.
    let mut signers: Vec<PrivateKeySigner> = Vec::new();
    let provider_signer = config
        .provider_private_key
        .as_deref()
        .map(|raw| parse_signer("PROVIDER_PRIVATE_KEY", raw))
        .transpose()?;
    let buyer_signer = config
        .buyer_private_key
        .as_deref()
        .map(|raw| parse_signer("BUYER_PRIVATE_KEY", raw))
        .transpose()?;
    let oracle_signers: Vec<PrivateKeySigner> = config
        .oracle_private_keys
        .iter()
        .enumerate()
        .map(|(idx, raw)| parse_signer(&format!("ORACLE_PRIVATE_KEYS[{idx}]"), raw))
        .collect::<anyhow::Result<_>>()?;
    signers.extend(provider_signer.iter().cloned());
    signers.extend(buyer_signer.iter().cloned());
    signers.extend(oracle_signers.iter().cloned());

    let ledger: Arc<dyn Ledger> = Arc::new(RpcGateway::new(
        &config.ledger_rpc_url,
        config.market_contract,
        config.chain_id,
        config.submitter.rpc_call_timeout,
        signers,
    )?);

    let content: Arc<dyn ContentStore> = match config.content_store_url.as_deref() {
        Some(url) => Arc::new(HttpStore::new(
            url.to_string(),
            config.submitter.rpc_call_timeout,
        )),
        None => {
            tracing::warn!("[STARTUP] CONTENT_STORE_URL unset; using in-memory content store");
            Arc::new(MemoryStore::new())
        }
    };
    let faucet: Option<Arc<dyn FundingFaucet>> = config.faucet_url.as_deref().map(|url| {
        Arc::new(HttpFaucet::new(
            url.to_string(),
            config.submitter.rpc_call_timeout,
        )) as Arc<dyn FundingFaucet>
    });

    let consensus = Arc::new(ConsensusAggregator::new(
        ledger.clone(),
        config.consensus.clone(),
    ));
    let mut orchestrator = AgentOrchestrator::new(ledger.clone(), consensus.clone());

    // Provider role: watches its own commits, escrow locks, and finalization.
    let provider = provider_signer.map(|signer| {
        let submitter = TransactionSubmitter::new(
            ledger.clone(),
            signer.address(),
            faucet.clone(),
            config.submitter.clone(),
        );
        Arc::new(ProviderController::new(
            ledger.clone(),
            submitter,
            content.clone(),
            config.role.clone(),
        ))
    });
    if let Some(provider) = &provider {
        let sinks: Vec<Arc<dyn EventSink>> = vec![provider.clone()];
        orchestrator = orchestrator
            .with_provider(provider.clone())
            .with_ingestion_loop(Arc::new(EventIngestionLoop::new(
                "provider",
                ledger.clone(),
                TopicFilter::only(&[
                    EventKind::TaskCommitted,
                    EventKind::FundsLocked,
                    EventKind::TaskFinalized,
                ]),
                sinks,
                config.ingest.clone(),
            )));
    }

    // Buyer role: purchases followed markets and polices deadlines.
    let buyer = buyer_signer.map(|signer| {
        let submitter = TransactionSubmitter::new(
            ledger.clone(),
            signer.address(),
            faucet.clone(),
            config.submitter.clone(),
        );
        let markets: HashSet<u64> = std::env::var("BUYER_MARKET_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|raw| raw.trim().parse::<u64>().ok())
            .collect();
        let purchase_amount = std::env::var("BUYER_PURCHASE_AMOUNT_WEI")
            .ok()
            .and_then(|raw| veridex::utils::hex::to_u256(&raw))
            .unwrap_or_else(|| U256::from(10_000_000_000_000_000u128)); // 0.01 native
        Arc::new(BuyerController::new(
            ledger.clone(),
            submitter,
            config.role.clone(),
            markets,
            purchase_amount,
        ))
    });
    if let Some(buyer) = &buyer {
        let sinks: Vec<Arc<dyn EventSink>> = vec![buyer.clone()];
        orchestrator = orchestrator
            .with_buyer(buyer.clone())
            .with_ingestion_loop(Arc::new(EventIngestionLoop::new(
                "buyer",
                ledger.clone(),
                TopicFilter::only(&[EventKind::TaskCommitted, EventKind::FundsLocked]),
                sinks,
                config.ingest.clone(),
            )));
    }

    // Oracle fan-out: M independently-keyed nodes sharing one ingestion loop.
    if !oracle_signers.is_empty() {
        let scorer = Arc::new(LexicalScorer);
        let expectations = std::env::var("ORACLE_EXPECTATIONS").unwrap_or_default();
        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        for (idx, signer) in oracle_signers.into_iter().enumerate() {
            let submitter = TransactionSubmitter::new(
                ledger.clone(),
                signer.address(),
                faucet.clone(),
                config.submitter.clone(),
            );
            let node = Arc::new(OracleNode::new(
                idx,
                signer,
                ledger.clone(),
                submitter,
                scorer.clone(),
                content.clone(),
                consensus.clone(),
                config.role.clone(),
                expectations.clone(),
            ));
            sinks.push(node.clone());
            orchestrator = orchestrator.with_oracle(node);
        }
        orchestrator = orchestrator.with_ingestion_loop(Arc::new(EventIngestionLoop::new(
            "oracle",
            ledger.clone(),
            TopicFilter::only(&[
                EventKind::TaskRevealed,
                EventKind::VerificationSubmitted,
                EventKind::TaskFinalized,
            ]),
            sinks,
            config.ingest.clone(),
        )));
    }

    let orchestrator = Arc::new(orchestrator);

    if config.health_enabled {
        health::serve(
            &config.health_bind_addr,
            orchestrator.clone(),
            orchestrator.shutdown_receiver(),
        )
        .await?;
    }

    let failures = orchestrator.start().await;
    for (role, error) in &failures {
        tracing::error!("[STARTUP] role `{role}` failed to start: {error}");
        veridex::utils::telemetry::emit_critical(
            "startup",
            format!("role `{role}` failed to start: {error}"),
        );
    }

    tracing::info!("[STARTUP] veridex agents running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("[OPS] termination signal received; draining");
    orchestrator.shutdown().await;
    Ok(())
}
