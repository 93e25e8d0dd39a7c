//! Role supervision.
//!
//! The orchestrator owns the shared ledger gateway and the per-role
//! ingestion loops, starts every role as an independently-failing unit
//! (start-all, collect failures: one broken role never blocks the others),
//! aggregates per-role health for the operator endpoint, and coordinates
//! shutdown: stop ingestion first, let in-flight transactions finish, then
//! exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::consensus::ConsensusAggregator;
use crate::gateway::Ledger;
use crate::ingest::EventIngestionLoop;
use crate::lifecycle::buyer::BuyerController;
use crate::lifecycle::provider::ProviderController;
use crate::oracle::{OracleNode, OracleNodeStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub name: String,
    pub running: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub roles: Vec<RoleStatus>,
}

pub struct AgentOrchestrator {
    ledger: Arc<dyn Ledger>,
    consensus: Arc<ConsensusAggregator>,
    loops: Vec<Arc<EventIngestionLoop>>,
    provider: Option<Arc<ProviderController>>,
    buyer: Option<Arc<BuyerController>>,
    oracles: Vec<Arc<OracleNode>>,
    statuses: Arc<DashMap<String, RoleStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AgentOrchestrator {
    pub fn new(ledger: Arc<dyn Ledger>, consensus: Arc<ConsensusAggregator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            ledger,
            consensus,
            loops: Vec::new(),
            provider: None,
            buyer: None,
            oracles: Vec::new(),
            statuses: Arc::new(DashMap::new()),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_ingestion_loop(mut self, ingestion: Arc<EventIngestionLoop>) -> Self {
        self.loops.push(ingestion);
        self
    }

    pub fn with_provider(mut self, provider: Arc<ProviderController>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_buyer(mut self, buyer: Arc<BuyerController>) -> Self {
        self.buyer = Some(buyer);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<OracleNode>) -> Self {
        self.oracles.push(oracle);
        self
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    pub fn consensus(&self) -> Arc<ConsensusAggregator> {
        self.consensus.clone()
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    fn mark_running(&self, name: &str) {
        self.statuses.insert(
            name.to_string(),
            RoleStatus {
                name: name.to_string(),
                running: true,
                last_error: None,
            },
        );
    }

    fn mark_failed(&self, name: &str, error: String) {
        self.statuses.insert(
            name.to_string(),
            RoleStatus {
                name: name.to_string(),
                running: false,
                last_error: Some(error),
            },
        );
    }

    /// Start every configured role concurrently. A role that fails to start
    /// is recorded and skipped; the rest keep going. Returns the list of
    /// startup failures, which is empty on a clean start.
    pub async fn start(self: &Arc<Self>) -> Vec<(String, String)> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut handles = self.handles.lock().await;

        // Connectivity probe up front so a dead gateway is visible at
        // startup, not as a drip of per-role errors. Non-fatal: loops retry.
        match self.ledger.block_number().await {
            Ok(head) => tracing::info!("[OPS] ledger reachable at block {head}"),
            Err(err) => tracing::warn!("[OPS] ledger probe failed at startup: {err}"),
        }

        for ingestion in &self.loops {
            let name = format!("ingest:{}", ingestion.name());
            self.mark_running(&name);
            let task = ingestion.clone();
            let rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(task.run(rx)));
            tracing::info!("[OPS] started {name}");
        }

        if let Some(provider) = &self.provider {
            self.mark_running("provider");
            let task = provider.clone();
            let rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(task.run(rx)));
            tracing::info!("[OPS] started provider ({:#x})", provider.address());
        }

        if let Some(buyer) = &self.buyer {
            self.mark_running("buyer");
            let task = buyer.clone();
            let rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(task.run(rx)));
            tracing::info!("[OPS] started buyer ({:#x})", buyer.address());
        }

        for oracle in &self.oracles {
            let name = oracle.name().to_string();
            // Registration status is informational; an unregistered oracle
            // still verifies and lets the ledger-side policy decide.
            oracle.check_registration().await;
            self.mark_running(&name);
            let node = oracle.clone();
            let mut rx = self.shutdown_tx.subscribe();
            let statuses = self.statuses.clone();
            let node_name = name.clone();
            let tick_interval = oracle.action_interval();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => node.tick().await,
                        _ = rx.recv() => {
                            tracing::info!("[ORACLE] {} stopping", node.name());
                            if let Some(mut entry) = statuses.get_mut(&node_name) {
                                entry.running = false;
                            }
                            return;
                        }
                    }
                }
            }));
            tracing::info!("[OPS] started {name} ({:#x})", oracle.address());
        }

        if self.loops.is_empty() {
            let message = "no ingestion loops configured".to_string();
            tracing::error!("[OPS] {message}");
            self.mark_failed("ingest", message.clone());
            failures.push(("ingest".to_string(), message));
        }

        failures
    }

    /// Aggregated per-role health for operators.
    pub fn health_check(&self) -> HealthReport {
        let mut roles: Vec<RoleStatus> = self
            .statuses
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        let healthy = !roles.is_empty() && roles.iter().all(|r| r.running);
        HealthReport { healthy, roles }
    }

    pub async fn oracle_statuses(&self) -> Vec<OracleNodeStatus> {
        let mut out = Vec::with_capacity(self.oracles.len());
        for oracle in &self.oracles {
            out.push(oracle.status().await);
        }
        out
    }

    /// Full operator status document.
    pub async fn status_snapshot(&self) -> serde_json::Value {
        let health = self.health_check();
        let loops: Vec<serde_json::Value> = self
            .loops
            .iter()
            .map(|l| {
                let (completed, failed) = l.tick_counts();
                serde_json::json!({
                    "name": l.name(),
                    "stopped": l.is_stopped(),
                    "ticks_completed": completed,
                    "ticks_failed": failed,
                })
            })
            .collect();
        let provider = match &self.provider {
            Some(p) => serde_json::to_value(p.status().await).unwrap_or_default(),
            None => serde_json::Value::Null,
        };
        let buyer = match &self.buyer {
            Some(b) => serde_json::to_value(b.status().await).unwrap_or_default(),
            None => serde_json::Value::Null,
        };
        let oracles = serde_json::to_value(self.oracle_statuses().await).unwrap_or_default();
        let head = self.ledger.block_number().await.ok();

        serde_json::json!({
            "healthy": health.healthy,
            "roles": health.roles,
            "ledger_head": head,
            "ingestion": loops,
            "provider": provider,
            "buyer": buyer,
            "oracles": oracles,
        })
    }

    /// Stop ingestion, let in-flight work finish, then join every role task.
    /// Idempotent.
    pub async fn shutdown(&self) {
        for ingestion in &self.loops {
            ingestion.stop();
        }
        let _ = self.shutdown_tx.send(());
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        let names: Vec<String> = self.statuses.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some(mut status) = self.statuses.get_mut(&name) {
                status.running = false;
            }
        }
        tracing::info!("[OPS] orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusConfig, IngestConfig};
    use crate::gateway::sim::SimLedger;
    use crate::ingest::TopicFilter;

    #[tokio::test]
    async fn test_start_and_shutdown_round_trip() {
        let sim = Arc::new(SimLedger::default());
        let ledger: Arc<dyn Ledger> = sim.clone();
        let consensus = Arc::new(ConsensusAggregator::new(
            ledger.clone(),
            ConsensusConfig::default(),
        ));
        let ingestion = Arc::new(EventIngestionLoop::new(
            "all",
            ledger.clone(),
            TopicFilter::all(),
            Vec::new(),
            IngestConfig {
                poll_interval: std::time::Duration::from_millis(50),
                ..IngestConfig::default()
            },
        ));
        let orchestrator = Arc::new(
            AgentOrchestrator::new(ledger, consensus).with_ingestion_loop(ingestion),
        );

        let failures = orchestrator.start().await;
        assert!(failures.is_empty());
        let health = orchestrator.health_check();
        assert!(health.healthy);

        orchestrator.shutdown().await;
        let health = orchestrator.health_check();
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_start_with_no_loops_reports_failure_without_blocking() {
        let sim = Arc::new(SimLedger::default());
        let ledger: Arc<dyn Ledger> = sim.clone();
        let consensus = Arc::new(ConsensusAggregator::new(
            ledger.clone(),
            ConsensusConfig::default(),
        ));
        let orchestrator = Arc::new(AgentOrchestrator::new(ledger, consensus));
        let failures = orchestrator.start().await;
        assert_eq!(failures.len(), 1);
        assert!(!orchestrator.health_check().healthy);
        orchestrator.shutdown().await;
    }
}
