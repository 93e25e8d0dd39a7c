//! Operator HTTP surface: `GET /health`, `GET /status`, `GET /oracles`,
//! serving the orchestrator's aggregated view.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::broadcast;

use super::AgentOrchestrator;

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

async fn handle_request(
    req: Request<Body>,
    orchestrator: Arc<AgentOrchestrator>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let report = orchestrator.health_check();
            let status = if report.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
            json_response(status, body)
        }
        (&Method::GET, "/status") => {
            let snapshot = orchestrator.status_snapshot().await;
            json_response(StatusCode::OK, snapshot.to_string())
        }
        (&Method::GET, "/oracles") => {
            let oracles = orchestrator.oracle_statuses().await;
            let body = serde_json::to_string(&oracles).unwrap_or_else(|_| "[]".to_string());
            json_response(StatusCode::OK, body)
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not_found"}"#.to_string(),
        ),
    };
    Ok(response)
}

/// Bind and serve until the shutdown signal fires. Returns the actual bound
/// address (useful with port 0 in tests).
pub async fn serve(
    bind_addr: &str,
    orchestrator: Arc<AgentOrchestrator>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HEALTH_BIND_ADDR `{bind_addr}`: {e}"))?;

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, orchestrator.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| anyhow::anyhow!("health endpoint bind failed on {addr}: {e}"))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    tracing::info!("[HEALTH] operator endpoint listening on http://{local_addr}");

    tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown.recv().await;
            tracing::info!("[HEALTH] shutdown signal received");
        });
        if let Err(err) = graceful.await {
            tracing::error!("[HEALTH] server error: {err}");
        }
    });

    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::consensus::ConsensusAggregator;
    use crate::gateway::sim::SimLedger;
    use crate::gateway::Ledger;

    #[tokio::test]
    async fn test_health_endpoint_serves_degraded_for_empty_orchestrator() {
        let sim = Arc::new(SimLedger::default());
        let ledger: Arc<dyn Ledger> = sim.clone();
        let consensus = Arc::new(ConsensusAggregator::new(
            ledger.clone(),
            ConsensusConfig::default(),
        ));
        let orchestrator = Arc::new(AgentOrchestrator::new(ledger, consensus));
        let (tx, rx) = broadcast::channel(1);

        let addr = serve("127.0.0.1:0", orchestrator, rx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let body = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap();
        assert_eq!(body.status().as_u16(), 503);

        let missing = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let _ = tx.send(());
    }
}
