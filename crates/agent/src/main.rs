use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::Value;

use kubedoor_core::config::AgentConfig;
use kubedoor_k8s::K8sSession;
use kubedoor_orchestrator::balance_node::BalanceNodeRequest;
use kubedoor_orchestrator::cron_request::CronRequest;
use kubedoor_orchestrator::restart::RestartRequest;
use kubedoor_orchestrator::scale::ScaleRequest;
use kubedoor_orchestrator::update_image::UpdateImageRequest;
use kubedoor_orchestrator::Orchestrator;
use kubedoor_persist::{AuditStore, SqliteAuditStore};
use kubedoor_tunnel::Tunnel;

const SERVICE_NAMESPACE: &str = "kubedoor";
const SERVICE_NAME: &str = "kubedoor-agent";

fn init_tracing() {
    let env = std::env::var("KUBEDOOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus metrics recorder")
}

struct AppState {
    orchestrator: Orchestrator,
    metrics: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let metrics_handle = init_metrics();
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let config = Arc::new(AgentConfig::from_env()?);
    let session = K8sSession::connect().await?;

    let audit: Arc<dyn AuditStore> = match SqliteAuditStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open audit database, continuing without persistence");
            Arc::new(kubedoor_persist::NullAuditStore)
        }
    };

    let orchestrator = Orchestrator::new(config.clone(), session.clone(), audit.clone());

    let tunnel = Arc::new(Tunnel::new(config.clone(), session.clone()));
    let tunnel_task = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.run().await })
    };

    let admission_state = Arc::new(kubedoor_admission::AdmissionState::new(
        tunnel.handle(),
        config.node_label_value.clone(),
        session.client.clone(),
        SERVICE_NAMESPACE.to_string(),
        SERVICE_NAME.to_string(),
        config.ca_bundle_b64.clone(),
    ));

    let app_state = Arc::new(AppState { orchestrator, metrics: metrics_handle });
    let orchestrator_router = Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/scale", post(handle_scale))
        .route("/api/restart", post(handle_restart))
        .route("/api/update-image", post(handle_update_image))
        .route("/api/balance_node", post(handle_balance_node))
        .route("/api/cron", post(handle_cron))
        .with_state(app_state);

    // One HTTPS:443 listener serves both the admission webhook
    // (`/api/admis`, `/api/admis_switch`) and the five orchestrator
    // entry points (§6) — the API server and operator-facing callers hit
    // the same Service, just different paths.
    let app = Router::new().merge(kubedoor_admission::server::router(admission_state)).merge(orchestrator_router);

    let cert = config.tls_cert_path.clone();
    let key = config.tls_key_path.clone();
    let addr = "0.0.0.0:443".parse().unwrap();
    let server_task = tokio::spawn(async move {
        let tls = match RustlsConfig::from_pem_file(&cert, &key).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::error!(error = %e, "failed to load TLS cert/key, agent HTTPS listener cannot start");
                return;
            }
        };
        if let Err(e) = axum_server::bind_rustls(addr, tls).serve(app.into_make_service()).await {
            tracing::error!(error = %e, "agent https server exited");
        }
    });

    tokio::select! {
        _ = tunnel_task => tracing::error!("master tunnel task exited, shutting down"),
        _ = server_task => tracing::error!("agent https server task exited, shutting down"),
    }

    Ok(())
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

async fn handle_scale(State(state): State<Arc<AppState>>, Json(req): Json<ScaleRequest>) -> Json<Value> {
    match state.orchestrator.scale_service().handle_scale(req).await {
        Ok(result) => Json(serde_json::json!({ "success": result.success, "message": result.message })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

async fn handle_restart(State(state): State<Arc<AppState>>, Json(req): Json<RestartRequest>) -> Json<Value> {
    match state.orchestrator.restart_service().handle_restart(req).await {
        Ok(result) => Json(serde_json::json!({ "success": result.success, "message": result.message })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

async fn handle_update_image(State(state): State<Arc<AppState>>, Json(req): Json<UpdateImageRequest>) -> Json<Value> {
    match state.orchestrator.update_image_service().handle_update_image(req).await {
        Ok(result) => Json(serde_json::json!({ "success": result.success, "message": result.message })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

async fn handle_balance_node(State(state): State<Arc<AppState>>, Json(req): Json<BalanceNodeRequest>) -> Json<Value> {
    match state.orchestrator.balance_node_service().handle_balance_node(req).await {
        Ok(result) => Json(serde_json::json!({ "success": result.success, "message": result.message })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

async fn handle_cron(State(state): State<Arc<AppState>>, Json(req): Json<CronRequest>) -> Json<Value> {
    match state.orchestrator.cron_request_service().handle_cron(req).await {
        Ok(result) => Json(serde_json::json!({ "success": result.success, "message": result.message })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}
