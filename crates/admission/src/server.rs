//! TLS listener for the admission webhook, served on port 443 with the
//! self-signed certificate the operator mounts at
//! `/app/serving-certs/tls.{crt,key}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;

use crate::routes::{admis, admis_switch, AdmissionState};

pub fn router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/api/admis_switch", get(admis_switch).post(admis_switch))
        .route("/api/admis", post(admis))
        .with_state(state)
}

pub async fn serve(state: Arc<AdmissionState>, cert_path: &str, key_path: &str, addr: SocketAddr) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    axum_server::bind_rustls(addr, tls).serve(router(state).into_make_service()).await?;
    Ok(())
}
