use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Json, Router};
use futures::FutureExt;
use patchbay_controller_token::{discovery_document, IdentitySigner};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{future::IntoFuture, net::SocketAddr, sync::Arc};
use tracing::info;

/// Serves readiness, metrics, and the OIDC discovery surface: the
/// discovery document and JWKS that let external authenticators federate
/// with the internal issuer.
pub(crate) async fn serve(
    addr: SocketAddr,
    identity: Arc<IdentitySigner>,
    issuer: String,
    prom: Arc<Registry>,
    drain: drain::Watch,
) -> Result<()> {
    let app = Router::new()
        .route("/ready", get(|| async { "ready\n" }))
        .route("/livez", get(|| async { "ok\n" }))
        .route(
            "/metrics",
            get(move || {
                let prom = prom.clone();
                async move {
                    let mut buf = String::new();
                    encode(&mut buf, &prom).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
                    Ok::<_, StatusCode>(buf)
                }
            }),
        )
        .route(
            "/.well-known/openid-configuration",
            get(move || async move { Json(discovery_document(&issuer)) }),
        )
        .route(
            "/jwks",
            get(move || async move { Json(identity.jwks()) }),
        );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin address {addr}"))?;
    info!(%addr, "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(drain.signaled().map(|_| ()))
        .into_future()
        .await
        .context("admin server failed")
}
