use crate::{RouterMetrics, RouterServer};
use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get};
use clap::Parser;
use patchbay_controller_token::{Seed, StreamSigner};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};
use tonic::transport::Server;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "patchbay-router", about = "A stream-forwarding router for patchbay")]
pub struct Args {
    #[clap(
        long,
        default_value = "patchbay=info,warn",
        env = "PATCHBAY_ROUTER_LOG"
    )]
    log_level: String,

    /// Log output format: "plain" or "json".
    #[clap(long, default_value = "plain", env = "PATCHBAY_ROUTER_LOG_FORMAT")]
    log_format: String,

    #[clap(long, default_value = "0.0.0.0:8443", env = "PATCHBAY_ROUTER_ADDR")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9991")]
    admin_addr: SocketAddr,

    /// Key seed shared with the controller; the stream-token key is
    /// derived from it, never used directly.
    #[clap(long, env = "PATCHBAY_KEY_SEED", hide_env_values = true)]
    key_seed: String,

    /// The audience stream tokens are pinned to: this router's advertised
    /// endpoint, exactly as the controller's directory names it.
    #[clap(long, env = "PATCHBAY_ROUTER_AUDIENCE")]
    stream_audience: String,

    /// HTTP/2 keepalive ping interval, in seconds. Listen and Stream calls
    /// can stay idle for days; keepalives hold the connections open.
    #[clap(long, default_value = "20")]
    keepalive_interval_secs: u64,

    #[clap(long, default_value = "10")]
    keepalive_timeout_secs: u64,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        init_logging(&self.log_level, &self.log_format)?;

        let seed = self.key_seed.parse::<Seed>().context("invalid key seed")?;
        let signer = Arc::new(StreamSigner::new(&seed, None));

        let mut prom = <Registry>::default();
        let metrics = RouterMetrics::register(prom.sub_registry_with_prefix("router"));
        let server = RouterServer::new(signer, self.stream_audience.clone(), metrics);

        let grpc_addr = self.grpc_addr;
        let grpc = Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(self.keepalive_interval_secs)))
            .http2_keepalive_timeout(Some(Duration::from_secs(self.keepalive_timeout_secs)))
            .tcp_keepalive(Some(Duration::from_secs(self.keepalive_interval_secs)))
            .add_service(server.svc())
            .serve_with_shutdown(grpc_addr, shutdown_signal());
        info!(addr = %grpc_addr, audience = %self.stream_audience, "router gRPC listening");

        let prom = Arc::new(prom);
        let admin = axum::Router::new()
            .route("/livez", get(|| async { "ok\n" }))
            .route("/ready", get(|| async { "ready\n" }))
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
            );
        let admin_listener = tokio::net::TcpListener::bind(self.admin_addr)
            .await
            .with_context(|| format!("failed to bind admin address {}", self.admin_addr))?;
        info!(addr = %self.admin_addr, "router admin listening");
        let admin = axum::serve(admin_listener, admin).with_graceful_shutdown(shutdown_signal());

        tokio::select! {
            res = grpc => res.context("gRPC server failed")?,
            res = admin.into_future() => res.context("admin server failed")?,
        }
        info!("router shut down cleanly");
        Ok(())
    }
}

pub(crate) fn init_logging(filter: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(filter).context("invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
