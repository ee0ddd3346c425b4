use crate::{admin, Config};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::FutureExt;
use patchbay_controller_arbiter::{Arbiter, ArbiterMetrics, IdentityReconciler};
use patchbay_controller_auth::{Authenticator, Authorizer, OidcVerifier};
use patchbay_controller_grpc::{
    ControllerMetrics, ControllerServer, Directory, Registry, RouterEntry,
};
use patchbay_controller_store::Stores;
use patchbay_controller_token::{IdentitySigner, Seed, StreamSigner};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tonic::transport::Server;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(
    name = "patchbay-controller",
    about = "The patchbay control plane: resource store, lease arbiter, and controller gRPC service"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "patchbay=info,warn",
        env = "PATCHBAY_CONTROLLER_LOG"
    )]
    log_level: String,

    /// Log output format: "plain" or "json".
    #[clap(long, default_value = "plain", env = "PATCHBAY_CONTROLLER_LOG_FORMAT")]
    log_format: String,

    #[clap(long, default_value = "0.0.0.0:8082", env = "PATCHBAY_CONTROLLER_ADDR")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// The single namespace this controller watches. Running
    /// namespace-wide is not supported.
    #[clap(long, default_value = "default", env = "PATCHBAY_NAMESPACE")]
    namespace: String,

    /// Path to the JSON configuration document.
    #[clap(long, env = "PATCHBAY_CONFIG")]
    config: Option<PathBuf>,

    /// Key seed for deterministic signing keys; the only required input.
    #[clap(long, env = "PATCHBAY_KEY_SEED", hide_env_values = true)]
    key_seed: Option<String>,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        init_logging(&self.log_level, &self.log_format)?;

        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        if namespace.is_empty() || namespace == "*" {
            bail!("a single namespace is required; namespace-wide operation is not supported");
        }

        let seed = self
            .key_seed
            .clone()
            .or_else(|| config.key_seed.clone())
            .context("a key seed is required (--key-seed or PATCHBAY_KEY_SEED)")?
            .parse::<Seed>()
            .context("invalid key seed")?;

        let issuer = config
            .issuer
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.admin_addr));
        let identity = Arc::new(
            IdentitySigner::new(
                &seed,
                issuer.clone(),
                config.controller_audience.clone(),
                config.identity_lifetime(),
            )
            .context("failed to initialize the identity signer")?,
        );
        let streams = Arc::new(StreamSigner::new(&seed, Some(config.stream_token_lifetime())));

        let mut authenticator = Authenticator::new(identity.clone());
        for oidc in &config.auth.oidc {
            let verifier = OidcVerifier::new(
                oidc.issuer.clone(),
                oidc.audiences.clone(),
                &oidc.jwks,
                oidc.username_claim.clone(),
                oidc.username_prefix.clone(),
            )
            .with_context(|| format!("invalid OIDC verifier for issuer {:?}", oidc.issuer))?;
            authenticator.push(Box::new(verifier));
        }

        let stores = Stores::new(&namespace);
        let authorizer = Authorizer::new(config.auth.internal_prefix.clone(), stores.clone());

        let directory = Directory::new(
            config
                .routers
                .iter()
                .map(|r| RouterEntry {
                    name: r.name.clone(),
                    endpoint: r.endpoint.clone(),
                    labels: r.labels.clone(),
                })
                .collect(),
        );
        if directory.is_empty() {
            warn!("no routers configured; Dial will fail until some are added");
        }

        let mut prom = <prometheus_client::registry::Registry>::default();
        let arbiter_metrics = ArbiterMetrics::register(prom.sub_registry_with_prefix("arbiter"));
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));

        let arbiter = Arbiter::new(
            stores.clone(),
            (&config.lease_limits).into(),
            config.offline_timeout(),
            config.offline_grace(),
            config.provisioning_enabled,
            arbiter_metrics,
        );

        let registry = Registry::new();
        let (close, drain_rx) = drain::channel();

        let mut arbiter_task = tokio::spawn(arbiter.clone().run(drain_rx.clone()));
        let mut identity_task = tokio::spawn(
            IdentityReconciler::new(stores.clone(), identity.clone()).run(drain_rx.clone()),
        );
        tokio::spawn(
            registry
                .clone()
                .evict_deleted(stores.exporters().clone(), drain_rx.clone()),
        );

        let server = ControllerServer::new(
            stores.clone(),
            registry,
            directory,
            Arc::new(authenticator),
            authorizer,
            streams,
            arbiter,
            config.provisioning_enabled,
            controller_metrics,
            drain_rx.clone(),
        );
        let mut grpc_task = tokio::spawn(grpc(
            self.grpc_addr,
            config.keepalive.clone(),
            server,
            drain_rx.clone(),
        ));

        let mut admin_task = tokio::spawn(admin::serve(
            self.admin_addr,
            identity,
            issuer,
            Arc::new(prom),
            drain_rx,
        ));

        info!(%namespace, "controller running");
        tokio::select! {
            _ = shutdown_signal() => info!("shutdown signal received"),
            res = &mut arbiter_task => bail!("arbiter terminated unexpectedly: {res:?}"),
            res = &mut identity_task => bail!("identity reconciler terminated unexpectedly: {res:?}"),
            res = &mut grpc_task => match res {
                Ok(Ok(())) => bail!("gRPC server stopped unexpectedly"),
                Ok(Err(error)) => return Err(error),
                Err(join) => bail!("gRPC server panicked: {join}"),
            },
            res = &mut admin_task => match res {
                Ok(Ok(())) => bail!("admin server stopped unexpectedly"),
                Ok(Err(error)) => return Err(error),
                Err(join) => bail!("admin server panicked: {join}"),
            },
        }

        close.drain().await;
        info!("controller shut down cleanly");
        Ok(())
    }
}

/// Serves the controller gRPC surface until drained, with keepalives tuned
/// so that long-idle Listen streams stay open.
async fn grpc(
    addr: SocketAddr,
    keepalive: crate::KeepaliveConfig,
    server: ControllerServer,
    drain: drain::Watch,
) -> Result<()> {
    let svc = server.svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(keepalive.ping_interval_secs)))
            .http2_keepalive_timeout(Some(Duration::from_secs(keepalive.ping_timeout_secs)))
            .tcp_keepalive(Some(Duration::from_secs(keepalive.tcp_interval_secs)))
            .add_service(svc)
            .serve_with_shutdown(addr, close_rx.map(|_| ()));
    }

    info!(%addr, "controller gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res.context("gRPC server failed")?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await.context("gRPC server failed during shutdown")?;
        }
    }
    Ok(())
}

fn init_logging(filter: &str, format: &str) -> Result<()> {
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
