use anyhow::{Context, Result};
use patchbay_controller_arbiter::LeaseLimits;
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path, time::Duration};

/// The controller's configuration document (JSON). Everything has a
/// default except the key seed, which must arrive via flag, environment,
/// or this document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The single namespace this controller instance operates in.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Router directory entries handed out by Dial.
    #[serde(default)]
    pub routers: Vec<RouterConfig>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Allows Register to create exporter resources for authenticated
    /// subjects that do not have one yet.
    #[serde(default)]
    pub provisioning_enabled: bool,

    #[serde(default)]
    pub lease_limits: LeaseLimitsConfig,

    /// Seconds without a heartbeat before an exporter's Online condition
    /// turns False.
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,

    /// Seconds a ready lease survives its exporter being offline.
    #[serde(default = "default_offline_grace")]
    pub offline_grace_secs: u64,

    /// Issuer URL advertised in the OIDC discovery document. Defaults to
    /// an http URL at the admin address.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Audience identity tokens are minted for.
    #[serde(default = "default_controller_audience")]
    pub controller_audience: String,

    #[serde(default = "default_stream_token_lifetime")]
    pub stream_token_lifetime_secs: u64,

    /// Identity token lifetime; defaults to the signer's long-lived
    /// default when absent.
    #[serde(default)]
    pub identity_lifetime_secs: Option<u64>,

    /// Key seed; the command line and environment take precedence.
    #[serde(default)]
    pub key_seed: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_internal_prefix")]
    pub internal_prefix: String,

    #[serde(default)]
    pub oidc: Vec<OidcConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            internal_prefix: default_internal_prefix(),
            oidc: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    pub issuer: String,
    pub audiences: Vec<String>,
    /// Inline JWKS document for the issuer; fetching it from the issuer's
    /// discovery endpoint is deployment tooling's job.
    pub jwks: serde_json::Value,
    #[serde(default)]
    pub username_claim: Option<String>,
    #[serde(default)]
    pub username_prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepaliveConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub tcp_interval_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            tcp_interval_secs: default_ping_interval(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseLimitsConfig {
    #[serde(default)]
    pub min_secs: u64,
    #[serde(default = "default_lease_max")]
    pub max_secs: u64,
    #[serde(default)]
    pub allow_unlimited: bool,
}

impl Default for LeaseLimitsConfig {
    fn default() -> Self {
        Self {
            min_secs: 0,
            max_secs: default_lease_max(),
            allow_unlimited: false,
        }
    }
}

impl From<&LeaseLimitsConfig> for LeaseLimits {
    fn from(c: &LeaseLimitsConfig) -> Self {
        Self {
            min: Duration::from_secs(c.min_secs),
            max: Duration::from_secs(c.max_secs),
            allow_unlimited: c.allow_unlimited,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_secs(self.offline_grace_secs)
    }

    pub fn stream_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.stream_token_lifetime_secs)
    }

    pub fn identity_lifetime(&self) -> Option<Duration> {
        self.identity_lifetime_secs.map(Duration::from_secs)
    }
}

fn default_offline_timeout() -> u64 {
    180
}

fn default_offline_grace() -> u64 {
    30
}

fn default_controller_audience() -> String {
    "patchbay-controller".to_string()
}

fn default_stream_token_lifetime() -> u64 {
    60
}

fn default_internal_prefix() -> String {
    patchbay_controller_core::DEFAULT_INTERNAL_PREFIX.to_string()
}

fn default_ping_interval() -> u64 {
    20
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_lease_max() -> u64 {
    30 * 24 * 60 * 60
}
