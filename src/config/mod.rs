//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files,
//! with environment overrides for the secrets the gateway holds.

use crate::identity::Tier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Environment variable overriding `upstream.secret`
pub const ENV_UPSTREAM_SECRET: &str = "GATEWAY_UPSTREAM_SECRET";
/// Environment variable overriding `api_keys.hash_pepper`
pub const ENV_HASH_PEPPER: &str = "GATEWAY_HASH_PEPPER";
/// Environment variable overriding `identity_provider.api_key`
pub const ENV_IDP_API_KEY: &str = "GATEWAY_IDP_API_KEY";

/// Length in characters of the random part of a generated API key (32 bytes, hex encoded)
pub const SECRET_HEX_LEN: usize = 64;

fn default_enabled() -> bool {
    true
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

impl ServerConfig {
    /// Deadline for a whole request, after which the client gets a 503
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Identity provider used to introspect session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProviderConfig {
    /// User endpoint of the identity provider. Bearer tokens are rejected when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Project key sent in the `apikey` header alongside the user's token
    #[serde(default)]
    pub api_key: Option<String>,
    /// Introspection timeout in milliseconds
    #[serde(default = "default_dependency_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_dependency_timeout_ms() -> u64 {
    5_000
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: default_dependency_timeout_ms(),
        }
    }
}

impl IdentityProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local store, state is lost on restart
    #[default]
    Memory,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_dependency_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_dependency_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Upstream optimization service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Endpoint receiving optimization requests
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Header carrying the internal trust secret
    #[serde(default = "default_trust_header")]
    pub trust_header: String,
    /// Shared secret for the internal trust channel
    #[serde(default)]
    pub secret: String,
    /// Dispatch timeout in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000/optimize".to_string()
}

fn default_trust_header() -> String {
    "X-Internal-Secret".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            trust_header: default_trust_header(),
            secret: String::new(),
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// API key issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    /// Marker every plaintext key starts with
    #[serde(default = "default_key_prefix")]
    pub prefix: String,
    /// Number of leading plaintext characters kept for display
    #[serde(default = "default_display_prefix_len")]
    pub display_prefix_len: usize,
    /// Server-side key for hashing secrets. Empty means plain SHA-256.
    #[serde(default)]
    pub hash_pepper: String,
    /// Lifetime of auto-issued trial keys in days
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
}

fn default_key_prefix() -> String {
    "sk_".to_string()
}

fn default_display_prefix_len() -> usize {
    12
}

fn default_trial_days() -> i64 {
    14
}

impl Default for ApiKeysConfig {
    fn default() -> Self {
        Self {
            prefix: default_key_prefix(),
            display_prefix_len: default_display_prefix_len(),
            hash_pepper: String::new(),
            trial_days: default_trial_days(),
        }
    }
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

/// Allowances attached to a subscription tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierLimits {
    /// Requests admitted per rate window
    pub requests_per_minute: u32,
    /// Requests included in one billing period
    pub monthly_requests: u64,
    /// Price charged per request beyond the monthly allowance
    #[serde(default)]
    pub overage_price: f64,
    /// Whether principals on this tier may mint their own keys
    #[serde(default = "default_enabled")]
    pub custom_keys: bool,
}

impl TierLimits {
    fn new(requests_per_minute: u32, monthly_requests: u64, overage_price: f64, custom_keys: bool) -> Self {
        Self {
            requests_per_minute,
            monthly_requests,
            overage_price,
            custom_keys,
        }
    }
}

fn default_trial_limits() -> TierLimits {
    TierLimits::new(5, 100, 0.0, false)
}

fn default_starter_limits() -> TierLimits {
    TierLimits::new(10, 1_000, 0.01, true)
}

fn default_professional_limits() -> TierLimits {
    TierLimits::new(50, 10_000, 0.008, true)
}

fn default_enterprise_limits() -> TierLimits {
    TierLimits::new(200, 100_000, 0.005, true)
}

/// Per-tier allowances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_trial_limits")]
    pub trial: TierLimits,
    #[serde(default = "default_starter_limits")]
    pub starter: TierLimits,
    #[serde(default = "default_professional_limits")]
    pub professional: TierLimits,
    #[serde(default = "default_enterprise_limits")]
    pub enterprise: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            trial: default_trial_limits(),
            starter: default_starter_limits(),
            professional: default_professional_limits(),
            enterprise: default_enterprise_limits(),
        }
    }
}

impl TierTable {
    /// Get the allowances for a tier
    pub fn get(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Trial => &self.trial,
            Tier::Starter => &self.starter,
            Tier::Professional => &self.professional,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether health check is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path for health check endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A principal preloaded into the store at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedPrincipal {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub tier: Tier,
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub identity_provider: IdentityProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub api_keys: ApiKeysConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Principals loaded into the store at startup
    #[serde(default)]
    pub principals: Vec<SeedPrincipal>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: GatewayConfig = toml::from_str(&contents)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace secrets with values found through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_UPSTREAM_SECRET) {
            self.upstream.secret = secret;
        }
        if let Some(pepper) = lookup(ENV_HASH_PEPPER) {
            self.api_keys.hash_pepper = pepper;
        }
        if let Some(key) = lookup(ENV_IDP_API_KEY) {
            self.identity_provider.api_key = Some(key);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.timeout == 0 {
            anyhow::bail!("server.timeout must be greater than zero");
        }
        if self.upstream.secret.is_empty() {
            anyhow::bail!(
                "upstream.secret must be set (or provided through {})",
                ENV_UPSTREAM_SECRET
            );
        }
        if self.upstream.trust_header.trim().is_empty() {
            anyhow::bail!("upstream.trust_header must not be empty");
        }
        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than zero");
        }
        if self.api_keys.prefix.is_empty() {
            anyhow::bail!("api_keys.prefix must not be empty");
        }
        if self.api_keys.display_prefix_len == 0 {
            anyhow::bail!("api_keys.display_prefix_len must be greater than zero");
        }
        let key_len = self.api_keys.prefix.len() + SECRET_HEX_LEN;
        if self.api_keys.display_prefix_len >= key_len {
            anyhow::bail!(
                "api_keys.display_prefix_len ({}) must be shorter than the generated key ({})",
                self.api_keys.display_prefix_len,
                key_len
            );
        }
        if self.api_keys.trial_days <= 0 {
            anyhow::bail!("api_keys.trial_days must be positive");
        }
        for (tier, limits) in Tier::ALL.iter().map(|t| (t, self.tiers.get(*t))) {
            if limits.overage_price < 0.0 || !limits.overage_price.is_finite() {
                anyhow::bail!("tiers.{} has an invalid overage_price", tier);
            }
        }
        if let Some(url) = &self.identity_provider.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("identity_provider.url must be an http(s) URL");
            }
        }
        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Rate window as a duration
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }
}
