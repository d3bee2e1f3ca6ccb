//! # Fiscal Configuration
//!
//! Configuration management for the fiscal pipeline.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TITAN_FISCAL_AUTHORITY_URL=https://wswhomo.example/fe              │
//! │     TITAN_FISCAL_CUIT=20123456786                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/titan-pos/fiscal.toml (Linux)                            │
//! │     ~/Library/Application Support/com.titan.pos/fiscal.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Homologation endpoints, point of sale 1, 3 retries                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # fiscal.toml
//! [issuer]
//! cuit = "30712345671"
//! business_name = "Titan Store SRL"
//! point_of_sale = 3
//!
//! [authority]
//! base_url = "https://fiscal-gateway.example.com"
//! service = "wsfe"
//! signing_key_path = "/etc/titan/fiscal-key.pem"
//!
//! [resilience]
//! base_timeout_ms = 10000
//! max_attempts = 3
//! pool_size = 4
//!
//! [queue]
//! batch_size = 10
//!
//! [ticket_cache]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use titan_core::validation::{validate_cuit, validate_point_of_sale};
use titan_core::{IssuerProfile, InvoiceRules, Money, TaxRate};
use titan_db::DbConfig;

use crate::error::{FiscalError, FiscalResult};
use crate::resilience::cache::{CachePolicy, ResponseCache};
use crate::resilience::retry::RetryPolicy;

// =============================================================================
// Issuer
// =============================================================================

/// The business issuing invoices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerSettings {
    /// Issuer CUIT (11 digits, dashes allowed).
    #[serde(default = "default_cuit")]
    pub cuit: String,

    #[serde(default = "default_business_name")]
    pub business_name: String,

    /// Point of sale registered with the authority.
    #[serde(default = "default_point_of_sale")]
    pub point_of_sale: u32,
}

fn default_cuit() -> String {
    "20123456786".to_string()
}

fn default_business_name() -> String {
    "Titan POS".to_string()
}

fn default_point_of_sale() -> u32 {
    1
}

impl Default for IssuerSettings {
    fn default() -> Self {
        IssuerSettings {
            cuit: default_cuit(),
            business_name: default_business_name(),
            point_of_sale: default_point_of_sale(),
        }
    }
}

impl IssuerSettings {
    /// The validated issuer profile used by the invoice builder.
    pub fn to_profile(&self) -> FiscalResult<IssuerProfile> {
        Ok(IssuerProfile {
            cuit: validate_cuit(&self.cuit)?,
            business_name: self.business_name.clone(),
            point_of_sale: self.point_of_sale,
        })
    }
}

// =============================================================================
// Authority
// =============================================================================

/// Algorithm used to sign ticket requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SigningAlgorithm {
    /// RSA with the holder's certificate key (production).
    #[default]
    Rs256,
    /// Shared secret, for gateways and test doubles that accept it.
    Hs256,
}

/// Tax authority endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySettings {
    /// Base URL of the authority gateway; endpoint paths are appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Service id the ticket is requested for.
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default)]
    pub signing_algorithm: SigningAlgorithm,

    /// PEM file with the private key (RS256) or the raw secret (HS256).
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    /// Inline key material. Only ever set from the environment.
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,

    /// Refresh the ticket when it expires within this many seconds.
    #[serde(default = "default_ticket_refresh_margin")]
    pub ticket_refresh_margin_secs: u64,

    /// Lifetime requested for each ticket request.
    #[serde(default = "default_ticket_request_ttl")]
    pub ticket_request_ttl_secs: u64,

    /// Generation time is backdated by this much to absorb clock skew.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
}

fn default_base_url() -> String {
    "https://wswhomo.afip.gov.ar".to_string()
}

fn default_service() -> String {
    "wsfe".to_string()
}

fn default_ticket_refresh_margin() -> u64 {
    600
}

fn default_ticket_request_ttl() -> u64 {
    600
}

fn default_clock_skew() -> u64 {
    60
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        AuthoritySettings {
            base_url: default_base_url(),
            service: default_service(),
            signing_algorithm: SigningAlgorithm::default(),
            signing_key_path: None,
            signing_key: None,
            ticket_refresh_margin_secs: default_ticket_refresh_margin(),
            ticket_request_ttl_secs: default_ticket_request_ttl(),
            clock_skew_secs: default_clock_skew(),
        }
    }
}

impl AuthoritySettings {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.ticket_refresh_margin_secs)
    }

    /// Loads the signing key material from the inline value or the key file.
    pub fn load_signing_key(&self) -> FiscalResult<Vec<u8>> {
        if let Some(ref key) = self.signing_key {
            return Ok(key.as_bytes().to_vec());
        }
        let path = self.signing_key_path.as_ref().ok_or_else(|| {
            FiscalError::SigningKey("neither signing_key nor signing_key_path is set".into())
        })?;
        std::fs::read(path)
            .map_err(|e| FiscalError::SigningKey(format!("{}: {}", path.display(), e)))
    }
}

// =============================================================================
// Resilience
// =============================================================================

/// Per-call resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceSettings {
    /// Timeout of the first attempt; later attempts grow by 50% each.
    #[serde(default = "default_base_timeout")]
    pub base_timeout_ms: u64,

    /// Attempts per authority call before the job-level retry takes over.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Maximum pooled HTTP clients.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long to wait for a pooled client before going direct.
    #[serde(default = "default_pool_acquire_timeout")]
    pub pool_acquire_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// TTL of cached voucher lookups.
    #[serde(default = "default_lookup_cache_ttl")]
    pub lookup_cache_ttl_secs: u64,

    /// TTL of cached service status checks.
    #[serde(default = "default_status_cache_ttl")]
    pub status_cache_ttl_secs: u64,
}

fn default_base_timeout() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_pool_size() -> usize {
    4
}

fn default_pool_acquire_timeout() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_lookup_cache_ttl() -> u64 {
    600
}

fn default_status_cache_ttl() -> u64 {
    30
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        ResilienceSettings {
            base_timeout_ms: default_base_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            pool_size: default_pool_size(),
            pool_acquire_timeout_ms: default_pool_acquire_timeout(),
            cache_enabled: default_true(),
            lookup_cache_ttl_secs: default_lookup_cache_ttl(),
            status_cache_ttl_secs: default_status_cache_ttl(),
        }
    }
}

impl ResilienceSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// The response cache these settings describe; disabled when `cache_enabled` is off.
    pub fn response_cache(&self) -> ResponseCache {
        if !self.cache_enabled {
            return ResponseCache::disabled();
        }
        ResponseCache::new(CachePolicy {
            voucher_lookup: Duration::from_secs(self.lookup_cache_ttl_secs),
            service_status: Duration::from_secs(self.status_cache_ttl_secs),
        })
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Queue and batch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Jobs per `run-batch` invocation when `--max` is not given.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Retryable failures tolerated before a job fails permanently.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Unit of the retry delay (2^n × unit).
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: i64,

    /// Claims older than this are considered abandoned by a crashed worker.
    #[serde(default = "default_stale_claim_after")]
    pub stale_claim_after_secs: i64,

    /// Processing time assumed when there is no history yet.
    #[serde(default = "default_processing_ms")]
    pub default_processing_ms: i64,
}

fn default_batch_size() -> u32 {
    10
}

fn default_max_retries() -> i64 {
    titan_core::MAX_RETRIES
}

fn default_retry_base() -> i64 {
    60
}

fn default_stale_claim_after() -> i64 {
    600
}

fn default_processing_ms() -> i64 {
    titan_core::DEFAULT_PROCESSING_MS
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base(),
            stale_claim_after_secs: default_stale_claim_after(),
            default_processing_ms: default_processing_ms(),
        }
    }
}

impl QueueSettings {
    pub fn retry_schedule(&self) -> titan_core::retry::RetrySchedule {
        titan_core::retry::RetrySchedule {
            max_retries: self.max_retries,
            base: chrono::Duration::seconds(self.retry_base_secs),
        }
    }
}

// =============================================================================
// Invoice
// =============================================================================

/// Invoicing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSettings {
    /// Sales at or above this total get a Factura A when the customer has a CUIT.
    #[serde(default)]
    pub factura_a_threshold_cents: i64,

    #[serde(default = "default_fallback_description")]
    pub fallback_description: String,

    #[serde(default = "default_tax_rate_bps")]
    pub default_tax_rate_bps: u32,
}

fn default_fallback_description() -> String {
    titan_core::DEFAULT_LINE_DESCRIPTION.to_string()
}

fn default_tax_rate_bps() -> u32 {
    titan_core::DEFAULT_TAX_RATE_BPS
}

impl Default for InvoiceSettings {
    fn default() -> Self {
        InvoiceSettings {
            factura_a_threshold_cents: 0,
            fallback_description: default_fallback_description(),
            default_tax_rate_bps: default_tax_rate_bps(),
        }
    }
}

impl InvoiceSettings {
    pub fn to_rules(&self) -> InvoiceRules {
        InvoiceRules {
            factura_a_threshold: Money::from_cents(self.factura_a_threshold_cents),
            fallback_description: self.fallback_description.clone(),
            default_tax_rate: TaxRate::from_bps(self.default_tax_rate_bps),
        }
    }
}

// =============================================================================
// Ticket Cache
// =============================================================================

/// Where the access ticket is kept between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketCacheBackend {
    /// Process-local slot.
    #[default]
    Memory,
    /// Shared between workers through Redis.
    Redis,
}

impl std::str::FromStr for TicketCacheBackend {
    type Err = FiscalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(TicketCacheBackend::Memory),
            "redis" => Ok(TicketCacheBackend::Redis),
            other => Err(FiscalError::InvalidConfig(format!(
                "Unknown ticket cache backend: '{}'. Valid options: memory, redis",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCacheSettings {
    #[serde(default)]
    pub backend: TicketCacheBackend,

    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_ticket_key")]
    pub key: String,
}

fn default_ticket_key() -> String {
    "titan:fiscal:ticket".to_string()
}

impl Default for TicketCacheSettings {
    fn default() -> Self {
        TicketCacheSettings {
            backend: TicketCacheBackend::default(),
            redis_url: None,
            key: default_ticket_key(),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file shared with the POS. `:memory:` for throwaway runs.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "titan", "pos")
        .map(|dirs| dirs.data_dir().join("titan.db"))
        .unwrap_or_else(|| PathBuf::from("titan.db"))
}

fn default_db_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_db_connections(),
        }
    }
}

impl DatabaseSettings {
    pub fn to_db_config(&self) -> DbConfig {
        if self.path.as_os_str() == ":memory:" {
            return DbConfig::in_memory();
        }
        DbConfig::new(&self.path).max_connections(self.max_connections)
    }
}

// =============================================================================
// Fiscal Config
// =============================================================================

/// Complete fiscal pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiscalConfig {
    #[serde(default)]
    pub issuer: IssuerSettings,

    #[serde(default)]
    pub authority: AuthoritySettings,

    #[serde(default)]
    pub resilience: ResilienceSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub invoice: InvoiceSettings,

    #[serde(default)]
    pub ticket_cache: TicketCacheSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl FiscalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fiscal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> FiscalResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading fiscal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FiscalResult<()> {
        validate_cuit(&self.issuer.cuit)?;
        validate_point_of_sale(self.issuer.point_of_sale)?;

        let url = url::Url::parse(&self.authority.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FiscalError::InvalidUrl(format!(
                "Authority URL must start with http:// or https://, got: {}",
                self.authority.base_url
            )));
        }

        if self.authority.service.trim().is_empty() {
            return Err(FiscalError::InvalidConfig("authority.service must not be empty".into()));
        }

        if self.resilience.max_attempts == 0 {
            return Err(FiscalError::InvalidConfig(
                "resilience.max_attempts must be at least 1".into(),
            ));
        }

        if self.resilience.pool_size == 0 {
            return Err(FiscalError::InvalidConfig(
                "resilience.pool_size must be greater than 0".into(),
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(FiscalError::InvalidConfig(
                "queue.batch_size must be greater than 0".into(),
            ));
        }

        if self.queue.max_retries < 0 || self.queue.retry_base_secs <= 0 {
            return Err(FiscalError::InvalidConfig(
                "queue.max_retries must be >= 0 and queue.retry_base_secs > 0".into(),
            ));
        }

        if self.invoice.factura_a_threshold_cents < 0 {
            return Err(FiscalError::InvalidConfig(
                "invoice.factura_a_threshold_cents must not be negative".into(),
            ));
        }

        if TaxRate::from_bps(self.invoice.default_tax_rate_bps).vat_id().is_none() {
            return Err(FiscalError::InvalidConfig(format!(
                "invoice.default_tax_rate_bps {} is not an authority rate",
                self.invoice.default_tax_rate_bps
            )));
        }

        if self.ticket_cache.backend == TicketCacheBackend::Redis {
            let redis_url = self.ticket_cache.redis_url.as_deref().ok_or_else(|| {
                FiscalError::InvalidConfig("ticket_cache.redis_url is required for redis".into())
            })?;
            let parsed = url::Url::parse(redis_url)?;
            if parsed.scheme() != "redis" && parsed.scheme() != "rediss" {
                return Err(FiscalError::InvalidUrl(format!(
                    "Redis URL must start with redis:// or rediss://, got: {}",
                    redis_url
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TITAN_FISCAL_AUTHORITY_URL") {
            debug!(url = %url, "Overriding authority URL from environment");
            self.authority.base_url = url;
        }

        if let Ok(cuit) = std::env::var("TITAN_FISCAL_CUIT") {
            self.issuer.cuit = cuit;
        }

        if let Ok(pos) = std::env::var("TITAN_FISCAL_POINT_OF_SALE") {
            match pos.parse::<u32>() {
                Ok(p) => self.issuer.point_of_sale = p,
                Err(_) => warn!(value = %pos, "Ignoring non-numeric point of sale"),
            }
        }

        if let Ok(path) = std::env::var("TITAN_FISCAL_SIGNING_KEY_PATH") {
            self.authority.signing_key_path = Some(PathBuf::from(path));
        }

        if let Ok(key) = std::env::var("TITAN_FISCAL_SIGNING_KEY") {
            debug!("Using inline signing key from environment");
            self.authority.signing_key = Some(key);
        }

        if let Ok(path) = std::env::var("TITAN_FISCAL_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(size) = std::env::var("TITAN_FISCAL_BATCH_SIZE") {
            if let Ok(n) = size.parse::<u32>() {
                self.queue.batch_size = n;
            }
        }

        if let Ok(backend) = std::env::var("TITAN_FISCAL_TICKET_CACHE") {
            match backend.parse() {
                Ok(parsed) => self.ticket_cache.backend = parsed,
                Err(e) => warn!(%e, "Ignoring ticket cache backend from environment"),
            }
        }

        if let Ok(url) = std::env::var("TITAN_FISCAL_REDIS_URL") {
            self.ticket_cache.redis_url = Some(url);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "titan", "pos")
            .map(|dirs| dirs.config_dir().join("fiscal.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FiscalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.resilience.max_attempts, 3);
        assert_eq!(config.authority.ticket_refresh_margin_secs, 600);
        assert_eq!(config.ticket_cache.backend, TicketCacheBackend::Memory);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FiscalConfig::default();

        config.issuer.cuit = "20123456780".to_string();
        assert!(config.validate().is_err());
        config.issuer.cuit = "20-12345678-6".to_string();
        assert!(config.validate().is_ok());

        config.authority.base_url = "ftp://authority".to_string();
        assert!(config.validate().is_err());
        config.authority.base_url = "http://localhost:8080".to_string();
        assert!(config.validate().is_ok());

        config.invoice.default_tax_rate_bps = 1900;
        assert!(config.validate().is_err());
        config.invoice.default_tax_rate_bps = 1050;

        config.ticket_cache.backend = TicketCacheBackend::Redis;
        assert!(config.validate().is_err());
        config.ticket_cache.redis_url = Some("redis://127.0.0.1:6379".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FiscalConfig = toml::from_str(
            r#"
            [issuer]
            cuit = "30712345671"
            point_of_sale = 3

            [queue]
            batch_size = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.issuer.point_of_sale, 3);
        assert_eq!(config.issuer.business_name, "Titan POS");
        assert_eq!(config.queue.batch_size, 25);
        assert_eq!(config.queue.retry_base_secs, 60);
        assert_eq!(config.resilience.lookup_cache_ttl_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization_skips_inline_key() {
        let mut config = FiscalConfig::default();
        config.authority.signing_key = Some("secret".to_string());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[issuer]"));
        assert!(toml_str.contains("[ticket_cache]"));
        assert!(!toml_str.contains("secret"));
    }

    #[test]
    fn test_conversions() {
        let config = FiscalConfig::default();
        let profile = config.issuer.to_profile().unwrap();
        assert_eq!(profile.cuit, "20123456786");

        let rules = config.invoice.to_rules();
        assert_eq!(rules.default_tax_rate.bps(), 2100);

        let schedule = config.queue.retry_schedule();
        assert_eq!(schedule.base, chrono::Duration::minutes(1));

        let policy = config.resilience.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_timeout, Duration::from_secs(10));

        let mut resilience = config.resilience.clone();
        resilience.cache_enabled = false;
        let cache = resilience.response_cache();
        cache.put(
            crate::transport::Endpoint::ServiceStatus,
            &serde_json::json!({}),
            &serde_json::json!({"AppServer": "OK"}),
        );
        assert!(cache.is_empty());

        let db = DatabaseSettings {
            path: PathBuf::from(":memory:"),
            max_connections: 5,
        };
        assert!(db.to_db_config().is_in_memory());
    }
}
