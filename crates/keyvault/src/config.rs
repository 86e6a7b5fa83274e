//! Configuration loading and validation for the keyvault service.
//!
//! All values are read from environment variables at startup (the variable
//! name is the upper-case field name). The process exits with a clear error
//! message if any required variable is missing or invalid.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretBox;
use serde::Deserialize;

use crate::crypto::KdfParams;
use crate::escrow;
use crate::processor::ProcessorSettings;
use crate::secret_store::{RetryPolicy, SecretStoreSettings};

/// Validated service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// SQLite database file. **Required.**
    pub database_path: String,

    /// Base URL of the secret store. **Required.**
    pub secret_store_addr: String,

    /// KV v2 mount holding our secrets.
    #[serde(default = "default_secret_store_mount")]
    pub secret_store_mount: String,

    /// AppRole role id. **Required.**
    pub secret_store_role_id: String,

    /// AppRole secret id. **Required.**
    pub secret_store_secret_id: String,

    #[serde(default = "default_secret_store_timeout")]
    pub secret_store_timeout_secs: u64,

    #[serde(default = "default_secret_store_max_retries")]
    pub secret_store_max_retries: u32,

    #[serde(default = "default_secret_store_initial_backoff")]
    pub secret_store_initial_backoff_ms: u64,

    /// Renew the AppRole token this long before it expires.
    #[serde(default = "default_token_renew_margin")]
    pub secret_store_token_renew_margin_secs: u64,

    /// Delay between approval and execution of a recovery request.
    #[serde(default = "default_cooling_off")]
    pub cooling_off_secs: u64,

    /// How often the embedded processor runs.
    #[serde(default = "default_processor_interval")]
    pub processor_interval_secs: u64,

    #[serde(default = "default_processor_max_attempts")]
    pub processor_max_attempts: u32,

    #[serde(default = "default_processor_claim_ttl")]
    pub processor_claim_ttl_secs: u64,

    /// Run the time-delay processor inside the service instead of relying
    /// on the `recovery-cron` binary.
    #[serde(default)]
    pub processor_embedded: bool,

    /// Comma-separated custodian names. **Required.**
    pub escrow_custodians: Vec<String>,

    /// Shares needed to reconstruct an escrow or master key. **Required.**
    pub escrow_threshold: u8,

    #[serde(default = "default_unseal_session_ttl")]
    pub unseal_session_ttl_secs: u64,

    #[serde(default = "default_master_session_ttl")]
    pub master_session_ttl_secs: u64,

    #[serde(default = "default_kdf_memory")]
    pub kdf_memory_kib: u32,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Header carrying the authenticated principal id.
    #[serde(default = "default_actor_header")]
    pub actor_header_name: String,

    /// Header carrying the principal's role.
    #[serde(default = "default_role_header")]
    pub role_header_name: String,

    /// OTLP collector endpoint; spans are not exported when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("secret_store_addr", &self.secret_store_addr)
            .field("secret_store_mount", &self.secret_store_mount)
            .field("secret_store_role_id", &self.secret_store_role_id)
            .field("secret_store_secret_id", &"[REDACTED]")
            .field("cooling_off_secs", &self.cooling_off_secs)
            .field("processor_embedded", &self.processor_embedded)
            .field("escrow_custodians", &self.escrow_custodians)
            .field("escrow_threshold", &self.escrow_threshold)
            .field("listen_port", &self.listen_port)
            .finish_non_exhaustive()
    }
}

fn default_secret_store_mount() -> String {
    "secret".into()
}
fn default_secret_store_timeout() -> u64 {
    10
}
fn default_secret_store_max_retries() -> u32 {
    4
}
fn default_secret_store_initial_backoff() -> u64 {
    200
}
fn default_token_renew_margin() -> u64 {
    60
}
fn default_cooling_off() -> u64 {
    72 * 3600
}
fn default_processor_interval() -> u64 {
    300
}
fn default_processor_max_attempts() -> u32 {
    3
}
fn default_processor_claim_ttl() -> u64 {
    600
}
fn default_unseal_session_ttl() -> u64 {
    600
}
fn default_master_session_ttl() -> u64 {
    120
}
fn default_kdf_memory() -> u32 {
    64 * 1024
}
fn default_kdf_iterations() -> u32 {
    3
}
fn default_kdf_parallelism() -> u32 {
    1
}
fn default_listen_port() -> u16 {
    8080
}
fn default_actor_header() -> String {
    "X-Actor-Id".into()
}
fn default_role_header() -> String {
    "X-Actor-Role".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(env: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(
                env.try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("escrow_custodians"),
            )
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.database_path, "DATABASE_PATH")?;
        ensure_non_empty(&self.secret_store_addr, "SECRET_STORE_ADDR")?;
        ensure_non_empty(&self.secret_store_mount, "SECRET_STORE_MOUNT")?;
        ensure_non_empty(&self.secret_store_role_id, "SECRET_STORE_ROLE_ID")?;
        ensure_non_empty(&self.secret_store_secret_id, "SECRET_STORE_SECRET_ID")?;
        ensure_non_empty(&self.actor_header_name, "ACTOR_HEADER_NAME")?;
        ensure_non_empty(&self.role_header_name, "ROLE_HEADER_NAME")?;

        if !(self.secret_store_addr.starts_with("http://") || self.secret_store_addr.starts_with("https://")) {
            anyhow::bail!("SECRET_STORE_ADDR must be an http(s) URL");
        }
        if self.secret_store_timeout_secs == 0 {
            anyhow::bail!("SECRET_STORE_TIMEOUT_SECS must be > 0");
        }
        if self.cooling_off_secs == 0 || self.cooling_off_secs > MAX_PERIOD_SECS {
            anyhow::bail!("COOLING_OFF_SECS must be between 1 and {MAX_PERIOD_SECS}");
        }
        if self.processor_interval_secs == 0 {
            anyhow::bail!("PROCESSOR_INTERVAL_SECS must be > 0");
        }
        if self.processor_max_attempts == 0 {
            anyhow::bail!("PROCESSOR_MAX_ATTEMPTS must be > 0");
        }
        if self.processor_claim_ttl_secs == 0 || self.processor_claim_ttl_secs > MAX_PERIOD_SECS {
            anyhow::bail!("PROCESSOR_CLAIM_TTL_SECS must be between 1 and {MAX_PERIOD_SECS}");
        }
        let session_ttls = [self.unseal_session_ttl_secs, self.master_session_ttl_secs];
        if session_ttls.iter().any(|&t| t == 0 || t > MAX_PERIOD_SECS) {
            anyhow::bail!(
                "UNSEAL_SESSION_TTL_SECS and MASTER_SESSION_TTL_SECS must be between 1 and {MAX_PERIOD_SECS}"
            );
        }
        if self.kdf_iterations == 0 || self.kdf_parallelism == 0 {
            anyhow::bail!("KDF_ITERATIONS and KDF_PARALLELISM must be > 0");
        }
        let min_memory = self.kdf_parallelism.checked_mul(8).context("KDF_PARALLELISM is too large")?;
        if self.kdf_memory_kib < min_memory {
            anyhow::bail!("KDF_MEMORY_KIB must be at least 8 KiB per lane");
        }
        escrow::validate_roster(&self.escrow_custodians, self.escrow_threshold)
            .context("ESCROW_CUSTODIANS / ESCROW_THRESHOLD invalid")?;
        Ok(())
    }

    pub fn secret_store_settings(&self) -> SecretStoreSettings {
        SecretStoreSettings {
            addr: self.secret_store_addr.trim_end_matches('/').to_string(),
            mount: self.secret_store_mount.clone(),
            role_id: self.secret_store_role_id.clone(),
            secret_id: SecretBox::new(Box::new(self.secret_store_secret_id.clone())),
            timeout: Duration::from_secs(self.secret_store_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.secret_store_max_retries,
                initial_backoff: Duration::from_millis(self.secret_store_initial_backoff_ms),
                ..RetryPolicy::default()
            },
            renew_margin: Duration::from_secs(self.secret_store_token_renew_margin_secs),
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::new(self.kdf_memory_kib, self.kdf_iterations, self.kdf_parallelism)
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            max_attempts: self.processor_max_attempts,
            claim_ttl: chrono::Duration::seconds(secs_i64(self.processor_claim_ttl_secs)),
        }
    }

    pub fn cooling_off(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.cooling_off_secs))
    }

    pub fn unseal_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.unseal_session_ttl_secs))
    }

    pub fn master_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.master_session_ttl_secs))
    }
}

/// Upper bound for configured periods: ten years.
const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs.min(MAX_PERIOD_SECS)).unwrap_or(i64::MAX)
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
