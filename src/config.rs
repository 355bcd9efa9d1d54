//! Service configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{ApiClientConfig, PipelineConfig, PollerConfig, RetryPolicy, WorkerConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";
const ENV_PREFIX: &str = "COURIER_";

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed with `COURIER_` (highest priority), plus
///    the conventional unprefixed `DATABASE_URL`
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Only the bot token has no usable default.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled connections.
    pub database_max_connections: u32,
    /// Connections kept open when idle.
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    pub database_acquire_timeout_seconds: u64,

    // Platform API
    /// Bot API root URL.
    pub bot_api_url: String,
    /// Bot token.
    pub bot_token: String,
    /// Per-request HTTP timeout in seconds. Must exceed the long-poll
    /// timeout.
    pub http_timeout_seconds: u64,

    // Update polling
    /// Whether to long-poll `getUpdates`. Disable when updates arrive
    /// another way.
    pub polling_enabled: bool,
    /// Long-poll timeout in seconds.
    pub poll_timeout_seconds: u64,
    /// Maximum updates per poll.
    pub poll_limit: u32,

    // Router
    /// Endpoint receiving decoded updates.
    pub router_url: String,
    /// Router request timeout in seconds.
    pub router_timeout_seconds: u64,

    // Inbound worker
    /// Sleep between claims of an empty inbound queue, in milliseconds.
    pub inbound_poll_interval_ms: u64,
    /// Maximum inbound rows per claim.
    pub inbound_batch_size: usize,
    /// Inbound lease in seconds.
    pub inbound_lease_seconds: u64,
    /// Inbound attempt ceiling.
    pub inbound_max_attempts: u32,
    /// Inbound rows handled at once.
    pub inbound_max_concurrency: usize,

    // Outbound worker
    /// Sleep between claims of an empty outbound queue, in milliseconds.
    pub outbound_poll_interval_ms: u64,
    /// Maximum outbound rows per claim.
    pub outbound_batch_size: usize,
    /// Outbound lease in seconds. Raised at startup to cover the worst
    /// pacing wait plus the HTTP timeout.
    pub outbound_lease_seconds: u64,
    /// Outbound attempt ceiling.
    pub outbound_max_attempts: u32,
    /// Outbound rows handled at once.
    pub outbound_max_concurrency: usize,

    // Pacing and retry
    /// Minimum interval between paced sends to one chat, in milliseconds.
    pub destination_interval_ms: u64,
    /// Backoff unit in milliseconds.
    pub retry_min_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Attempts are clamped to this exponent before doubling.
    pub retry_max_exponent: u32,

    // Lifecycle
    /// Time allowed for in-flight work at shutdown, in seconds.
    pub shutdown_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        let pipeline = PipelineConfig::default();
        let api = ApiClientConfig::default();
        let poller = PollerConfig::default();

        Self {
            database_url: "postgresql://localhost/courier".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_acquire_timeout_seconds: 10,
            bot_api_url: api.base_url,
            bot_token: String::new(),
            http_timeout_seconds: api.timeout.as_secs(),
            polling_enabled: true,
            poll_timeout_seconds: poller.timeout_seconds,
            poll_limit: poller.limit,
            router_url: "http://127.0.0.1:8081/updates".to_string(),
            router_timeout_seconds: 30,
            inbound_poll_interval_ms: millis(worker.poll_interval),
            inbound_batch_size: worker.batch_size,
            inbound_lease_seconds: worker.lease.as_secs(),
            inbound_max_attempts: worker.max_attempts,
            inbound_max_concurrency: worker.max_concurrency,
            outbound_poll_interval_ms: millis(worker.poll_interval),
            outbound_batch_size: worker.batch_size,
            outbound_lease_seconds: pipeline.outbound.lease.as_secs(),
            outbound_max_attempts: worker.max_attempts,
            outbound_max_concurrency: worker.max_concurrency,
            destination_interval_ms: millis(pipeline.destination_interval),
            retry_min_backoff_ms: millis(pipeline.retry.min_backoff),
            retry_max_backoff_ms: millis(pipeline.retry.max_backoff),
            retry_max_exponent: pipeline.retry.max_exponent,
            shutdown_timeout_seconds: pipeline.shutdown_timeout.as_secs(),
        }
    }
}

impl Settings {
    /// Loads and validates the configuration.
    pub fn load() -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Pipeline tuning. Values are clamped again when the pipeline is built.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            inbound: WorkerConfig {
                poll_interval: Duration::from_millis(self.inbound_poll_interval_ms),
                batch_size: self.inbound_batch_size,
                lease: Duration::from_secs(self.inbound_lease_seconds),
                max_attempts: self.inbound_max_attempts,
                max_concurrency: self.inbound_max_concurrency,
            },
            outbound: WorkerConfig {
                poll_interval: Duration::from_millis(self.outbound_poll_interval_ms),
                batch_size: self.outbound_batch_size,
                lease: Duration::from_secs(self.outbound_lease_seconds),
                max_attempts: self.outbound_max_attempts,
                max_concurrency: self.outbound_max_concurrency,
            },
            retry: RetryPolicy {
                min_backoff: Duration::from_millis(self.retry_min_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                max_exponent: self.retry_max_exponent,
            },
            destination_interval: Duration::from_millis(self.destination_interval_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            call_timeout: Duration::from_secs(self.http_timeout_seconds),
        }
    }

    /// Bot API client settings.
    pub fn to_api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.bot_api_url.clone(),
            token: self.bot_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_seconds),
            ..ApiClientConfig::default()
        }
    }

    /// Update poller settings.
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            timeout_seconds: self.poll_timeout_seconds,
            limit: self.poll_limit,
            ..PollerConfig::default()
        }
    }

    /// Router request timeout.
    pub fn router_timeout(&self) -> Duration {
        Duration::from_secs(self.router_timeout_seconds)
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let credentials_start = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[credentials_start..at_pos].find(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(credentials_start + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("database_url must not be empty");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.bot_token.trim().is_empty() {
            anyhow::bail!("bot_token must be set (COURIER_BOT_TOKEN)");
        }

        if self.router_url.trim().is_empty() {
            anyhow::bail!("router_url must not be empty");
        }

        if self.polling_enabled && self.http_timeout_seconds <= self.poll_timeout_seconds {
            anyhow::bail!("http_timeout_seconds must exceed poll_timeout_seconds");
        }

        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_only_lack_a_token() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());

        let settings = Settings { bot_token: "1:abc".into(), ..Settings::default() };
        assert!(settings.validate().is_ok());
        assert_eq!(settings.to_pipeline_config(), PipelineConfig::default());
    }

    #[test]
    fn environment_overrides_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                bot_token = "from-file"
                outbound_batch_size = 50
                destination_interval_ms = 250
                "#,
            )?;
            jail.set_env("COURIER_BOT_TOKEN", "from-env");
            jail.set_env("COURIER_OUTBOUND_MAX_CONCURRENCY", "16");
            jail.set_env("DATABASE_URL", "postgresql://app:hunter2@db:5432/courier");

            let settings = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(settings.bot_token, "from-env");
            assert_eq!(settings.outbound_batch_size, 50);
            assert_eq!(settings.outbound_max_concurrency, 16);
            assert_eq!(settings.database_url, "postgresql://app:hunter2@db:5432/courier");

            let pipeline = settings.to_pipeline_config();
            assert_eq!(pipeline.outbound.batch_size, 50);
            assert_eq!(pipeline.call_timeout, Duration::from_secs(settings.http_timeout_seconds));
            assert_eq!(pipeline.destination_interval, Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn missing_token_fails_to_load() {
        Jail::expect_with(|_jail| {
            assert!(Settings::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn poll_timeout_must_fit_in_http_timeout() {
        let settings = Settings {
            bot_token: "1:abc".into(),
            poll_timeout_seconds: 60,
            http_timeout_seconds: 60,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings { polling_enabled: false, ..settings };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn database_password_is_masked() {
        let settings = Settings {
            database_url: "postgresql://app:hunter2@db:5432/courier".into(),
            ..Settings::default()
        };
        assert_eq!(settings.database_url_masked(), "postgresql://app:***@db:5432/courier");

        let settings =
            Settings { database_url: "postgresql://db:5432/courier".into(), ..Settings::default() };
        assert_eq!(settings.database_url_masked(), "postgresql://db:5432/courier");
    }
}
