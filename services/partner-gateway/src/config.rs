use config::{ConfigError, Environment, File};
use gateway_core::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub envelope: EnvelopeConfig,
    pub downstream: DownstreamConfig,
    pub voucher: VoucherConfig,
    pub queue: QueueConfig,
    pub auth: AuthConfig,
    pub ticketing: TicketingConfig,
    pub auto_entry: AutoEntryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Health check reports WARNING above this round-trip
    pub slow_threshold_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnvelopeConfig {
    /// Shared secret for partner-originated envelopes
    pub partner_key: String,
    /// Concurrent seal/open operations on the blocking pool
    pub crypto_workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cool_down_secs: u64,
    pub request_timeout_secs: u64,
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cool_down: Duration::from_secs(self.cool_down_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    /// Delay before retry n is `n * retry_delay_ms`
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DownstreamConfig {
    /// Per-attempt HTTP timeout
    pub attempt_timeout_secs: u64,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoucherConfig {
    pub attempt_timeout_secs: u64,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub lock_ttl_ms: u64,
    /// How long a dequeued job may run before it is handed out again
    pub lease_ms: u64,
    pub result_ttl_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub enforce_timestamp_window: bool,
    pub timestamp_window_minutes: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TicketingConfig {
    pub location_name: String,
    /// NMID printed on generated tickets
    pub store_id: String,
    pub location_code: String,
    /// E-billing page; tickets link to `<base>?p1=<store_id>&p2=<transactionNo>`
    pub ticket_url_base: String,
    pub default_grace_minutes: i64,
    pub max_update_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AutoEntryConfig {
    pub token_url: String,
    pub membership_url: String,
    pub grant_type: String,
    pub username: String,
    pub password: String,
    pub ticket_url_base: String,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9000)?
            .set_default("server.workers", 4)?
            .set_default("database.max_connections", 20)?
            .set_default("database.slow_threshold_ms", 1000)?
            .set_default("envelope.crypto_workers", 8)?
            .set_default("downstream.attempt_timeout_secs", 5)?
            .set_default("downstream.breaker.failure_threshold", 5)?
            .set_default("downstream.breaker.cool_down_secs", 10)?
            .set_default("downstream.breaker.request_timeout_secs", 30)?
            .set_default("downstream.retry.max_retries", 3)?
            .set_default("downstream.retry.retry_delay_ms", 1000)?
            .set_default("voucher.attempt_timeout_secs", 10)?
            .set_default("voucher.breaker.failure_threshold", 3)?
            .set_default("voucher.breaker.cool_down_secs", 15)?
            .set_default("voucher.breaker.request_timeout_secs", 10)?
            .set_default("voucher.retry.max_retries", 0)?
            .set_default("voucher.retry.retry_delay_ms", 1000)?
            .set_default("queue.name", "VoucherQueue")?
            .set_default("queue.concurrency", 5)?
            .set_default("queue.attempts", 3)?
            .set_default("queue.backoff_base_ms", 5000)?
            .set_default("queue.lock_ttl_ms", 30000)?
            .set_default("queue.lease_ms", 120000)?
            .set_default("queue.result_ttl_secs", 86400)?
            .set_default("queue.poll_interval_ms", 500)?
            .set_default("auth.enforce_timestamp_window", false)?
            .set_default("auth.timestamp_window_minutes", 20)?
            .set_default("ticketing.location_name", "LIPPO MALL PURI")?
            .set_default("ticketing.store_id", "ID2023262331937")?
            .set_default("ticketing.location_code", "007SK")?
            .set_default("ticketing.ticket_url_base", "https://devapps.skyparking.online/Ebilling")?
            .set_default("ticketing.default_grace_minutes", 5)?
            .set_default("ticketing.max_update_attempts", 3)?
            .set_default("auto_entry.token_url", "")?
            .set_default("auto_entry.membership_url", "")?
            .set_default("auto_entry.grant_type", "password")?
            .set_default("auto_entry.username", "")?
            .set_default("auto_entry.password", "")?
            .set_default("auto_entry.ticket_url_base", "https://billing.skyparking.online/Ebilling")?
            .set_default("auto_entry.timeout_secs", 3)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("PARTNER_GATEWAY")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", redis_url)?;
        }

        if let Ok(partner_key) = env::var("PARTNER_KEY") {
            builder = builder.set_override("envelope.partner_key", partner_key)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL is required".to_string());
        }

        if self.envelope.partner_key.is_empty() {
            return Err("Partner envelope key is required".to_string());
        }

        if self.envelope.crypto_workers == 0 {
            return Err("At least one crypto worker is required".to_string());
        }

        if self.queue.concurrency == 0 || self.queue.attempts == 0 {
            return Err("Queue concurrency and attempts must be positive".to_string());
        }

        // The lock must outlive one redemption attempt
        let redemption_budget_ms = self.voucher.breaker.request_timeout_secs * 1000;
        if self.queue.lock_ttl_ms <= redemption_budget_ms {
            return Err(format!(
                "Lock TTL ({}ms) must exceed the voucher request timeout ({}ms)",
                self.queue.lock_ttl_ms, redemption_budget_ms
            ));
        }

        if self.queue.lease_ms <= self.queue.lock_ttl_ms {
            return Err(format!(
                "Job lease ({}ms) must exceed the lock TTL ({}ms)",
                self.queue.lease_ms, self.queue.lock_ttl_ms
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
                workers: 1,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/gateway".to_string(),
                max_connections: 5,
                slow_threshold_ms: 1000,
            },
            redis: RedisConfig {
                url: "redis://localhost".to_string(),
            },
            envelope: EnvelopeConfig {
                partner_key: "shared".to_string(),
                crypto_workers: 2,
            },
            downstream: DownstreamConfig {
                attempt_timeout_secs: 5,
                breaker: BreakerSettings {
                    failure_threshold: 5,
                    cool_down_secs: 10,
                    request_timeout_secs: 30,
                },
                retry: RetrySettings {
                    max_retries: 3,
                    retry_delay_ms: 1000,
                },
            },
            voucher: VoucherConfig {
                attempt_timeout_secs: 10,
                breaker: BreakerSettings {
                    failure_threshold: 3,
                    cool_down_secs: 15,
                    request_timeout_secs: 10,
                },
                retry: RetrySettings {
                    max_retries: 0,
                    retry_delay_ms: 1000,
                },
            },
            queue: QueueConfig {
                name: "VoucherQueue".to_string(),
                concurrency: 5,
                attempts: 3,
                backoff_base_ms: 5000,
                lock_ttl_ms: 30000,
                lease_ms: 120000,
                result_ttl_secs: 60,
                poll_interval_ms: 100,
            },
            auth: AuthConfig {
                enforce_timestamp_window: false,
                timestamp_window_minutes: 20,
            },
            ticketing: TicketingConfig {
                location_name: "TEST MALL".to_string(),
                store_id: "ID1020".to_string(),
                location_code: "007SK".to_string(),
                ticket_url_base: "https://billing.example/Ebilling".to_string(),
                default_grace_minutes: 5,
                max_update_attempts: 3,
            },
            auto_entry: AutoEntryConfig {
                token_url: String::new(),
                membership_url: String::new(),
                grant_type: "password".to_string(),
                username: String::new(),
                password: String::new(),
                ticket_url_base: "https://billing.example/Ebilling".to_string(),
                timeout_secs: 3,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_lock_ttl_must_exceed_timeout() {
        let mut config = sample();
        config.queue.lock_ttl_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_must_outlive_lock() {
        let mut config = sample();
        config.queue.lease_ms = config.queue.lock_ttl_ms;
        assert!(config.validate().unwrap_err().starts_with("Job lease"));
    }

    #[test]
    fn test_partner_key_required() {
        let mut config = sample();
        config.envelope.partner_key.clear();
        assert_eq!(
            config.validate().unwrap_err(),
            "Partner envelope key is required"
        );
    }

    #[test]
    fn test_breaker_settings_conversion() {
        let breaker = sample().voucher.breaker.to_breaker_config();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.cool_down, Duration::from_secs(15));
    }
}
