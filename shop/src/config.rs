//! Configuration management for the storefront.
//!
//! Loads configuration from environment variables with sensible defaults. A
//! backend whose URL is unset falls back to its in-process implementation.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use storefront_runtime::{LockOptions, RetryPolicy};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `PostgreSQL` storage
    pub postgres: PostgresConfig,
    /// Redis coordination store
    pub redis: RedisConfig,
    /// RedPanda/Kafka event bus
    pub redpanda: RedpandaConfig,
    /// Lock executor defaults
    pub locks: LockConfig,
    /// Optimistic retry
    pub retry: RetryConfig,
    /// Prometheus listener, if any
    pub metrics_addr: Option<SocketAddr>,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL; in-memory storage when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL; in-memory coordination when unset
    pub url: Option<String>,
}

/// RedPanda/Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated); events are only recorded when unset
    pub brokers: Option<String>,
    /// Topic for order completion events
    pub order_events_topic: String,
}

/// Lock executor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Wait time for a whole key set in milliseconds (default: 3000)
    pub wait_ms: u64,
    /// Lease time per key in milliseconds (default: 5000)
    pub lease_ms: u64,
    /// Renew leases while the action runs (default: true)
    pub auto_extend: bool,
}

/// Optimistic retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 5)
    pub max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its
    /// value.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            postgres: PostgresConfig {
                url: non_empty("DATABASE_URL"),
                max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            },
            redis: RedisConfig {
                url: non_empty("REDIS_URL"),
            },
            redpanda: RedpandaConfig {
                brokers: non_empty("REDPANDA_BROKERS"),
                order_events_topic: non_empty("ORDER_EVENTS_TOPIC")
                    .unwrap_or_else(|| "order-completed".to_string()),
            },
            locks: LockConfig {
                wait_ms: lookup("LOCK_WAIT_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3000),
                lease_ms: lookup("LOCK_LEASE_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5000),
                auto_extend: lookup("LOCK_AUTO_EXTEND")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(true),
            },
            retry: RetryConfig {
                max_attempts: lookup("OPTIMISTIC_MAX_ATTEMPTS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            },
            metrics_addr: lookup("METRICS_ADDR").and_then(|s| s.parse().ok()),
        }
    }

    /// Lock executor options.
    #[must_use]
    pub const fn lock_options(&self) -> LockOptions {
        LockOptions::new(
            Duration::from_millis(self.locks.wait_ms),
            Duration::from_millis(self.locks.lease_ms),
        )
        .with_auto_extend(self.locks.auto_extend)
    }

    /// Optimistic retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.retry.max_attempts)
            .build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_use_in_process_backends() {
        let config = Config::default();

        assert!(config.postgres.url.is_none());
        assert!(config.redis.url.is_none());
        assert!(config.redpanda.brokers.is_none());
        assert_eq!(config.redpanda.order_events_topic, "order-completed");
        assert_eq!(config.locks.wait_ms, 3000);
        assert_eq!(config.locks.lease_ms, 5000);
        assert!(config.locks.auto_extend);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://shop@db/shop"),
            ("REDIS_URL", "redis://cache:6379"),
            ("LOCK_WAIT_MS", "250"),
            ("LOCK_AUTO_EXTEND", "false"),
            ("OPTIMISTIC_MAX_ATTEMPTS", "9"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
            ("REDPANDA_BROKERS", "  "),
        ]);
        let config = Config::from_lookup(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.postgres.url.as_deref(), Some("postgres://shop@db/shop"));
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));
        assert!(config.redpanda.brokers.is_none());
        assert_eq!(config.lock_options().wait_time, Duration::from_millis(250));
        assert!(!config.lock_options().auto_extend);
        assert_eq!(config.retry_policy().max_attempts, 9);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let config = Config::from_lookup(|key| (key == "LOCK_LEASE_MS").then(|| "soon".to_string()));
        assert_eq!(config.locks.lease_ms, 5000);
    }
}
