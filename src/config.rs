use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    models::{
        circuit_breaker::BreakerConfig, notification::Channel, retry::RetryConfig, vendor::Vendor,
    },
    services::{
        gateway::GatewayConfig, monitor::MonitorConfig, orchestrator::OrchestratorConfig,
        worker::WorkerConfig,
    },
    vendors::registry::VendorRegistry,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    pub redis_url: String,

    pub template_service_url: String,
    #[serde(default = "default_template_language")]
    pub template_language: String,
    #[serde(default = "default_template_timeout_ms")]
    pub template_timeout_ms: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_status_cache_ttl_seconds")]
    pub status_cache_ttl_seconds: u64,
    #[serde(default = "default_attempts_ttl_seconds")]
    pub attempts_ttl_seconds: u64,

    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_batch_wait_seconds")]
    pub batch_wait_seconds: u64,
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_queue_call_timeout_ms")]
    pub queue_call_timeout_ms: u64,

    #[serde(default = "default_vendor_timeout_ms")]
    pub vendor_timeout_ms: u64,
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
    #[serde(default = "default_health_cache_ttl_seconds")]
    pub health_cache_ttl_seconds: u64,
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    #[serde(default)]
    pub email_vendors: Option<String>,
    #[serde(default)]
    pub sms_vendors: Option<String>,
    #[serde(default)]
    pub push_vendors: Option<String>,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_receive_wait_seconds")]
    pub receive_wait_seconds: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_queue_name() -> String {
    "notifications".to_string()
}

fn default_failed_queue_name() -> String {
    "notifications.failed".to_string()
}

fn default_prefetch_count() -> u16 {
    50
}

fn default_template_language() -> String {
    "en".to_string()
}

fn default_template_timeout_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_status_cache_ttl_seconds() -> u64 {
    3600
}

fn default_attempts_ttl_seconds() -> u64 {
    86400
}

fn default_batch_max_size() -> usize {
    10
}

fn default_batch_wait_seconds() -> u64 {
    5
}

fn default_visibility_timeout_seconds() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_queue_call_timeout_ms() -> u64 {
    10_000
}

fn default_vendor_timeout_ms() -> u64 {
    5000
}

fn default_health_probe_timeout_ms() -> u64 {
    500
}

fn default_health_cache_ttl_seconds() -> u64 {
    30
}

fn default_health_check_interval_seconds() -> u64 {
    15
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_receive_wait_seconds() -> u64 {
    5
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    /// Retry policy for calls to the template service.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_seconds),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            batch_max_size: self.batch_max_size,
            batch_wait: Duration::from_secs(self.batch_wait_seconds),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds),
            max_receive_count: self.max_receive_count,
            call_timeout: Duration::from_millis(self.queue_call_timeout_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            status_cache_ttl_seconds: self.status_cache_ttl_seconds,
            attempts_ttl_seconds: self.attempts_ttl_seconds,
            claim_timeout: Duration::from_secs(self.visibility_timeout_seconds),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            probe_timeout: Duration::from_millis(self.health_probe_timeout_ms),
            max_age: Duration::from_secs(self.health_cache_ttl_seconds),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            receive_batch_size: self.batch_max_size,
            receive_wait: Duration::from_secs(self.receive_wait_seconds),
            ..WorkerConfig::default()
        }
    }

    pub fn vendor_timeout(&self) -> Duration {
        Duration::from_millis(self.vendor_timeout_ms)
    }

    /// Per-channel priority lists, defaults overridden by `*_VENDORS`.
    pub fn vendor_priorities(&self) -> Result<HashMap<Channel, Vec<Vendor>>, Error> {
        let overrides = [
            (Channel::Email, &self.email_vendors),
            (Channel::Sms, &self.sms_vendors),
            (Channel::Push, &self.push_vendors),
        ];

        overrides
            .into_iter()
            .map(|(channel, raw)| {
                let vendors = match raw.as_deref() {
                    Some(raw) => VendorRegistry::parse_priorities(channel, raw)?,
                    None => VendorRegistry::default_priorities(channel),
                };
                Ok((channel, vendors))
            })
            .collect()
    }
}
