pub mod http;
pub mod iterable;
pub mod registry;
pub mod sendgrid;
pub mod ses;
pub mod sns;
pub mod telnyx;
pub mod twilio;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    error::VendorError,
    models::{
        notification::{Channel, NotificationPayload},
        vendor::{HealthReport, SendReceipt, Vendor, VendorStatus},
    },
    vendors::{
        http::HttpVendorAdapter, iterable::IterableProtocol, sendgrid::SendGridProtocol,
        ses::SesProtocol, sns::SnsProtocol, telnyx::TelnyxProtocol, twilio::TwilioProtocol,
    },
};

/// Where in a delivery round a vendor call happens, plus the breaker the
/// selector already consulted for this vendor.
pub struct AttemptContext<'a> {
    pub channel: Channel,
    pub tenant: &'a str,
    pub failover_attempt: u32,
    pub breaker: &'a CircuitBreaker,
}

/// Uniform contract every vendor integration implements.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn supports(&self, channel: Channel) -> bool {
        self.vendor().supports(channel)
    }

    /// Delivers one message. Consults `ctx.breaker` before any network call
    /// and reports the outcome back to it.
    async fn send(
        &self,
        payload: &NotificationPayload,
        ctx: &AttemptContext<'_>,
    ) -> Result<SendReceipt, VendorError>;

    async fn get_status(
        &self,
        channel: Channel,
        message_id: &str,
    ) -> Result<VendorStatus, VendorError>;

    /// Never fails; problems are reported as an unhealthy report.
    async fn check_health(&self) -> HealthReport;

    /// Share of successful sends since startup, 1.0 before the first send.
    fn success_rate(&self) -> f64;
}

/// Per-vendor settings, read from `{VENDOR}_*` environment variables.
#[derive(Clone, Deserialize, Debug, Default)]
pub struct VendorSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub sender: String,

    #[serde(default)]
    pub account_id: String,
}

impl VendorSettings {
    pub fn from_env(vendor: Vendor) -> Result<Self, Error> {
        envy::prefixed(vendor.env_prefix())
            .from_env::<Self>()
            .map_err(|e| anyhow!("Invalid settings for vendor {}: {}", vendor, e))
    }
}

#[derive(Debug, Default)]
pub struct SendCounters {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl SendCounters {
    pub fn record(&self, success: bool) {
        let counter = if success {
            &self.successes
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_rate(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        let total = successes + self.failures.load(Ordering::Relaxed);

        if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        }
    }
}

pub fn build_adapter(
    vendor: Vendor,
    settings: VendorSettings,
    timeout: Duration,
) -> Result<Arc<dyn VendorAdapter>, Error> {
    let adapter: Arc<dyn VendorAdapter> = match vendor {
        Vendor::Iterable => Arc::new(HttpVendorAdapter::new(IterableProtocol, settings, timeout)?),
        Vendor::SendGrid => Arc::new(HttpVendorAdapter::new(SendGridProtocol, settings, timeout)?),
        Vendor::Ses => Arc::new(HttpVendorAdapter::new(SesProtocol, settings, timeout)?),
        Vendor::Telnyx => Arc::new(HttpVendorAdapter::new(TelnyxProtocol, settings, timeout)?),
        Vendor::Twilio => Arc::new(HttpVendorAdapter::new(TwilioProtocol, settings, timeout)?),
        Vendor::Sns => Arc::new(HttpVendorAdapter::new(SnsProtocol, settings, timeout)?),
    };

    Ok(adapter)
}
