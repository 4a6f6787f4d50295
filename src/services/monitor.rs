use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use futures_util::future::join_all;
use tokio::{sync::watch, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    clients::store::{SharedStore, get_json, set_json},
    models::{
        health::VendorHealthRecord,
        notification::Channel,
        vendor::{HealthReport, Vendor},
    },
    vendors::{VendorAdapter, registry::VendorRegistry},
};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_timeout: Duration,
    /// Records older than this are re-probed; also the record TTL.
    pub max_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            max_age: Duration::from_secs(30),
        }
    }
}

pub fn health_record_key(channel: Channel, vendor: Vendor) -> String {
    format!("vendor:health:{}:{}", channel, vendor)
}

/// Runs vendor health probes and owns every `VendorHealthRecord` write.
pub struct HealthMonitor {
    store: Arc<dyn SharedStore>,
    registry: Arc<VendorRegistry>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<VendorRegistry>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn cached(
        &self,
        channel: Channel,
        vendor: Vendor,
    ) -> Result<Option<VendorHealthRecord>, Error> {
        get_json(self.store.as_ref(), &health_record_key(channel, vendor)).await
    }

    /// Probes one vendor, bounded by the probe timeout, and stores the result.
    pub async fn probe(
        &self,
        channel: Channel,
        adapter: &dyn VendorAdapter,
    ) -> Result<VendorHealthRecord, Error> {
        let vendor = adapter.vendor();

        let report = match timeout(self.config.probe_timeout, adapter.check_health()).await {
            Ok(report) => report,
            Err(_) => HealthReport::unhealthy(
                self.config.probe_timeout.as_millis() as u64,
                format!(
                    "health probe exceeded {}ms",
                    self.config.probe_timeout.as_millis()
                ),
            ),
        };

        let record = VendorHealthRecord::from_report(vendor, report, adapter.success_rate());

        set_json(
            self.store.as_ref(),
            &health_record_key(channel, vendor),
            &record,
            Some(self.config.max_age.as_secs().max(1)),
        )
        .await?;

        if record.is_healthy {
            debug!(vendor = %vendor, channel = %channel, latency_ms = record.latency_ms, "Vendor health probe passed");
        } else {
            warn!(
                vendor = %vendor,
                channel = %channel,
                error = record.last_error.as_deref().unwrap_or_default(),
                "Vendor reported unhealthy"
            );
        }

        Ok(record)
    }

    /// Returns the stored record if it is recent enough, otherwise probes.
    pub async fn ensure_fresh(
        &self,
        channel: Channel,
        adapter: &dyn VendorAdapter,
    ) -> Result<VendorHealthRecord, Error> {
        if let Some(record) = self.cached(channel, adapter.vendor()).await? {
            if record.is_fresh(self.config.max_age) {
                return Ok(record);
            }
        }

        self.probe(channel, adapter).await
    }

    /// Probes every configured (channel, vendor) pair concurrently.
    pub async fn refresh_all(&self) {
        let probes = Channel::ALL.into_iter().flat_map(|channel| {
            self.registry
                .candidates(channel)
                .into_iter()
                .map(move |adapter| async move {
                    if let Err(e) = self.probe(channel, adapter.as_ref()).await {
                        warn!(
                            vendor = %adapter.vendor(),
                            channel = %channel,
                            error = %e,
                            "Failed to store vendor health"
                        );
                    }
                })
        });

        join_all(probes).await;
    }

    /// Refreshes every record once per `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "Vendor health monitor started");

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_all().await,
                _ = shutdown.changed() => break,
            }
        }

        info!("Vendor health monitor stopped");
    }
}
