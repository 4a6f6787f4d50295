use std::sync::Arc;

use anyhow::{Error, Result};
use tracing::{debug, info, warn};

use crate::{
    clients::{circuit_breaker::{BreakerRegistry, CircuitBreaker}, store::SharedStore},
    error::{DispatchError, DispatchResult, VendorError, VendorErrorKind},
    models::{
        notification::Channel,
        vendor::{SkipReason, Vendor, VendorDiagnostic},
    },
    services::monitor::HealthMonitor,
    vendors::{VendorAdapter, registry::VendorRegistry},
};

pub fn selection_cache_key(channel: Channel) -> String {
    format!("vendor:health:{}", channel)
}

/// The vendor to try next, with the breaker handle that admitted it.
pub struct SelectedVendor {
    pub adapter: Arc<dyn VendorAdapter>,
    pub breaker: CircuitBreaker,
    /// Higher-priority vendors passed over on the way to this one.
    pub skipped: Vec<VendorDiagnostic>,
}

impl SelectedVendor {
    pub fn vendor(&self) -> Vendor {
        self.adapter.vendor()
    }
}

/// Picks a vendor per channel and owns the failover policy.
pub struct Selector {
    registry: Arc<VendorRegistry>,
    breakers: BreakerRegistry,
    monitor: Arc<HealthMonitor>,
    store: Arc<dyn SharedStore>,
    cache_ttl_seconds: u64,
}

impl Selector {
    pub fn new(
        registry: Arc<VendorRegistry>,
        breakers: BreakerRegistry,
        monitor: Arc<HealthMonitor>,
        store: Arc<dyn SharedStore>,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            registry,
            breakers,
            monitor,
            store,
            cache_ttl_seconds,
        }
    }

    pub fn registry(&self) -> &VendorRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Whether a vendor error should move delivery on to the next vendor.
    /// A request the vendor rejected as malformed would be rejected by the
    /// others too.
    pub fn should_failover(error: &VendorError) -> bool {
        match error.kind {
            VendorErrorKind::Unavailable | VendorErrorKind::RateLimited | VendorErrorKind::Auth => {
                true
            }
            VendorErrorKind::InvalidRequest => false,
        }
    }

    pub async fn get_healthy_vendor(
        &self,
        channel: Channel,
        tenant: &str,
    ) -> DispatchResult<SelectedVendor> {
        self.select(channel, tenant, &[]).await
    }

    /// Highest-priority available vendor not in `exclude`.
    pub async fn select(
        &self,
        channel: Channel,
        tenant: &str,
        exclude: &[Vendor],
    ) -> DispatchResult<SelectedVendor> {
        if let Some(selected) = self.cached_selection(channel, tenant, exclude).await? {
            return Ok(selected);
        }

        let mut trail = Vec::new();

        for &vendor in self.registry.priorities(channel) {
            let breaker = self.breakers.for_vendor(vendor, channel, tenant);

            if exclude.contains(&vendor) {
                trail.push(Self::diagnose(vendor, &breaker, SkipReason::Excluded, None).await?);
                continue;
            }

            let Some(adapter) = self.registry.adapter(vendor) else {
                continue;
            };

            if !breaker.is_available().await? {
                debug!(vendor = %vendor, channel = %channel, tenant, "Skipping vendor with open circuit");
                trail.push(Self::diagnose(vendor, &breaker, SkipReason::CircuitOpen, None).await?);
                continue;
            }

            let health = self.monitor.ensure_fresh(channel, adapter.as_ref()).await?;
            if !health.is_healthy {
                if breaker.holds_trial() {
                    breaker.record_failure().await?;
                }
                trail.push(
                    Self::diagnose(vendor, &breaker, SkipReason::Unhealthy, health.last_error)
                        .await?,
                );
                continue;
            }

            self.cache_selection(channel, vendor).await?;

            info!(vendor = %vendor, channel = %channel, tenant, "Vendor selected");
            return Ok(SelectedVendor {
                adapter,
                breaker,
                skipped: trail
                    .into_iter()
                    .filter(|d| d.reason != SkipReason::Excluded)
                    .collect(),
            });
        }

        warn!(channel = %channel, tenant, "No vendor available");
        Err(DispatchError::FailoverExhausted { channel, trail })
    }

    async fn cached_selection(
        &self,
        channel: Channel,
        tenant: &str,
        exclude: &[Vendor],
    ) -> DispatchResult<Option<SelectedVendor>> {
        let Some(raw) = self.store.get(&selection_cache_key(channel)).await? else {
            return Ok(None);
        };

        let Some(vendor) = raw.parse::<Vendor>().ok().filter(|v| !exclude.contains(v)) else {
            return Ok(None);
        };

        let Some(adapter) = self
            .registry
            .adapter(vendor)
            .filter(|_| self.registry.priorities(channel).contains(&vendor))
        else {
            return Ok(None);
        };

        let breaker = self.breakers.for_vendor(vendor, channel, tenant);
        if !breaker.is_available().await? {
            return Ok(None);
        }

        debug!(vendor = %vendor, channel = %channel, "Using cached vendor selection");
        Ok(Some(SelectedVendor {
            adapter,
            breaker,
            skipped: Vec::new(),
        }))
    }

    async fn cache_selection(&self, channel: Channel, vendor: Vendor) -> Result<(), Error> {
        self.store
            .set_ex(
                &selection_cache_key(channel),
                vendor.as_str(),
                self.cache_ttl_seconds,
            )
            .await
    }

    async fn diagnose(
        vendor: Vendor,
        breaker: &CircuitBreaker,
        reason: SkipReason,
        detail: Option<String>,
    ) -> Result<VendorDiagnostic, Error> {
        Ok(VendorDiagnostic {
            vendor,
            breaker: breaker.get_state().await?,
            reason,
            detail,
        })
    }
}
