use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tracing::info;

use crate::{
    error::{DispatchError, DispatchResult},
    models::{notification::Channel, vendor::Vendor},
    vendors::{VendorAdapter, VendorSettings, build_adapter},
};

/// Vendor tag to adapter, plus each channel's priority order. Built once at
/// startup and read-only afterwards.
#[derive(Clone)]
pub struct VendorRegistry {
    adapters: HashMap<Vendor, Arc<dyn VendorAdapter>>,
    priorities: HashMap<Channel, Vec<Vendor>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            priorities: Channel::ALL
                .into_iter()
                .map(|channel| (channel, Self::default_priorities(channel)))
                .collect(),
        }
    }

    /// Builds an HTTP adapter for every vendor named in `priorities`.
    pub fn from_env(
        priorities: HashMap<Channel, Vec<Vendor>>,
        vendor_timeout: Duration,
    ) -> Result<Self, Error> {
        let mut registry = Self::new();

        for (channel, vendors) in priorities {
            registry = registry.with_priorities(channel, vendors)?;
        }

        let mut wanted: Vec<Vendor> = registry.priorities.values().flatten().copied().collect();
        wanted.sort();
        wanted.dedup();

        for vendor in wanted {
            let settings = VendorSettings::from_env(vendor)?;
            registry = registry.with_adapter(build_adapter(vendor, settings, vendor_timeout)?);
        }

        info!(
            vendors = registry.adapters.len(),
            "Vendor registry initialized"
        );

        Ok(registry)
    }

    pub fn default_priorities(channel: Channel) -> Vec<Vendor> {
        match channel {
            Channel::Email => vec![Vendor::Iterable, Vendor::SendGrid, Vendor::Ses],
            Channel::Sms => vec![Vendor::Telnyx, Vendor::Twilio, Vendor::Sns],
            Channel::Push => vec![Vendor::Iterable, Vendor::Sns],
        }
    }

    /// Parses a comma-separated priority list such as `"sendgrid,ses"`.
    pub fn parse_priorities(channel: Channel, raw: &str) -> DispatchResult<Vec<Vendor>> {
        let vendors = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::parse::<Vendor>)
            .collect::<DispatchResult<Vec<_>>>()?;

        Self::check_priorities(channel, &vendors)?;
        Ok(vendors)
    }

    fn check_priorities(channel: Channel, vendors: &[Vendor]) -> DispatchResult<()> {
        if vendors.is_empty() {
            return Err(DispatchError::InvalidArgument(format!(
                "no vendors configured for {}",
                channel
            )));
        }

        if let Some(vendor) = vendors.iter().find(|v| !v.supports(channel)) {
            return Err(DispatchError::InvalidArgument(format!(
                "{} cannot deliver {}",
                vendor, channel
            )));
        }

        Ok(())
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn VendorAdapter>) -> Self {
        self.adapters.insert(adapter.vendor(), adapter);
        self
    }

    pub fn with_priorities(mut self, channel: Channel, vendors: Vec<Vendor>) -> DispatchResult<Self> {
        Self::check_priorities(channel, &vendors)?;
        self.priorities.insert(channel, vendors);
        Ok(self)
    }

    pub fn adapter(&self, vendor: Vendor) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(&vendor).cloned()
    }

    pub fn priorities(&self, channel: Channel) -> &[Vendor] {
        self.priorities
            .get(&channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Registered adapters for `channel`, in priority order.
    pub fn candidates(&self, channel: Channel) -> Vec<Arc<dyn VendorAdapter>> {
        self.priorities(channel)
            .iter()
            .filter_map(|vendor| self.adapter(*vendor))
            .collect()
    }

    pub fn vendors(&self) -> impl Iterator<Item = Vendor> + '_ {
        self.adapters.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_priority_overrides() {
        let vendors = VendorRegistry::parse_priorities(Channel::Email, "sendgrid, ses").unwrap();
        assert_eq!(vendors, vec![Vendor::SendGrid, Vendor::Ses]);
    }

    #[test]
    fn rejects_vendor_that_cannot_serve_channel() {
        let err = VendorRegistry::parse_priorities(Channel::Sms, "twilio,sendgrid").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));

        let err = VendorRegistry::parse_priorities(Channel::Sms, "carrier-pigeon").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn default_push_order_prefers_iterable() {
        let registry = VendorRegistry::new();
        assert_eq!(
            registry.priorities(Channel::Push),
            &[Vendor::Iterable, Vendor::Sns]
        );
        assert!(registry.candidates(Channel::Push).is_empty());
    }
}
