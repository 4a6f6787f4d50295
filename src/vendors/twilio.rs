use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;

use crate::{
    models::{
        notification::{Channel, MessageContent},
        vendor::{DeliveryState, Vendor},
    },
    vendors::{
        VendorSettings,
        http::{VendorProtocol, VendorRequest, VendorResponse, collect_timestamps},
    },
};

/// Twilio Programmable Messaging. `account_id` is the account SID and
/// `api_key` its auth token.
pub struct TwilioProtocol;

impl VendorProtocol for TwilioProtocol {
    const VENDOR: Vendor = Vendor::Twilio;
    const DEFAULT_BASE_URL: &'static str = "https://api.twilio.com";

    fn authorize(&self, request: RequestBuilder, settings: &VendorSettings) -> RequestBuilder {
        request.basic_auth(&settings.account_id, Some(&settings.api_key))
    }

    fn send_request(
        &self,
        settings: &VendorSettings,
        _channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        if settings.account_id.is_empty() {
            return Err("Twilio account SID is not configured".to_string());
        }

        Ok(VendorRequest::post_form(
            format!("/2010-04-01/Accounts/{}/Messages.json", settings.account_id),
            vec![
                ("To", recipient.to_string()),
                ("From", settings.sender.clone()),
                ("Body", content.body.clone()),
            ],
        ))
    }

    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .get("sid")
            .and_then(|sid| sid.as_str())
            .map(str::to_string)
    }

    fn status_request(
        &self,
        settings: &VendorSettings,
        _channel: Channel,
        message_id: &str,
    ) -> Option<VendorRequest> {
        Some(VendorRequest::get(format!(
            "/2010-04-01/Accounts/{}/Messages/{}.json",
            settings.account_id, message_id
        )))
    }

    fn native_status(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .get("status")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }

    fn normalize(&self, native_status: &str) -> DeliveryState {
        match native_status {
            "accepted" | "scheduled" | "queued" | "sending" | "sent" => DeliveryState::Pending,
            "delivered" | "read" => DeliveryState::Delivered,
            "undelivered" | "failed" | "canceled" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn status_timestamps(&self, response: &VendorResponse) -> HashMap<String, DateTime<Utc>> {
        collect_timestamps(&response.body, &["date_created", "date_sent", "date_updated"])
    }

    fn health_request(&self, settings: &VendorSettings) -> VendorRequest {
        VendorRequest::get(format!("/2010-04-01/Accounts/{}.json", settings.account_id))
    }
}
