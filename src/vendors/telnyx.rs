use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;

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

pub struct TelnyxProtocol;

impl VendorProtocol for TelnyxProtocol {
    const VENDOR: Vendor = Vendor::Telnyx;
    const DEFAULT_BASE_URL: &'static str = "https://api.telnyx.com";

    fn send_request(
        &self,
        settings: &VendorSettings,
        _channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        Ok(VendorRequest::post_json(
            "/v2/messages",
            json!({
                "from": settings.sender,
                "to": recipient,
                "text": content.body,
            }),
        ))
    }

    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .pointer("/data/id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }

    fn status_request(
        &self,
        _settings: &VendorSettings,
        _channel: Channel,
        message_id: &str,
    ) -> Option<VendorRequest> {
        Some(VendorRequest::get(format!("/v2/messages/{}", message_id)))
    }

    fn native_status(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .pointer("/data/to/0/status")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }

    fn normalize(&self, native_status: &str) -> DeliveryState {
        match native_status {
            "queued" | "sending" | "sent" => DeliveryState::Pending,
            "delivered" => DeliveryState::Delivered,
            "sending_failed" | "delivery_failed" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn status_timestamps(&self, response: &VendorResponse) -> HashMap<String, DateTime<Utc>> {
        response
            .body
            .get("data")
            .map(|data| collect_timestamps(data, &["received_at", "sent_at", "completed_at"]))
            .unwrap_or_default()
    }

    fn health_request(&self, _settings: &VendorSettings) -> VendorRequest {
        VendorRequest::get("/v2/balance")
    }
}
