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

pub struct SendGridProtocol;

impl VendorProtocol for SendGridProtocol {
    const VENDOR: Vendor = Vendor::SendGrid;
    const DEFAULT_BASE_URL: &'static str = "https://api.sendgrid.com";

    fn send_request(
        &self,
        settings: &VendorSettings,
        _channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        let subject = content
            .subject
            .as_deref()
            .ok_or("SendGrid requires a subject")?;

        Ok(VendorRequest::post_json(
            "/v3/mail/send",
            json!({
                "personalizations": [{ "to": [{ "email": recipient }] }],
                "from": { "email": settings.sender },
                "subject": subject,
                "content": [{ "type": "text/plain", "value": content.body }],
            }),
        ))
    }

    /// The send endpoint answers 202 with an empty body; the id is a header.
    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        response
            .headers
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn status_request(
        &self,
        _settings: &VendorSettings,
        _channel: Channel,
        message_id: &str,
    ) -> Option<VendorRequest> {
        Some(VendorRequest::get(format!("/v3/messages/{}", message_id)))
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
            "processing" | "deferred" => DeliveryState::Pending,
            "delivered" => DeliveryState::Delivered,
            "not_delivered" | "bounce" | "dropped" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn status_timestamps(&self, response: &VendorResponse) -> HashMap<String, DateTime<Utc>> {
        collect_timestamps(&response.body, &["last_event_time"])
    }

    fn health_request(&self, _settings: &VendorSettings) -> VendorRequest {
        VendorRequest::get("/v3/scopes")
    }
}
