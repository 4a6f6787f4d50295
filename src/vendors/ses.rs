use serde_json::json;

use crate::{
    models::{
        notification::{Channel, MessageContent},
        vendor::{DeliveryState, Vendor},
    },
    vendors::{
        VendorSettings,
        http::{VendorProtocol, VendorRequest, VendorResponse},
    },
};

/// Amazon SES v2. Delivery outcomes arrive as event notifications, so there
/// is no per-message status lookup.
pub struct SesProtocol;

impl VendorProtocol for SesProtocol {
    const VENDOR: Vendor = Vendor::Ses;
    const DEFAULT_BASE_URL: &'static str = "https://email.us-east-1.amazonaws.com";

    fn send_request(
        &self,
        settings: &VendorSettings,
        _channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        Ok(VendorRequest::post_json(
            "/v2/email/outbound-emails",
            json!({
                "FromEmailAddress": settings.sender,
                "Destination": { "ToAddresses": [recipient] },
                "Content": {
                    "Simple": {
                        "Subject": { "Data": content.subject.as_deref().unwrap_or_default() },
                        "Body": { "Text": { "Data": content.body } },
                    }
                },
            }),
        ))
    }

    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .get("MessageId")
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }

    fn status_request(
        &self,
        _settings: &VendorSettings,
        _channel: Channel,
        _message_id: &str,
    ) -> Option<VendorRequest> {
        None
    }

    fn native_status(&self, _response: &VendorResponse) -> Option<String> {
        None
    }

    fn normalize(&self, native_status: &str) -> DeliveryState {
        match native_status {
            "Send" => DeliveryState::Pending,
            "Delivery" => DeliveryState::Delivered,
            "Bounce" | "Reject" | "Complaint" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn health_request(&self, _settings: &VendorSettings) -> VendorRequest {
        VendorRequest::get("/v2/email/account")
    }
}
