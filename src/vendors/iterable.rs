use reqwest::RequestBuilder;
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

/// Iterable targeted sends. `account_id` holds the campaign id the message is
/// attributed to.
pub struct IterableProtocol;

impl VendorProtocol for IterableProtocol {
    const VENDOR: Vendor = Vendor::Iterable;
    const DEFAULT_BASE_URL: &'static str = "https://api.iterable.com";

    fn authorize(&self, request: RequestBuilder, settings: &VendorSettings) -> RequestBuilder {
        request.header("Api-Key", &settings.api_key)
    }

    fn send_request(
        &self,
        settings: &VendorSettings,
        channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        let campaign_id: i64 = settings
            .account_id
            .parse()
            .map_err(|_| format!("invalid Iterable campaign id '{}'", settings.account_id))?;

        let data_fields = json!({
            "subject": content.subject,
            "body": content.body,
        });

        match channel {
            Channel::Email => Ok(VendorRequest::post_json(
                "/api/email/target",
                json!({
                    "campaignId": campaign_id,
                    "recipientEmail": recipient,
                    "dataFields": data_fields,
                }),
            )),
            Channel::Push => Ok(VendorRequest::post_json(
                "/api/push/target",
                json!({
                    "campaignId": campaign_id,
                    "recipientUserId": recipient,
                    "dataFields": data_fields,
                }),
            )),
            Channel::Sms => Err("Iterable does not deliver sms".to_string()),
        }
    }

    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        if response.body.get("code")?.as_str()? != "Success" {
            return None;
        }

        response
            .body
            .pointer("/params/messageId")
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }

    fn status_request(
        &self,
        _settings: &VendorSettings,
        _channel: Channel,
        message_id: &str,
    ) -> Option<VendorRequest> {
        Some(VendorRequest::get(format!(
            "/api/messages/{}/status",
            message_id
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
            "queued" | "sent" => DeliveryState::Pending,
            "delivered" | "opened" | "clicked" => DeliveryState::Delivered,
            "bounced" | "failed" | "complained" | "unsubscribed" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn health_request(&self, _settings: &VendorSettings) -> VendorRequest {
        VendorRequest::get("/api/lists")
    }
}
