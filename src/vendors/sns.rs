use reqwest::RequestBuilder;

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

const API_VERSION: &str = "2010-03-31";

/// Amazon SNS query API. SMS goes to a phone number, push to a platform
/// endpoint ARN. Like SES, outcomes are only published as delivery events.
pub struct SnsProtocol;

impl VendorProtocol for SnsProtocol {
    const VENDOR: Vendor = Vendor::Sns;
    const DEFAULT_BASE_URL: &'static str = "https://sns.us-east-1.amazonaws.com";

    fn authorize(&self, request: RequestBuilder, settings: &VendorSettings) -> RequestBuilder {
        request
            .bearer_auth(&settings.api_key)
            .header("Accept", "application/json")
    }

    fn send_request(
        &self,
        _settings: &VendorSettings,
        channel: Channel,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<VendorRequest, String> {
        let target = match channel {
            Channel::Sms => "PhoneNumber",
            Channel::Push => "TargetArn",
            Channel::Email => return Err("SNS does not deliver email".to_string()),
        };

        Ok(VendorRequest::post_form(
            "/",
            vec![
                ("Action", "Publish".to_string()),
                ("Version", API_VERSION.to_string()),
                (target, recipient.to_string()),
                ("Message", content.body.clone()),
            ],
        ))
    }

    fn message_id(&self, response: &VendorResponse) -> Option<String> {
        response
            .body
            .pointer("/PublishResponse/PublishResult/MessageId")
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
            "SUCCESS" => DeliveryState::Delivered,
            "FAILURE" => DeliveryState::Failed,
            _ => DeliveryState::Unknown,
        }
    }

    fn health_request(&self, _settings: &VendorSettings) -> VendorRequest {
        VendorRequest::post_form(
            "/",
            vec![
                ("Action", "GetSMSAttributes".to_string()),
                ("Version", API_VERSION.to_string()),
            ],
        )
    }
}
