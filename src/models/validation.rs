use crate::{
    error::{DispatchError, DispatchResult},
    models::notification::{Channel, NotificationPayload},
};

/// Checks a send request and resolves its channel.
pub fn validate_request(channel: &str, payload: &NotificationPayload) -> DispatchResult<Channel> {
    let channel: Channel = channel.parse()?;

    if payload.recipient.trim().is_empty() {
        return Err(DispatchError::InvalidPayload(
            "Recipient cannot be empty".to_string(),
        ));
    }

    let has_content = payload
        .content
        .as_ref()
        .is_some_and(|c| !c.body.trim().is_empty());
    let has_template = payload
        .template_id
        .as_ref()
        .is_some_and(|t| !t.trim().is_empty());

    if !has_content && !has_template {
        return Err(DispatchError::InvalidPayload(
            "Either content or a template reference is required".to_string(),
        ));
    }

    validate_recipient(channel, &payload.recipient)?;

    Ok(channel)
}

pub fn validate_recipient(channel: Channel, recipient: &str) -> DispatchResult<()> {
    let result = match channel {
        Channel::Email => validate_email(recipient),
        Channel::Sms => validate_phone_number(recipient),
        Channel::Push => validate_device_token(recipient),
    };

    result.map_err(DispatchError::InvalidPayload)
}

fn validate_email(address: &str) -> Result<(), String> {
    let Some((local, domain)) = address.split_once('@') else {
        return Err(format!("'{}' is not an email address", address));
    };

    if local.is_empty() || domain.contains('@') || address.contains(char::is_whitespace) {
        return Err(format!("'{}' is not an email address", address));
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(format!("'{}' has an invalid domain", address));
    }

    Ok(())
}

/// E.164: a leading '+' followed by 8 to 15 digits, first digit non-zero.
fn validate_phone_number(number: &str) -> Result<(), String> {
    let Some(digits) = number.strip_prefix('+') else {
        return Err("Phone number must be in E.164 format (leading '+')".to_string());
    };

    if !(8..=15).contains(&digits.len()) {
        return Err("Phone number must have between 8 and 15 digits".to_string());
    }

    if !digits.chars().all(|c| c.is_ascii_digit()) || digits.starts_with('0') {
        return Err("Phone number contains invalid digits".to_string());
    }

    Ok(())
}

fn validate_device_token(token: &str) -> Result<(), String> {
    if token.len() < 20 {
        return Err("Device token too short (minimum 20 characters)".to_string());
    }

    if token.len() > 512 {
        return Err("Device token too long (maximum 512 characters)".to_string());
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '/'));

    if !valid_chars {
        return Err("Device token contains invalid characters".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::MessageContent;

    fn payload(recipient: &str) -> NotificationPayload {
        NotificationPayload {
            recipient: recipient.to_string(),
            content: Some(MessageContent {
                subject: Some("Hi".to_string()),
                body: "Hello".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_well_formed_requests() {
        assert_eq!(
            validate_request("email", &payload("ada@example.com")).unwrap(),
            Channel::Email
        );
        assert_eq!(
            validate_request("SMS", &payload("+14155550100")).unwrap(),
            Channel::Sms
        );
        assert_eq!(
            validate_request("push", &payload("fcm-token_0123456789:abcdef")).unwrap(),
            Channel::Push
        );
    }

    #[test]
    fn rejects_unknown_channel() {
        let err = validate_request("pigeon", &payload("ada@example.com")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidChannel(_)));
    }

    #[test]
    fn rejects_missing_recipient_and_content() {
        let err = validate_request("email", &payload("  ")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));

        let mut no_content = payload("ada@example.com");
        no_content.content = None;
        let err = validate_request("email", &no_content).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));

        no_content.template_id = Some("welcome".to_string());
        assert!(validate_request("email", &no_content).is_ok());
    }

    #[test]
    fn rejects_malformed_recipients() {
        assert!(validate_recipient(Channel::Email, "not-an-email").is_err());
        assert!(validate_recipient(Channel::Email, "a@b").is_err());
        assert!(validate_recipient(Channel::Sms, "4155550100").is_err());
        assert!(validate_recipient(Channel::Sms, "+0155550100").is_err());
        assert!(validate_recipient(Channel::Push, "short").is_err());
        assert!(validate_recipient(Channel::Push, "token with spaces in it!!").is_err());
    }
}
