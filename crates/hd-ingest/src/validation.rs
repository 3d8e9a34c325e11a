//! Request validation.
//!
//! The heavier schema validator sits in front of this service; these checks
//! are the invariants the pipeline itself cannot survive without.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::api::{BatchSubmitRequest, SubmitRequest};

pub fn validate_submit(request: &SubmitRequest) -> Result<(), String> {
    validate_uuid("request_id", &request.request_id)?;
    validate_uuid("client_id", &request.client_id)?;
    validate_channels(&request.channel)?;
    validate_recipient_fields("recipient", &request.recipient.user_id, &request.recipient.fields, &request.channel)?;
    validate_content(&request.content, &request.channel)?;
    validate_webhook_url(request.webhook_url.as_deref())?;
    Ok(())
}

pub fn validate_batch(request: &BatchSubmitRequest) -> Result<(), String> {
    validate_uuid("client_id", &request.client_id)?;
    validate_channels(&request.channel)?;

    if request.recipients.is_empty() {
        return Err("recipients must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for (index, recipient) in request.recipients.iter().enumerate() {
        let label = format!("recipients[{}]", index);
        validate_uuid(&format!("{}.request_id", label), &recipient.request_id)?;
        if !seen.insert(recipient.request_id.as_str()) {
            return Err(format!("{}: duplicate request_id in batch", label));
        }
        validate_recipient_fields(&label, &recipient.user_id, &recipient.fields, &request.channel)?;
    }

    validate_content(&request.content, &request.channel)?;
    validate_webhook_url(request.webhook_url.as_deref())?;
    Ok(())
}

fn validate_uuid(field: &str, value: &str) -> Result<(), String> {
    Uuid::parse_str(value).map_err(|_| format!("{} must be a valid UUID", field))?;
    Ok(())
}

fn validate_channels(channels: &[String]) -> Result<(), String> {
    if channels.is_empty() {
        return Err("channel must not be empty".to_string());
    }
    for channel in channels {
        if channel.trim().is_empty() {
            return Err("channel tags must not be blank".to_string());
        }
    }
    Ok(())
}

fn validate_recipient_fields(
    label: &str,
    user_id: &str,
    fields: &HashMap<String, serde_json::Value>,
    channels: &[String],
) -> Result<(), String> {
    if user_id.trim().is_empty() {
        return Err(format!("{}: user_id must not be empty", label));
    }
    for channel in channels {
        if !fields.contains_key(channel) {
            return Err(format!("{}: missing {} address", label, channel));
        }
    }
    Ok(())
}

fn validate_content(
    content: &HashMap<String, serde_json::Value>,
    channels: &[String],
) -> Result<(), String> {
    for channel in channels {
        if !content.contains_key(channel) {
            return Err(format!("content: missing entry for channel {}", channel));
        }
    }
    Ok(())
}

fn validate_webhook_url(url: Option<&str>) -> Result<(), String> {
    if let Some(url) = url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err("webhook_url must be an http(s) URL".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RecipientPayload;

    fn valid_request() -> SubmitRequest {
        serde_json::from_value(serde_json::json!({
            "request_id": "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4",
            "client_id": "7f1d6a20-1111-4222-8333-444455556666",
            "channel": ["email"],
            "recipient": { "user_id": "u1", "email": "a@example.com" },
            "content": { "email": { "subject": "S", "message": "M" } }
        }))
        .unwrap()
    }

    #[test]
    fn accepts_valid_request() {
        assert!(validate_submit(&valid_request()).is_ok());
    }

    #[test]
    fn rejects_malformed_request_id() {
        let mut request = valid_request();
        request.request_id = "not-a-uuid".to_string();
        assert!(validate_submit(&request).is_err());
    }

    #[test]
    fn rejects_missing_channel_content() {
        let mut request = valid_request();
        request.channel.push("telegram".to_string());
        request
            .recipient
            .fields
            .insert("telegram".to_string(), serde_json::json!("12345"));
        // content still only has the email entry
        let err = validate_submit(&request).unwrap_err();
        assert!(err.contains("telegram"));
    }

    #[test]
    fn rejects_missing_recipient_address() {
        let mut request = valid_request();
        request.recipient = RecipientPayload {
            user_id: "u1".to_string(),
            fields: HashMap::new(),
        };
        let err = validate_submit(&request).unwrap_err();
        assert!(err.contains("email"));
    }

    #[test]
    fn rejects_bad_webhook_url() {
        let mut request = valid_request();
        request.webhook_url = Some("ftp://example.com/hook".to_string());
        assert!(validate_submit(&request).is_err());
    }

    #[test]
    fn rejects_duplicate_request_ids_in_batch() {
        let batch: BatchSubmitRequest = serde_json::from_value(serde_json::json!({
            "client_id": "7f1d6a20-1111-4222-8333-444455556666",
            "channel": ["email"],
            "recipients": [
                { "request_id": "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4", "user_id": "u1", "email": "a@x.com" },
                { "request_id": "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4", "user_id": "u2", "email": "b@x.com" }
            ],
            "content": { "email": { "subject": "S", "message": "M" } }
        }))
        .unwrap();
        let err = validate_batch(&batch).unwrap_err();
        assert!(err.contains("duplicate"));
    }
}
