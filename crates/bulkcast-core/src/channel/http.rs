//! HTTP messaging provider adapter

use super::{ChannelAdapter, SendOutcome};
use async_trait::async_trait;
use bulkcast_common::config::ChannelConfig;
use bulkcast_common::types::PhoneNumber;
use bulkcast_common::{Error, Result};
use bulkcast_storage::models::{FailureKind, Recipient};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct TextMessageRequest<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: TextBody<'a>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

/// Channel adapter posting text messages to a Cloud-API style provider
#[derive(Clone)]
pub struct HttpChannelAdapter {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl HttpChannelAdapter {
    /// Create an adapter for `{base_url}/{sender_id}/messages`
    pub fn new(base_url: &str, sender_id: &str, access_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Channel(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/{}/messages", base_url.trim_end_matches('/'), sender_id),
            access_token: access_token.into(),
        })
    }

    /// Create an adapter from the channel configuration
    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let sender_id = config
            .sender_id
            .as_deref()
            .ok_or_else(|| Error::Config("channel.sender_id is required for the http channel".to_string()))?;
        let access_token = config
            .access_token
            .clone()
            .ok_or_else(|| Error::Config("channel.access_token is required for the http channel".to_string()))?;

        Self::new(&config.base_url, sender_id, access_token)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Map a non-success HTTP status to a failure
    fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
        let reason = format!("provider returned {}: {}", status, body.trim());
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            SendOutcome::transient(reason)
        } else {
            SendOutcome::rejected(reason)
        }
    }
}

#[async_trait]
impl ChannelAdapter for HttpChannelAdapter {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, recipient: &Recipient, message: &str) -> SendOutcome {
        let Some(number) = PhoneNumber::parse(&recipient.address) else {
            return SendOutcome::failed(
                FailureKind::MalformedAddress,
                format!("Invalid phone number: {}", recipient.address),
            );
        };

        let request = TextMessageRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: number.as_str(),
            kind: "text",
            text: TextBody { body: message },
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(recipient_id = %recipient.id, "Provider request failed: {}", e);
                if e.is_timeout() {
                    return SendOutcome::failed(FailureKind::Timeout, e.to_string());
                }
                return SendOutcome::transient(e.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            let provider_message_id = match response.json::<SendResponse>().await {
                Ok(body) => body.messages.into_iter().next().map(|m| m.id),
                Err(e) => {
                    debug!("Could not read provider response: {}", e);
                    None
                }
            };
            return SendOutcome::delivered(provider_message_id);
        }

        let body = response.text().await.unwrap_or_default();
        Self::classify_status(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> HttpChannelAdapter {
        HttpChannelAdapter::new(&server.uri(), "1234567890", "secret").unwrap()
    }

    #[tokio::test]
    async fn test_delivered_with_provider_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/1234567890/messages"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "+15550000001",
                "type": "text",
                "text": { "body": "Hi Ada" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{ "id": "wamid.ABC" }]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = adapter(&mock_server)
            .send(&Recipient::new("+1 555 000 0001"), "Hi Ada")
            .await;

        assert_eq!(outcome, SendOutcome::delivered(Some("wamid.ABC".to_string())));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .mount(&mock_server)
            .await;

        match adapter(&mock_server).send(&Recipient::new("+15550000001"), "hi").await {
            SendOutcome::Failed { kind, .. } => assert!(kind.is_transient()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        match adapter(&mock_server).send(&Recipient::new("+15550000001"), "hi").await {
            SendOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Transport),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request"))
            .mount(&mock_server)
            .await;

        match adapter(&mock_server).send(&Recipient::new("+15550000001"), "hi").await {
            SendOutcome::Failed { kind, reason } => {
                assert_eq!(kind, FailureKind::Rejected);
                assert!(reason.contains("Bad Request"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_address_skips_network() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        match adapter(&mock_server).send(&Recipient::new("not-a-number"), "hi").await {
            SendOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::MalformedAddress),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let mut config = ChannelConfig::default();
        assert!(HttpChannelAdapter::from_config(&config).is_err());

        config.sender_id = Some("42".to_string());
        config.access_token = Some("token".to_string());
        let adapter = HttpChannelAdapter::from_config(&config).unwrap();
        assert_eq!(adapter.endpoint(), "https://graph.facebook.com/v22.0/42/messages");
    }
}
