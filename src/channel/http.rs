use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde_json::json;

use super::DeliveryHandler;
use crate::error::Error;
use crate::message::Message;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook delivery: POSTs the message as JSON to its destination URL.
/// A response status in [200, 300) counts as delivered; anything else,
/// including transport errors, fails the attempt.
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::internal)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryHandler for HttpHandler {
    async fn deliver(&self, message: &Message) -> Result<(), Error> {
        let body = json!({
            "id": message.id,
            "data": message.data,
            "metadata": message.metadata,
        });

        let message_id = HeaderValue::from_str(&message.id)
            .map_err(|_| Error::delivery("message id is not a valid header value"))?;

        let response = self
            .client
            .post(&message.destination)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Message-Id", message_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::delivery("request timed out")
                } else {
                    Error::delivery(format!("request error: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::delivery(format!("HTTP {status}")))
        }
    }
}
