use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Delivery mechanism for a submitted message. The set is closed; unknown
/// kinds are rejected at the submission boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Http,
    Email,
    Internal,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Email => "email",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "email" => Ok(Self::Email),
            "internal" => Ok(Self::Internal),
            other => Err(Error::invalid_message(format!(
                "unknown channel '{other}'"
            ))),
        }
    }
}

/// The payload submitted by a producer. Immutable once enqueued; the `id` is
/// producer-supplied and used for correlation, not uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel: ChannelKind,
    pub destination: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Message {
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_message("id must not be empty"));
        }
        if self.destination.trim().is_empty() {
            return Err(Error::invalid_message("destination must not be empty"));
        }
        Ok(())
    }
}

/// Channel-specific content for email deliveries, read out of
/// `Message::data`. Every field is optional; the handler falls back to the
/// configured sender and a default subject.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailContent {
    pub from: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl EmailContent {
    pub fn from_message(message: &Message) -> Result<Self, Error> {
        serde_json::from_value(Value::Object(message.data.clone()))
            .map_err(|e| Error::delivery(format!("invalid email content: {e}")))
    }
}
