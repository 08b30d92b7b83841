//! Pluggable delivery channels.
//!
//! A handler is the only place that performs outbound I/O; the registry maps
//! a channel kind to its handler. Handlers classify their own failures into
//! short human-readable reasons; the processor treats everything they report
//! as transient and only an unresolvable channel as terminal.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::{ChannelKind, Message};

pub mod email;
pub mod http;
pub mod internal;

pub use email::{EmailHandler, Mailer};
pub use http::HttpHandler;
pub use internal::InternalHandler;

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), Error>;
}

impl fmt::Debug for dyn DeliveryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn DeliveryHandler")
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    handlers: HashMap<ChannelKind, Arc<dyn DeliveryHandler>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the production registry: HTTP and internal handlers always,
    /// email only when a mailer is available.
    pub fn with_defaults(mailer: Option<Arc<Mailer>>) -> Result<Self, Error> {
        let mut registry = Self::new();

        registry.register(ChannelKind::Http, Arc::new(HttpHandler::new()?));
        registry.register(ChannelKind::Internal, Arc::new(InternalHandler::new()));

        if let Some(mailer) = mailer {
            registry.register(ChannelKind::Email, Arc::new(EmailHandler::new(mailer)));
        }

        Ok(registry)
    }

    pub fn register(&mut self, kind: ChannelKind, handler: Arc<dyn DeliveryHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn supports(&self, kind: ChannelKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn resolve(&self, kind: ChannelKind) -> Result<Arc<dyn DeliveryHandler>, Error> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::unknown_channel(kind.as_str()))
    }

    /// Resolves then invokes in one step.
    pub async fn deliver(&self, message: &Message) -> Result<(), Error> {
        self.resolve(message.channel)?.deliver(message).await
    }
}
