use std::sync::Arc;

use async_trait::async_trait;

use super::DeliveryHandler;
use crate::error::Error;
use crate::message::Message;

type Routine = dyn Fn(&Message) -> Result<(), String> + Send + Sync;

/// In-process delivery: invokes a registered routine instead of leaving the
/// process. The default routine always succeeds; tests inject their own to
/// simulate failures.
pub struct InternalHandler {
    routine: Arc<Routine>,
}

impl InternalHandler {
    pub fn new() -> Self {
        Self::with_routine(|_| Ok(()))
    }

    pub fn with_routine<F>(routine: F) -> Self
    where
        F: Fn(&Message) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            routine: Arc::new(routine),
        }
    }
}

impl Default for InternalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryHandler for InternalHandler {
    async fn deliver(&self, message: &Message) -> Result<(), Error> {
        (self.routine)(message).map_err(Error::delivery)
    }
}
