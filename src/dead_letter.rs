//! Post-failure processing of dead-letter entries.
//!
//! Entries are consumed once: log the terminal failure with its full
//! metadata, alert the configured operators, then mark the record completed
//! so it is not re-processed. The record itself stays in the store for
//! inspection and manual requeue.

use std::sync::Arc;
use std::time::Duration;

use serde_email::Email;
use tokio::sync::watch;

use crate::backoff::DEAD_LETTER_QUEUE;
use crate::channel::Mailer;
use crate::config::Config;
use crate::error::Error;
use crate::job::JobRecord;
use crate::store::JobStore;

const CONSUMER_ID: &str = "dead-letter-processor";
const STORE_FAILURE_CEILING: i64 = 5;

pub struct DeadLetterProcessor {
    store: JobStore,
    mailer: Option<Arc<Mailer>>,
    recipients: Vec<Email>,
    poll_interval: Duration,
}

pub struct DeadLetterHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl DeadLetterHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl DeadLetterProcessor {
    pub fn new(
        store: JobStore,
        mailer: Option<Arc<Mailer>>,
        config: &Config,
    ) -> Self {
        let recipients = config
            .alert_recipients()
            .into_iter()
            .filter_map(|addr| match Email::from_str(&addr) {
                Ok(email) => Some(email),
                Err(e) => {
                    tracing::warn!(recipient = %addr, "ignoring invalid alert recipient: {e}");
                    None
                }
            })
            .collect();

        Self {
            store,
            mailer,
            recipients,
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
        }
    }

    pub fn spawn(self) -> DeadLetterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(self.run(shutdown_rx));

        DeadLetterHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("dead letter processor started");

        let mut store_failures: i64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(true) => {
                    store_failures = 0;
                }
                Ok(false) => {
                    store_failures = 0;
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    store_failures += 1;
                    if store_failures >= STORE_FAILURE_CEILING {
                        tracing::error!(error = %e, "job store unavailable, stopping dead letter processor");
                        break;
                    }

                    tracing::warn!(error = %e, "job store error in dead letter processor, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!("dead letter processor stopped");
    }

    /// Handles at most one waiting dead-letter entry. Returns whether an
    /// entry was processed. Alert failures are logged and never re-fail the
    /// entry.
    pub async fn process_next(&self) -> Result<bool, Error> {
        let Some(entry) = self.store.reserve(DEAD_LETTER_QUEUE, CONSUMER_ID).await? else {
            return Ok(false);
        };

        let message = &entry.message;

        tracing::error!(
            job_id = entry.id,
            message_id = %message.id,
            channel = %message.channel,
            destination = %message.destination,
            attempts = entry.attempt_count,
            last_error = entry.last_error.as_deref().unwrap_or("unknown"),
            first_attempted_at = entry.first_attempted_at.unwrap_or_default(),
            moved_to_dead_letter_at = entry.moved_to_dead_letter_at.unwrap_or_default(),
            "message exhausted delivery attempts"
        );

        if let Some(mailer) = &self.mailer {
            let (subject, body) = render_alert(&entry);

            for recipient in &self.recipients {
                if let Err(e) = mailer
                    .send(None, recipient.as_str(), &subject, Some(&body), None)
                    .await
                {
                    tracing::warn!(
                        job_id = entry.id,
                        recipient = recipient.as_str(),
                        error = %e,
                        "failed sending dead letter alert"
                    );
                }
            }
        }

        self.store.complete(entry.id).await?;

        Ok(true)
    }
}

fn format_timestamp(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn render_alert(entry: &JobRecord) -> (String, String) {
    let message = &entry.message;

    let subject = format!("Delivery failed: message {}", message.id);

    let body = format!(
        "A message has exhausted its delivery attempts and was moved to the \
         dead letter queue.\n\
         \n\
         Message id:      {}\n\
         Channel:         {}\n\
         Destination:     {}\n\
         Attempts:        {}\n\
         Last error:      {}\n\
         First attempted: {}\n\
         Dead lettered:   {}\n\
         \n\
         To retry, requeue it: POST /jobs/{}/requeue\n",
        message.id,
        message.channel,
        message.destination,
        entry.attempt_count,
        entry.last_error.as_deref().unwrap_or("unknown"),
        format_timestamp(entry.first_attempted_at),
        format_timestamp(entry.moved_to_dead_letter_at),
        entry.id,
    );

    (subject, body)
}
