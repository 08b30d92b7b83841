use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
    SqlitePoolOptions,
};

use crate::backoff::{DEAD_LETTER_QUEUE, MAIN_QUEUE};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::error::Error;
use crate::job::{DeadLetterCounts, JobRecord, JobState, QueueCounts};
use crate::message::Message;
use crate::store::JobStore;

pub const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Stats {
    pub main: QueueCounts,
    pub dead_letter: DeadLetterCounts,
}

/// Facade over the job store for producers and operators: submission,
/// inspection, and manual requeue.
#[derive(Clone)]
pub struct Service {
    store: JobStore,
    registry: Arc<ChannelRegistry>,
    config: Arc<Config>,
}

impl Service {
    pub async fn connect_with(config: Config, registry: ChannelRegistry) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            store: JobStore::new(pool),
            registry: Arc::new(registry),
            config: Arc::new(config),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates and enqueues a message for delivery. Unknown or
    /// unregistered channels are rejected here, synchronously; everything
    /// after this point is observable only through stats, listings and logs.
    pub async fn submit(&self, message: Message) -> Result<SubmitReceipt, Error> {
        message.validate()?;

        if !self.registry.supports(message.channel) {
            return Err(Error::invalid_message(format!(
                "unsupported channel '{}'",
                message.channel
            )));
        }

        let job_id = self
            .store
            .enqueue(MAIN_QUEUE, &message, JobState::Waiting)
            .await?;

        tracing::info!(
            job_id,
            message_id = %message.id,
            channel = %message.channel,
            "message accepted for delivery"
        );

        Ok(SubmitReceipt { job_id })
    }

    pub async fn stats(&self) -> Result<Stats, Error> {
        let main = self.store.counts(MAIN_QUEUE).await?;
        let dead_letter = self.store.counts(DEAD_LETTER_QUEUE).await?;

        Ok(Stats {
            main,
            dead_letter: dead_letter.into(),
        })
    }

    pub async fn list_main(
        &self,
        state: Option<JobState>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobRecord>, Error> {
        self.store.list(MAIN_QUEUE, state, offset, limit).await
    }

    pub async fn list_dead_letter(&self, offset: i64, limit: i64) -> Result<Vec<JobRecord>, Error> {
        self.store.list(DEAD_LETTER_QUEUE, None, offset, limit).await
    }

    pub async fn get(&self, job_id: i64) -> Result<JobRecord, Error> {
        self.store
            .get_any(&[MAIN_QUEUE, DEAD_LETTER_QUEUE], job_id)
            .await?
            .ok_or_else(|| Error::job_not_found(job_id))
    }

    /// Reincarnates a dead-letter (or failed main-queue) job as a fresh
    /// submission and removes the original record.
    ///
    /// Enqueue-then-remove, deliberately not transactional: a crash in
    /// between leaves the original visible and the operator retries.
    pub async fn requeue(&self, job_id: i64) -> Result<SubmitReceipt, Error> {
        let original = self
            .store
            .get_any(&[DEAD_LETTER_QUEUE, MAIN_QUEUE], job_id)
            .await?
            .ok_or_else(|| Error::job_not_found(job_id))?;

        if !original.is_dead_lettered() && original.state != JobState::Failed {
            return Err(Error::NotRequeueable {
                job_id,
                state: original.state,
            });
        }

        let new_job_id = self
            .store
            .enqueue(MAIN_QUEUE, &original.message, JobState::Waiting)
            .await?;

        self.store.remove(&original.queue, original.id).await?;

        tracing::info!(
            job_id = new_job_id,
            original_job_id = original.id,
            message_id = %original.message.id,
            "requeued message for delivery"
        );

        Ok(SubmitReceipt { job_id: new_job_id })
    }

    /// Removes a record outright from whichever queue holds it. The usual
    /// target is a dead-letter entry an operator has decided not to requeue.
    pub async fn remove(&self, job_id: i64) -> Result<(), Error> {
        let record = self.get(job_id).await?;

        self.store.remove(&record.queue, record.id).await?;

        tracing::info!(
            job_id,
            message_id = %record.message.id,
            queue = %record.queue,
            "removed job record"
        );

        Ok(())
    }

    /// Purges both queues. Test reset only.
    pub async fn obliterate(&self) -> Result<(), Error> {
        self.store.obliterate(MAIN_QUEUE).await?;
        self.store.obliterate(DEAD_LETTER_QUEUE).await?;

        Ok(())
    }
}
