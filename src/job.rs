//! Job records and queue-level statistics.
//!
//! A job wraps a submitted message with its delivery state. Records are owned
//! by the job store for their whole lifetime and are mutated only through
//! store operations; everything here is the read-side representation.
//!
//! # State machine
//! Main-queue jobs move through waiting → active → completed, or cycle
//! through delayed on transient failure, until they either complete or are
//! moved to the dead-letter queue. Dead-letter records rest in waiting until
//! the dead-letter processor completes them, and are only removed by an
//! operator or reincarnated through requeue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::types::Json;

use crate::backoff::DEAD_LETTER_QUEUE;
use crate::error::Error;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::invalid_message(format!("unknown job state '{other}'"))),
        }
    }
}

/// The durable unit tracked by the job store.
///
/// All timestamps are epoch milliseconds. `attempt_count` is the number of
/// the in-progress or just-performed delivery try, starting at 1;
/// `first_attempted_at` is stamped on the first reservation and never reset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub state: JobState,
    pub message: Json<Message>,
    pub attempt_count: i64,
    pub not_before: i64,
    pub enqueued_at: i64,
    pub first_attempted_at: Option<i64>,
    pub last_error: Option<String>,
    pub moved_to_dead_letter_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub reserved_at: Option<i64>,
    pub reserved_by: Option<String>,
}

impl JobRecord {
    /// Dead-lettered jobs are identified by queue membership; their row
    /// state tracks only the dead-letter processor's progress.
    pub fn is_dead_lettered(&self) -> bool {
        self.queue == DEAD_LETTER_QUEUE
    }
}

/// Per-state counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

impl QueueCounts {
    pub fn total(&self) -> i64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Dead-letter counters; the dead-letter queue has no failed or delayed
/// population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
}

impl From<QueueCounts> for DeadLetterCounts {
    fn from(counts: QueueCounts) -> Self {
        Self {
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
        }
    }
}
