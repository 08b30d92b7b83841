use snafu::Snafu;

use crate::job::JobState;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid message: {reason}"))]
    InvalidMessage { reason: String },

    #[snafu(display("No delivery handler registered for channel '{kind}'"))]
    UnknownChannel { kind: String },

    #[snafu(display("Delivery failed: {reason}"))]
    Delivery { reason: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Job {job_id} cannot be requeued from state {state}"))]
    NotRequeueable { job_id: i64, state: JobState },

    #[snafu(display("Error returned from job store"))]
    Store {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Internal server error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Store { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn delivery(reason: impl Into<String>) -> Self {
        Self::Delivery {
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn job_not_found(job_id: i64) -> Self {
        Self::NotFound {
            resource: format!("job {job_id}"),
        }
    }

    pub fn unknown_channel(kind: impl Into<String>) -> Self {
        Self::UnknownChannel { kind: kind.into() }
    }

    /// Whether a delivery-time failure should be retried. Everything a
    /// handler reports is transient; only a missing handler is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::UnknownChannel { .. })
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::InvalidMessage { .. } | Self::UnknownChannel { .. } => {
                actix_web::http::StatusCode::BAD_REQUEST
            }
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,
            Self::NotRequeueable { .. } => actix_web::http::StatusCode::CONFLICT,
            Self::Store { .. } => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,

            Self::Delivery { .. } | Self::Migration { .. } | Self::Internal { .. } => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
