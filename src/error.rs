use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum CapstanError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Monitor error: {message}")]
    Monitor { message: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CapstanError {
    /// Whether this error points at the store being unreachable or its schema
    /// being broken, rather than at a specific job. The dispatch loop pauses
    /// for a fixed backoff on these before polling again.
    pub fn is_connectivity(&self) -> bool {
        match self {
            CapstanError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed => true,
                // 42703: column does not exist, 42P01: table does not exist
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("42703") | Some("42P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<toml::de::Error> for CapstanError {
    fn from(err: toml::de::Error) -> Self {
        CapstanError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for CapstanError {
    fn from(err: toml::ser::Error) -> Self {
        CapstanError::Config(format!("TOML serialization error: {}", err))
    }
}
