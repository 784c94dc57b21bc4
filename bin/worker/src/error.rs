//! Startup failures of the worker process.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Configuration is missing or invalid.
    Config { message: String },
    /// Connecting to or migrating the database failed.
    Database { message: String },
    /// The credential key or HTTP transport could not be set up.
    Integration { message: String },
    /// NATS could not be reached or its streams set up.
    Messaging { message: String },
    /// The SMTP relay settings are invalid.
    Mail { message: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => write!(f, "configuration error: {message}"),
            Self::Database { message } => write!(f, "database error: {message}"),
            Self::Integration { message } => write!(f, "integration setup failed: {message}"),
            Self::Messaging { message } => write!(f, "messaging error: {message}"),
            Self::Mail { message } => write!(f, "mail setup failed: {message}"),
        }
    }
}

impl std::error::Error for WorkerError {}
