//! The autoflow worker: PostgreSQL stores, SMTP delivery, and the process
//! that consumes run requests and performs housekeeping.

pub mod config;
pub mod db;
pub mod error;
pub mod mailer;
pub mod worker;
