//! Background watcher that turns one iMessage conversation into calendar
//! events and reminders.
//!
//! A polling scanner tails the Messages database for a single contact,
//! hands new messages (with a little surrounding context) to a local LLM
//! for extraction, validates what comes back, and fans the surviving items
//! out to calendar, reminder, and push sinks. A persistent cursor keeps
//! every message processed at most once across restarts.

pub mod classifier;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod errors;
pub mod http_client;
pub mod message_store;
pub mod orchestrator;
pub mod sinks;
pub mod transcript;
