//! Core engine for multi-account Telegram monitoring and forwarding.
//!
//! This crate is intentionally transport-agnostic. Telegram sessions and the
//! account registry live behind ports (traits) implemented in adapter crates.

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod events;
pub mod formatting;
pub mod forwarder;
pub mod logging;
pub mod messaging;
pub mod monitor;
pub mod normalizer;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
pub use orchestrator::Engine;
