//! Camera snapshot intake, rate-limited AI annotation, durable record lists
//! and retention.

pub mod cli;
pub mod commands;
pub mod env_loader;
pub mod error;
pub mod logging;
pub mod snap;
