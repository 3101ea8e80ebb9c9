//! Core domain + application logic for the DnD utility bot.
//!
//! This crate is intentionally framework-agnostic. Telegram lives behind ports
//! (traits) implemented in the adapter crate.

pub mod bot;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ledger;
pub mod limiter;
pub mod logging;
pub mod pipeline;
pub mod ports;
pub mod reply;

pub use errors::{Error, Result};
