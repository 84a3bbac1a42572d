//! # Marquee Common Library
//!
//! Shared code for the Marquee import services:
//! - Error and result types
//! - Configuration loading and root folder resolution
//! - SQLite initialization and schema
//! - Import event types and the broadcast EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
