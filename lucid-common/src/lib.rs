//! # Lucid Common Library
//!
//! Shared code for the lucid image-intelligence crates including:
//! - Error types
//! - Configuration file resolution and loading
//! - Tracing initialisation
//! - Analysis event types and the EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
