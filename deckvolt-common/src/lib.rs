//! # DeckVolt Common Library
//!
//! Shared code for the DeckVolt voltage engine and its tools:
//! - Error types
//! - Event types and the broadcast EventBus
//! - Configuration file and state directory resolution
//! - Time helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{EventBus, VoltEvent};
