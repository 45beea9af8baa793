//! # DeckVolt Engine Library (deckvolt-engine)
//!
//! Dynamic per-core CPU voltage offsets for handheld devices.
//!
//! **Purpose:** Map live load or frequency to an undervolt per core, find
//! the most aggressive stable offsets through automated stress testing,
//! and keep the device out of unstable states across hangs and crashes.
//!
//! **Architecture:** `curve` and `limits` are pure; `controller`,
//! `calibration` and `recovery` run as tokio tasks on top of the
//! `hardware` traits; `service::Engine` wires them together.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod curve;
pub mod error;
pub mod hardware;
pub mod limits;
pub mod metrics;
pub mod recovery;
pub mod service;
pub mod store;

pub use error::{Error, Result};
pub use service::Engine;
