//! tether-core: Core abstractions and configuration for Tether
//!
//! This crate provides shared types, traits, error taxonomy and
//! configuration structures used by the daemon and its tests.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::TetherError;
pub use types::{DeviceId, SessionRetention, TransportPhase};
