//! Session core - SIP INVITE dialog coordination
//!
//! Drives SIP INVITE dialogs through their entire lifecycle: call setup with
//! SDP offer/answer negotiation, mid-dialog re-negotiations (hold, resume,
//! adding and removing media streams) and termination, while coordinating an
//! arbitrary set of independently-failing media streams.

pub mod config;
pub mod core;
pub mod events;
pub mod protocols;
pub mod streams;
pub mod testing;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
