//! Utility helpers for the session core

pub mod logger;
