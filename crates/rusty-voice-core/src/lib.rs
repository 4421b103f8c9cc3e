//! Core types, config, errors, epochs and session model for Rusty Voice.

pub mod config;
pub mod epoch;
pub mod error;
pub mod protocol;
pub mod session;
pub mod types;
