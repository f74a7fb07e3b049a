//! Core types, config, errors, and wire protocol for Dial 112.

pub mod config;
pub mod error;
pub mod protocol;
pub mod record;
pub mod recording_store;
