//! Telephony media-stream gateway.
//!
//! Hosts the HTTP/WebSocket server the telephony provider connects to, runs
//! one call session per media socket, detects caller utterances, drives the
//! recognize → respond → synthesize turn, and streams replies back at the
//! wire frame cadence.

pub mod connection;
pub mod hygiene;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod playback;
pub mod recorder;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod twiml;

pub use server::{router, start_gateway};
pub use state::GatewayState;
