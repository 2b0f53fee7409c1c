//! Per-connection proxy logic.

pub mod client;
pub mod handshake;
pub mod relay;

pub use client::{handle_client, SessionContext};
pub use relay::RelaySession;
