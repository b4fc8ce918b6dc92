//! # signalk-hub-protocol
//!
//! Signal K hub wire messages and codec.
//!
//! This crate defines the messages exchanged over WebSocket, TCP and the
//! HTTP API, and classifies inbound text into deltas, documents and requests.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
