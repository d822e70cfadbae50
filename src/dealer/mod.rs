//! The Spotify dealer: a long-lived WebSocket control channel with
//! heartbeat, auto-reconnect, fan-out of inbound traffic and request/reply
//! semantics.

mod client;
mod connection;
mod heartbeat;
mod message;
mod reconnect;

pub use client::DealerClient;
pub use connection::{try_read_message, DealerConnection, InboundFrame};
pub use heartbeat::HeartbeatManager;
pub use message::{decode_payload, ConnectionState, DealerMessage, DealerRequest, RequestResult};
pub use reconnect::ReconnectionManager;

use thiserror::Error;

/// Closed set of dealer failure reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DealerError {
  #[error("invalid dealer url: {0}")]
  InvalidUrl(String),
  #[error("dealer connection already established")]
  AlreadyConnected,
  #[error("dealer is not connected")]
  NotConnected,
  #[error("dealer socket I/O error: {0}")]
  IoError(String),
  #[error("malformed dealer frame: {0}")]
  MalformedFrame(String),
  #[error("heartbeat timed out waiting for a pong")]
  HeartbeatTimeout,
}
