//! Realtime client core for the Spotify Connect ecosystem.
//!
//! This crate is the "hard-engineering spine" consumed by a presentation
//! layer (desktop/TUI/whatever): it authenticates a device, keeps a
//! long-lived control channel (the "dealer") open against Spotify's
//! backend, reconciles local and remote Spotify Connect playback state,
//! and syncs the user's library. It renders nothing and owns no UI state.
//!
//! Module map:
//!
//! - [`dealer`] — the WebSocket control channel (connection, fan-out client, heartbeat, reconnect).
//! - [`playback`] — the bidirectional Connect-state reconciliation engine.
//! - [`auth`] — login5 token exchange and hashcash proof-of-work.
//! - [`http`] — the authenticated spclient HTTP surface.
//! - [`crypto`] — AES-CTR audio decryption and the Shannon session cipher.
//! - [`sync`] — page/delta library sync driven by dealer invalidation events.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dealer;
pub mod http;
pub mod playback;
pub mod session;
pub mod sync;

mod proto {
  #![allow(clippy::all)]
  include!(concat!(env!("OUT_DIR"), "/spotify_proto/mod.rs"));
}

pub use config::Config;
pub use session::Session;
