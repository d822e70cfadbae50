//! The Connect-protocol playback-state manager: reconciles a remote
//! cluster view with an optional local playback engine and, in
//! bidirectional mode, publishes this device's state back to Spotify
//!.

mod manager;

pub use manager::{ConnectStatePublisher, LocalPlaybackEngine, PlaybackStateManager, PutStateArgs};

use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
  pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
  #[default]
  Stopped,
  Playing,
  Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackOptions {
  pub shuffling: bool,
  pub repeating_context: bool,
  pub repeating_track: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
  Cluster,
  Local,
}

/// One authoritative playback snapshot. Readers receive
/// immutable copies; only `PlaybackStateManager` owns the live value.
#[derive(Debug, Clone)]
pub struct PlaybackState {
  pub track: Option<TrackInfo>,
  pub position_ms: i64,
  pub duration_ms: i64,
  pub status: PlaybackStatus,
  pub options: PlaybackOptions,
  pub context_uri: Option<String>,
  pub active_device_id: Option<String>,
  pub source: StateSource,
  pub timestamp: Instant,
}

impl PlaybackState {
  pub fn initial() -> Self {
    Self {
      track: None,
      position_ms: 0,
      duration_ms: 0,
      status: PlaybackStatus::Stopped,
      options: PlaybackOptions::default(),
      context_uri: None,
      active_device_id: None,
      source: StateSource::Cluster,
      timestamp: Instant::now(),
    }
  }

  /// `position_ms` while paused/stopped; advanced by elapsed wall time
  /// while playing.
  pub fn current_position_ms(&self) -> i64 {
    match self.status {
      PlaybackStatus::Playing => self.position_ms + self.timestamp.elapsed().as_millis() as i64,
      PlaybackStatus::Paused | PlaybackStatus::Stopped => self.position_ms,
    }
  }
}

/// An inbound `cluster_update` payload, already protobuf-decoded
///.
#[derive(Debug, Clone)]
pub struct ClusterUpdate {
  pub active_device_id: Option<String>,
  pub track: Option<TrackInfo>,
  pub position_ms: i64,
  pub duration_ms: i64,
  pub status: PlaybackStatus,
  pub options: PlaybackOptions,
  pub context_uri: Option<String>,
}

/// Local-engine events that drive the bidirectional publish path.
#[derive(Debug, Clone)]
pub enum LocalEngineEvent {
  Play { track: TrackInfo, context_uri: Option<String> },
  Pause,
  Resume,
  Seek { position_ms: i64 },
  Stop,
  Shuffle(bool),
  RepeatContext(bool),
  RepeatTrack(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
  Track,
  PlaybackStatus,
  Options,
  ActiveDevice,
}
