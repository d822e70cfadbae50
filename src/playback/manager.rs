use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use protobuf::Message;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use super::{ClusterUpdate, FieldChange, LocalEngineEvent, PlaybackOptions, PlaybackState, PlaybackStatus, StateSource, TrackInfo};
use crate::dealer::DealerMessage;

/// URI prefix the dealer uses for `Cluster`/`ClusterUpdate` push messages.
const CLUSTER_UPDATE_URI_PREFIX: &str = "hm://connect-state/v1/cluster";

/// The local-engine seam: the only mock point for driving a real player. An
/// implementation forwards play/pause/resume/seek/stop/shuffle/repeat
/// events from the real audio pipeline, which is out of scope here.
pub trait LocalPlaybackEngine: Send + Sync {
  fn subscribe(&self) -> broadcast::Receiver<LocalEngineEvent>;
}

/// Everything needed to build a spclient `PutStateRequest` for this
/// device, kept as a plain struct rather than the protobuf type itself so
/// this module stays decoupled from `http`.
#[derive(Debug, Clone)]
pub struct PutStateArgs {
  pub device_id: String,
  pub device_name: String,
  pub device_type: String,
  pub track_uri: Option<String>,
  pub position_ms: i64,
  pub is_playing: bool,
  pub is_paused: bool,
  pub options: PlaybackOptions,
}

/// Implemented by `http::SpotifyHttpApi`.
#[async_trait]
pub trait ConnectStatePublisher: Send + Sync {
  async fn put_connect_state(&self, connection_id: &str, request: PutStateArgs) -> Result<(), String>;
}

struct DeviceIdentity {
  device_id: String,
  device_name: String,
  device_type: String,
}

/// Maintains one authoritative `PlaybackState`, reconciling inbound
/// cluster updates with an optional local engine.
pub struct PlaybackStateManager {
  current_state: Mutex<PlaybackState>,
  device: DeviceIdentity,
  local_engine: Option<Arc<dyn LocalPlaybackEngine>>,
  publisher: Option<Arc<dyn ConnectStatePublisher>>,
  connection_id: watch::Receiver<Option<String>>,
  state_changes_tx: broadcast::Sender<PlaybackState>,
  track_changed_tx: broadcast::Sender<PlaybackState>,
  playback_status_changed_tx: broadcast::Sender<PlaybackState>,
  options_changed_tx: broadcast::Sender<PlaybackState>,
  active_device_changed_tx: broadcast::Sender<PlaybackState>,
  publish_in_flight: Mutex<bool>,
  pending_publish: Mutex<Option<PutStateArgs>>,
  disposed: AtomicBool,
}

impl PlaybackStateManager {
  pub fn new(
    device_id: impl Into<String>,
    device_name: impl Into<String>,
    device_type: impl Into<String>,
    local_engine: Option<Arc<dyn LocalPlaybackEngine>>,
    publisher: Option<Arc<dyn ConnectStatePublisher>>,
    connection_id: watch::Receiver<Option<String>>,
  ) -> Arc<Self> {
    let (state_changes_tx, _) = broadcast::channel(64);
    let (track_changed_tx, _) = broadcast::channel(64);
    let (playback_status_changed_tx, _) = broadcast::channel(64);
    let (options_changed_tx, _) = broadcast::channel(64);
    let (active_device_changed_tx, _) = broadcast::channel(64);

    let manager = Arc::new(Self {
      current_state: Mutex::new(PlaybackState::initial()),
      device: DeviceIdentity { device_id: device_id.into(), device_name: device_name.into(), device_type: device_type.into() },
      local_engine,
      publisher,
      connection_id,
      state_changes_tx,
      track_changed_tx,
      playback_status_changed_tx,
      options_changed_tx,
      active_device_changed_tx,
      publish_in_flight: Mutex::new(false),
      pending_publish: Mutex::new(None),
      disposed: AtomicBool::new(false),
    });

    if manager.local_engine.is_some() {
      manager.clone().spawn_local_engine_loop();
    }
    manager
  }

  pub fn is_bidirectional(&self) -> bool {
    self.local_engine.is_some()
  }

  pub async fn current_state(&self) -> PlaybackState {
    self.current_state.lock().await.clone()
  }

  pub async fn get_current_position(&self) -> i64 {
    self.current_state.lock().await.current_position_ms()
  }

  pub fn state_changes(&self) -> broadcast::Receiver<PlaybackState> {
    self.state_changes_tx.subscribe()
  }

  pub fn track_changed(&self) -> broadcast::Receiver<PlaybackState> {
    self.track_changed_tx.subscribe()
  }

  pub fn playback_status_changed(&self) -> broadcast::Receiver<PlaybackState> {
    self.playback_status_changed_tx.subscribe()
  }

  pub fn options_changed(&self) -> broadcast::Receiver<PlaybackState> {
    self.options_changed_tx.subscribe()
  }

  pub fn active_device_changed(&self) -> broadcast::Receiver<PlaybackState> {
    self.active_device_changed_tx.subscribe()
  }

  /// Subscribes to the dealer's fan-out, decodes `Cluster`/`ClusterUpdate`
  /// payloads addressed to the cluster-update URI, and reconciles them.
  /// Mirrors `sync::SpotifyLibrarySync::spawn_realtime_invalidation`.
  pub fn spawn_cluster_update_listener(self: &Arc<Self>, mut messages: broadcast::Receiver<DealerMessage>) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match messages.recv().await {
          Ok(message) => manager.handle_dealer_message(&message).await,
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }

  async fn handle_dealer_message(&self, message: &DealerMessage) {
    if !message.uri.starts_with(CLUSTER_UPDATE_URI_PREFIX) {
      return;
    }

    let proto = match crate::proto::connect::ClusterUpdate::parse_from_bytes(&message.payload) {
      Ok(proto) => proto,
      Err(e) => {
        debug!("discarding malformed cluster update: {e}");
        return;
      }
    };

    match cluster_update_from_proto(proto) {
      Some(update) => self.apply_cluster_update(update).await,
      None => debug!("discarding cluster update carrying no cluster"),
    }
  }

  /// Reconciles an inbound cluster update against local state.
  pub async fn apply_cluster_update(&self, update: ClusterUpdate) {
    let mut guard = self.current_state.lock().await;

    let local_is_active = self.is_bidirectional() && guard.source == StateSource::Local;
    let names_this_device = update.active_device_id.as_deref() == Some(self.device.device_id.as_str());
    if local_is_active && names_this_device {
      debug!("dropping cluster update that echoes this device's own published state");
      return;
    }

    let new_state = PlaybackState {
      track: update.track,
      position_ms: update.position_ms,
      duration_ms: update.duration_ms,
      status: update.status,
      options: update.options,
      context_uri: update.context_uri,
      active_device_id: update.active_device_id,
      source: StateSource::Cluster,
      timestamp: std::time::Instant::now(),
    };

    self.replace_state(&mut guard, new_state);
  }

  fn replace_state(&self, guard: &mut PlaybackState, new_state: PlaybackState) {
    let changes = diff(guard, &new_state);
    *guard = new_state;
    let snapshot = guard.clone();

    let _ = self.state_changes_tx.send(snapshot.clone());
    for change in changes {
      let _ = match change {
        FieldChange::Track => self.track_changed_tx.send(snapshot.clone()),
        FieldChange::PlaybackStatus => self.playback_status_changed_tx.send(snapshot.clone()),
        FieldChange::Options => self.options_changed_tx.send(snapshot.clone()),
        FieldChange::ActiveDevice => self.active_device_changed_tx.send(snapshot.clone()),
      };
    }
  }

  fn spawn_local_engine_loop(self: Arc<Self>) {
    let Some(engine) = self.local_engine.clone() else { return };
    let mut events = engine.subscribe();

    tokio::spawn(async move {
      loop {
        let event = match events.recv().await {
          Ok(event) => event,
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => return,
        };

        let new_state = {
          let mut guard = self.current_state.lock().await;
          let updated = self.apply_local_event(&guard, event);
          self.replace_state(&mut guard, updated.clone());
          updated
        };

        self.request_publish(new_state).await;
      }
    });
  }

  fn apply_local_event(&self, current: &PlaybackState, event: LocalEngineEvent) -> PlaybackState {
    let mut next = current.clone();
    next.source = StateSource::Local;
    next.timestamp = std::time::Instant::now();
    next.active_device_id = Some(self.device.device_id.clone());

    match event {
      LocalEngineEvent::Play { track, context_uri } => {
        next.track = Some(track);
        next.context_uri = context_uri;
        next.position_ms = 0;
        next.status = PlaybackStatus::Playing;
      }
      LocalEngineEvent::Pause => next.status = PlaybackStatus::Paused,
      LocalEngineEvent::Resume => next.status = PlaybackStatus::Playing,
      LocalEngineEvent::Seek { position_ms } => next.position_ms = position_ms,
      LocalEngineEvent::Stop => {
        next.status = PlaybackStatus::Stopped;
        next.position_ms = 0;
      }
      LocalEngineEvent::Shuffle(on) => next.options.shuffling = on,
      LocalEngineEvent::RepeatContext(on) => next.options.repeating_context = on,
      LocalEngineEvent::RepeatTrack(on) => next.options.repeating_track = on,
    }
    next
  }

  /// Coalesces bursts: at most one publish in flight per device; later
  /// changes while one is in flight become the next follow-up publish.
  async fn request_publish(&self, state: PlaybackState) {
    let Some(publisher) = self.publisher.clone() else { return };

    let args = PutStateArgs {
      device_id: self.device.device_id.clone(),
      device_name: self.device.device_name.clone(),
      device_type: self.device.device_type.clone(),
      track_uri: state.track.as_ref().map(|t| t.uri.clone()),
      position_ms: state.position_ms,
      is_playing: state.status == PlaybackStatus::Playing,
      is_paused: state.status == PlaybackStatus::Paused,
      options: state.options,
    };

    {
      let mut in_flight = self.publish_in_flight.lock().await;
      if *in_flight {
        *self.pending_publish.lock().await = Some(args);
        return;
      }
      *in_flight = true;
    }

    self.run_publish_loop(publisher, args).await;
  }

  async fn run_publish_loop(&self, publisher: Arc<dyn ConnectStatePublisher>, mut args: PutStateArgs) {
    loop {
      let Some(connection_id) = self.connection_id.borrow().clone() else {
        // Wait until a dealer connection_id is known before publishing.
        let mut receiver = self.connection_id.clone();
        if receiver.changed().await.is_err() {
          break;
        }
        continue;
      };

      if let Err(e) = publisher.put_connect_state(&connection_id, args.clone()).await {
        warn!("connect-state publish failed, dropping: {e}");
      }

      let next = self.pending_publish.lock().await.take();
      match next {
        Some(pending) => args = pending,
        None => break,
      }
    }

    *self.publish_in_flight.lock().await = false;
  }

  pub async fn dispose(&self) {
    self.disposed.store(true, Ordering::SeqCst);
  }
}

/// `PlayerState` carries no direct playback-status enum; it is derived from
/// `is_playing`/`is_paused`, the same pair `ConnectStatePublisher` writes
/// going the other way.
fn cluster_update_from_proto(proto: crate::proto::connect::ClusterUpdate) -> Option<ClusterUpdate> {
  let cluster = proto.cluster.into_option()?;
  let player_state = cluster.player_state.into_option().unwrap_or_default();

  let status = if player_state.is_paused {
    PlaybackStatus::Paused
  } else if player_state.is_playing {
    PlaybackStatus::Playing
  } else {
    PlaybackStatus::Stopped
  };

  let options = player_state.options.into_option().map_or_else(PlaybackOptions::default, |o| PlaybackOptions {
    shuffling: o.shuffling_context,
    repeating_context: o.repeating_context,
    repeating_track: o.repeating_track,
  });

  Some(ClusterUpdate {
    active_device_id: (!cluster.active_device_id.is_empty()).then_some(cluster.active_device_id),
    track: (!player_state.track_uri.is_empty()).then_some(TrackInfo { uri: player_state.track_uri }),
    position_ms: player_state.position_as_of_timestamp,
    duration_ms: player_state.duration,
    status,
    options,
    context_uri: (!player_state.context_uri.is_empty()).then_some(player_state.context_uri),
  })
}

fn diff(old: &PlaybackState, new: &PlaybackState) -> Vec<FieldChange> {
  let mut changes = Vec::new();
  if old.track != new.track {
    changes.push(FieldChange::Track);
  }
  if old.status != new.status {
    changes.push(FieldChange::PlaybackStatus);
  }
  if old.options != new.options {
    changes.push(FieldChange::Options);
  }
  if old.active_device_id != new.active_device_id {
    changes.push(FieldChange::ActiveDevice);
  }
  changes
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn cluster_update(device_id: &str, status: PlaybackStatus, uri: &str) -> ClusterUpdate {
    ClusterUpdate {
      active_device_id: Some(device_id.to_string()),
      track: Some(TrackInfo { uri: uri.to_string() }),
      position_ms: 1_000,
      duration_ms: 200_000,
      status,
      options: PlaybackOptions::default(),
      context_uri: None,
    }
  }

  fn remote_only_manager() -> Arc<PlaybackStateManager> {
    let (_tx, rx) = watch::channel(None);
    PlaybackStateManager::new("device-a", "Test Device", "computer", None, None, rx)
  }

  #[tokio::test]
  async fn initial_state_is_stopped_with_no_track() {
    let manager = remote_only_manager();
    let state = manager.current_state().await;
    assert_eq!(state.status, PlaybackStatus::Stopped);
    assert!(state.track.is_none());
  }

  #[tokio::test]
  async fn cluster_update_replaces_state_and_emits_field_changes() {
    let manager = remote_only_manager();
    let mut track_changed = manager.track_changed();
    let mut status_changed = manager.playback_status_changed();

    manager.apply_cluster_update(cluster_update("device-b", PlaybackStatus::Playing, "spotify:track:1")).await;

    let state = manager.current_state().await;
    assert_eq!(state.status, PlaybackStatus::Playing);
    assert_eq!(state.source, StateSource::Cluster);
    track_changed.try_recv().expect("track_changed should fire");
    status_changed.try_recv().expect("status_changed should fire");
  }

  #[tokio::test]
  async fn unchanged_fields_do_not_refire_their_change_stream() {
    let manager = remote_only_manager();
    manager.apply_cluster_update(cluster_update("device-b", PlaybackStatus::Playing, "spotify:track:1")).await;

    let mut track_changed = manager.track_changed();
    manager.apply_cluster_update(cluster_update("device-b", PlaybackStatus::Playing, "spotify:track:1")).await;

    assert!(track_changed.try_recv().is_err(), "track did not change, track_changed should stay silent");
  }

  #[tokio::test]
  async fn playing_position_advances_by_elapsed_wall_time() {
    let manager = remote_only_manager();
    manager.apply_cluster_update(cluster_update("device-b", PlaybackStatus::Playing, "spotify:track:1")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let position = manager.get_current_position().await;
    assert!(position >= 1_000 + 40, "position should have advanced, got {position}");
  }

  #[tokio::test]
  async fn paused_position_never_advances() {
    let manager = remote_only_manager();
    manager.apply_cluster_update(cluster_update("device-b", PlaybackStatus::Paused, "spotify:track:1")).await;

    let before = manager.get_current_position().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = manager.get_current_position().await;
    assert_eq!(before, after);
  }

  fn proto_cluster_update(device_id: &str, is_playing: bool, is_paused: bool, track_uri: &str) -> crate::proto::connect::ClusterUpdate {
    let player_state = crate::proto::connect::PlayerState {
      track_uri: track_uri.to_string(),
      position_as_of_timestamp: 5_000,
      is_playing,
      is_paused,
      duration: 180_000,
      options: protobuf::MessageField::some(crate::proto::connect::PlayerOptions { shuffling_context: true, ..Default::default() }),
      ..Default::default()
    };
    let cluster = crate::proto::connect::Cluster {
      active_device_id: device_id.to_string(),
      player_state: protobuf::MessageField::some(player_state),
      ..Default::default()
    };
    crate::proto::connect::ClusterUpdate { cluster: protobuf::MessageField::some(cluster), ..Default::default() }
  }

  #[test]
  fn proto_cluster_update_maps_is_playing_is_paused_to_status() {
    let update = cluster_update_from_proto(proto_cluster_update("device-a", true, false, "spotify:track:1")).unwrap();
    assert_eq!(update.status, PlaybackStatus::Playing);
    assert_eq!(update.track.unwrap().uri, "spotify:track:1");
    assert_eq!(update.active_device_id, Some("device-a".to_string()));
    assert!(update.options.shuffling);

    let paused = cluster_update_from_proto(proto_cluster_update("device-a", true, true, "spotify:track:1")).unwrap();
    assert_eq!(paused.status, PlaybackStatus::Paused);
  }

  #[test]
  fn proto_cluster_update_without_a_cluster_is_discarded() {
    let update = crate::proto::connect::ClusterUpdate::default();
    assert!(cluster_update_from_proto(update).is_none());
  }

  #[tokio::test]
  async fn dealer_cluster_update_message_reaches_apply_cluster_update() {
    let manager = remote_only_manager();
    let mut track_changed = manager.track_changed();

    let proto = proto_cluster_update("device-b", true, false, "spotify:track:9");
    let payload = proto.write_to_bytes().unwrap();
    let message = DealerMessage { uri: format!("{CLUSTER_UPDATE_URI_PREFIX}/abc"), headers: Default::default(), payload };

    manager.handle_dealer_message(&message).await;

    let state = manager.current_state().await;
    assert_eq!(state.track.unwrap().uri, "spotify:track:9");
    track_changed.try_recv().expect("track_changed should fire");
  }

  #[tokio::test]
  async fn dealer_messages_on_other_uris_are_ignored() {
    let manager = remote_only_manager();
    let message = DealerMessage { uri: "hm://playlist/abc".to_string(), headers: Default::default(), payload: vec![1, 2, 3] };
    manager.handle_dealer_message(&message).await;
    assert_eq!(manager.current_state().await.status, PlaybackStatus::Stopped);
  }
}
