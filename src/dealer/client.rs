use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::{broadcast, watch, Mutex};

use super::connection::InboundFrame;
use super::{ConnectionState, DealerConnection, DealerError, DealerMessage, DealerRequest, HeartbeatManager, ReconnectionManager, RequestResult};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Raw shape of an inbound dealer JSON frame, keyed by its `type`
/// discriminator.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundJson {
  Message {
    uri: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    payload: Option<String>,
  },
  Request {
    key: String,
    #[serde(default)]
    message_id: u64,
    #[serde(default)]
    sender_device_id: String,
    message_ident: String,
    #[serde(default)]
    payload: serde_json::Value,
  },
  Ping,
  Pong,
}

/// High-level dealer API: multi-endpoint connect, inbound fan-out,
/// heartbeat and reconnection, reply formatting.
pub struct DealerClient {
  connection: Arc<Mutex<DealerConnection>>,
  heartbeat: Arc<HeartbeatManager>,
  reconnect: Arc<ReconnectionManager>,
  endpoints: Arc<Mutex<Vec<String>>>,
  state_tx: watch::Sender<ConnectionState>,
  connection_id_tx: watch::Sender<Option<String>>,
  messages_tx: broadcast::Sender<DealerMessage>,
  requests_tx: broadcast::Sender<DealerRequest>,
  disposed: AtomicBool,
}

impl Default for DealerClient {
  fn default() -> Self {
    Self::new()
  }
}

impl DealerClient {
  pub fn new() -> Self {
    let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
    let (connection_id_tx, _) = watch::channel(None);
    let (messages_tx, _) = broadcast::channel(256);
    let (requests_tx, _) = broadcast::channel(256);

    let connection = Arc::new(Mutex::new(DealerConnection::new()));
    let heartbeat = Arc::new(HeartbeatManager::new(PING_INTERVAL, PONG_TIMEOUT));
    let reconnect = Arc::new(ReconnectionManager::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, Some(RECONNECT_MAX_ATTEMPTS)));
    let endpoints = Arc::new(Mutex::new(Vec::new()));

    Self::spawn_heartbeat_timeout_watcher(
      heartbeat.clone(),
      reconnect.clone(),
      connection.clone(),
      endpoints.clone(),
      messages_tx.clone(),
      requests_tx.clone(),
      connection_id_tx.clone(),
      state_tx.clone(),
    );

    Self {
      connection,
      heartbeat,
      reconnect,
      endpoints,
      state_tx,
      connection_id_tx,
      messages_tx,
      requests_tx,
      disposed: AtomicBool::new(false),
    }
  }

  pub fn messages(&self) -> broadcast::Receiver<DealerMessage> {
    self.messages_tx.subscribe()
  }

  pub fn requests(&self) -> broadcast::Receiver<DealerRequest> {
    self.requests_tx.subscribe()
  }

  /// Replays the current value on subscribe.
  pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
    self.state_tx.subscribe()
  }

  /// Replays the current value on subscribe; `null` until a connection id
  /// message arrives.
  pub fn connection_id(&self) -> watch::Receiver<Option<String>> {
    self.connection_id_tx.subscribe()
  }

  pub fn current_connection_id(&self) -> Option<String> {
    self.connection_id_tx.borrow().clone()
  }

  /// Tries each candidate endpoint in order. Endpoint resolution itself is
  /// an external collaborator's responsibility. The endpoint list is kept
  /// for reuse by the reconnection loop.
  pub async fn connect(&self, endpoints: &[String]) -> Result<(), DealerError> {
    if *self.state_tx.borrow() == ConnectionState::Connected {
      return Err(DealerError::AlreadyConnected);
    }

    *self.endpoints.lock().await = endpoints.to_vec();
    self.reconnect.reset();

    // Reconnection lifecycle: reset the cached connection id so the new
    // one arrives as a fresh dealer message.
    let _ = self.connection_id_tx.send(None);
    let _ = self.state_tx.send(ConnectionState::Connecting);

    match Self::try_endpoints(&self.connection, endpoints).await {
      Ok(endpoint) => {
        let _ = self.state_tx.send(ConnectionState::Connected);
        info!("dealer connected to {endpoint}");
        Self::spawn_dispatch_loop(
          self.connection.clone(),
          self.heartbeat.clone(),
          self.reconnect.clone(),
          self.endpoints.clone(),
          self.messages_tx.clone(),
          self.requests_tx.clone(),
          self.connection_id_tx.clone(),
          self.state_tx.clone(),
        );
        Self::spawn_heartbeat(self.connection.clone(), self.heartbeat.clone()).await;
        Ok(())
      }
      Err(e) => {
        let _ = self.state_tx.send(ConnectionState::Failed);
        Err(e)
      }
    }
  }

  async fn try_endpoints(connection: &Arc<Mutex<DealerConnection>>, endpoints: &[String]) -> Result<String, DealerError> {
    let mut last_err = None;
    for endpoint in endpoints {
      let mut conn = connection.lock().await;
      match conn.connect(endpoint).await {
        Ok(()) => return Ok(endpoint.clone()),
        Err(e) => {
          warn!("dealer endpoint {endpoint} failed: {e}");
          last_err = Some(e);
        }
      }
    }
    Err(last_err.unwrap_or(DealerError::IoError("no dealer endpoints supplied".to_string())))
  }

  async fn spawn_heartbeat(connection: Arc<Mutex<DealerConnection>>, heartbeat: Arc<HeartbeatManager>) {
    let _ = heartbeat
      .start(move || {
        let connection = connection.clone();
        async move {
          let mut connection = connection.lock().await;
          connection.send_text(r#"{"type":"ping"}"#.to_string()).await
        }
      })
      .await;
  }

  fn spawn_dispatch_loop(
    connection: Arc<Mutex<DealerConnection>>,
    heartbeat: Arc<HeartbeatManager>,
    reconnect: Arc<ReconnectionManager>,
    endpoints: Arc<Mutex<Vec<String>>>,
    messages_tx: broadcast::Sender<DealerMessage>,
    requests_tx: broadcast::Sender<DealerRequest>,
    connection_id_tx: watch::Sender<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
  ) {
    tokio::spawn(async move {
      loop {
        let frame = {
          let mut conn = connection.lock().await;
          conn.recv().await
        };

        match frame {
          Some(Ok(InboundFrame::Text(text))) => {
            Self::dispatch_text(&text, &connection, &heartbeat, &messages_tx, &requests_tx, &connection_id_tx).await;
          }
          Some(Ok(InboundFrame::Binary(_))) => {
            debug!("dropping unexpected binary dealer frame");
          }
          Some(Err(e)) => {
            warn!("dealer socket error: {e}");
            Self::spawn_reconnect(connection, heartbeat, reconnect, endpoints, messages_tx, requests_tx, connection_id_tx, state_tx);
            return;
          }
          None => {
            Self::spawn_reconnect(connection, heartbeat, reconnect, endpoints, messages_tx, requests_tx, connection_id_tx, state_tx);
            return;
          }
        }
      }
    });
  }

  /// Drives Connected→Reconnecting→backoff→Connected/Failed. Called from
  /// both a lost socket (`spawn_dispatch_loop`) and a heartbeat timeout
  /// (`spawn_heartbeat_timeout_watcher`).
  fn spawn_reconnect(
    connection: Arc<Mutex<DealerConnection>>,
    heartbeat: Arc<HeartbeatManager>,
    reconnect: Arc<ReconnectionManager>,
    endpoints: Arc<Mutex<Vec<String>>>,
    messages_tx: broadcast::Sender<DealerMessage>,
    requests_tx: broadcast::Sender<DealerRequest>,
    connection_id_tx: watch::Sender<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
  ) {
    let _ = state_tx.send(ConnectionState::Reconnecting);
    let _ = connection_id_tx.send(None);

    tokio::spawn(async move {
      // Clears the previous ping task's slot; a heartbeat timeout leaves
      // its own completed task behind without clearing it.
      heartbeat.stop().await;

      let mut succeeded = reconnect.subscribe_succeeded();
      let mut failed = reconnect.subscribe_failed();

      let trigger_connection = connection.clone();
      let trigger_endpoints = endpoints.clone();
      reconnect
        .trigger(move || {
          let connection = trigger_connection.clone();
          let endpoints = trigger_endpoints.clone();
          async move {
            let snapshot = endpoints.lock().await.clone();
            Self::try_endpoints(&connection, &snapshot).await.map(|_| ()).map_err(|_| ())
          }
        })
        .await;

      if succeeded.try_recv().is_ok() {
        let _ = state_tx.send(ConnectionState::Connected);
        info!("dealer reconnected");
        Self::spawn_dispatch_loop(connection.clone(), heartbeat.clone(), reconnect, endpoints, messages_tx, requests_tx, connection_id_tx, state_tx);
        Self::spawn_heartbeat(connection, heartbeat).await;
      } else if failed.try_recv().is_ok() {
        warn!("dealer reconnection attempts exhausted");
        let _ = state_tx.send(ConnectionState::Failed);
      }
    });
  }

  async fn dispatch_text(
    text: &str,
    connection: &Arc<Mutex<DealerConnection>>,
    heartbeat: &Arc<HeartbeatManager>,
    messages_tx: &broadcast::Sender<DealerMessage>,
    requests_tx: &broadcast::Sender<DealerRequest>,
    connection_id_tx: &watch::Sender<Option<String>>,
  ) {
    let parsed: InboundJson = match serde_json::from_str(text) {
      Ok(parsed) => parsed,
      Err(e) => {
        debug!("discarding malformed dealer frame: {e}");
        return;
      }
    };

    match parsed {
      InboundJson::Message { uri, headers, payload } => {
        let decoded = match super::message::decode_payload(&headers, payload.as_deref()) {
          Ok(bytes) => bytes,
          Err(e) => {
            debug!("discarding dealer message with unreadable payload: {e}");
            return;
          }
        };

        if uri.starts_with("hm://pusher/v1/connections/") {
          let id = String::from_utf8_lossy(&decoded).to_string();
          let _ = connection_id_tx.send(Some(id));
          return;
        }

        let _ = messages_tx.send(DealerMessage { uri, headers, payload: decoded });
      }
      InboundJson::Request { key, message_id, sender_device_id, message_ident, payload } => {
        let _ = requests_tx.send(DealerRequest { key, message_id, sender_device_id, message_ident, payload });
      }
      InboundJson::Ping => {
        let mut conn = connection.lock().await;
        let _ = conn.send_text(r#"{"type":"pong"}"#.to_string()).await;
      }
      InboundJson::Pong => {
        heartbeat.record_pong();
      }
    }
  }

  /// Subscribed once for the lifetime of the client; every heartbeat
  /// timeout — on the initial connection or any reconnection — routes
  /// through the same reconnection trigger as a lost socket.
  fn spawn_heartbeat_timeout_watcher(
    heartbeat: Arc<HeartbeatManager>,
    reconnect: Arc<ReconnectionManager>,
    connection: Arc<Mutex<DealerConnection>>,
    endpoints: Arc<Mutex<Vec<String>>>,
    messages_tx: broadcast::Sender<DealerMessage>,
    requests_tx: broadcast::Sender<DealerRequest>,
    connection_id_tx: watch::Sender<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
  ) {
    let mut timeouts = heartbeat.subscribe_timeout();
    tokio::spawn(async move {
      loop {
        match timeouts.recv().await {
          Ok(()) => {
            warn!("dealer heartbeat timed out, triggering reconnection");
            Self::spawn_reconnect(
              connection.clone(),
              heartbeat.clone(),
              reconnect.clone(),
              endpoints.clone(),
              messages_tx.clone(),
              requests_tx.clone(),
              connection_id_tx.clone(),
              state_tx.clone(),
            );
          }
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// `{"type":"reply","key":K,"payload":{"success":B}}`.
  pub async fn send_reply(&self, key: &str, result: RequestResult) -> Result<(), DealerError> {
    let frame = serde_json::json!({
      "type": "reply",
      "key": key,
      "payload": { "success": result.is_success() },
    });
    let mut connection = self.connection.lock().await;
    connection.send_text(frame.to_string()).await
  }

  /// Safe to call when already disconnected. Cancels any in-flight
  /// reconnection loop first.
  pub async fn disconnect(&self) {
    self.reconnect.cancel();
    if *self.state_tx.borrow() == ConnectionState::Disconnected {
      return;
    }
    self.heartbeat.stop().await;
    self.connection.lock().await.dispose().await;
    let _ = self.state_tx.send(ConnectionState::Disconnected);
  }

  /// Idempotent.
  pub async fn dispose(&self) {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.disconnect().await;
  }
}
