use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::DealerError;

/// Client-initiated liveness probe. Starts a periodic task
/// that invokes a caller-supplied `send_ping` callback and, on each
/// invocation, starts a pong-wait timer; `record_pong` cancels it.
pub struct HeartbeatManager {
  ping_interval: Duration,
  pong_timeout: Duration,
  task: Mutex<Option<JoinHandle<()>>>,
  pong_notify: Arc<tokio::sync::Notify>,
  timeout_tx: broadcast::Sender<()>,
}

impl HeartbeatManager {
  pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
    let (timeout_tx, _) = broadcast::channel(8);
    Self {
      ping_interval,
      pong_timeout,
      task: Mutex::new(None),
      pong_notify: Arc::new(tokio::sync::Notify::new()),
      timeout_tx,
    }
  }

  pub fn subscribe_timeout(&self) -> broadcast::Receiver<()> {
    self.timeout_tx.subscribe()
  }

  /// Idempotent-by-contract: a second `start` before `stop` fails.
  pub async fn start<F, Fut>(&self, send_ping: F) -> Result<(), DealerError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DealerError>> + Send,
  {
    let mut guard = self.task.lock().await;
    if guard.is_some() {
      return Err(DealerError::AlreadyConnected);
    }

    let ping_interval = self.ping_interval;
    let pong_timeout = self.pong_timeout;
    let pong_notify = self.pong_notify.clone();
    let timeout_tx = self.timeout_tx.clone();

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(ping_interval);
      loop {
        ticker.tick().await;
        if send_ping().await.is_err() {
          let _ = timeout_tx.send(());
          return;
        }
        if tokio::time::timeout(pong_timeout, pong_notify.notified()).await.is_err() {
          let _ = timeout_tx.send(());
          return;
        }
      }
    });

    *guard = Some(handle);
    Ok(())
  }

  pub fn record_pong(&self) {
    self.pong_notify.notify_one();
  }

  /// Cancels all timers. Idempotent.
  pub async fn stop(&self) {
    if let Some(handle) = self.task.lock().await.take() {
      handle.abort();
    }
  }

  pub async fn dispose(&self) {
    self.stop().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn timeout_fires_once_when_pong_never_arrives() {
    let manager = HeartbeatManager::new(Duration::from_millis(150), Duration::from_millis(250));
    let mut timeouts = manager.subscribe_timeout();

    manager.start(|| async { Ok(()) }).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), timeouts.recv()).await.expect("should receive before the 3s budget").unwrap();

    manager.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn recorded_pongs_prevent_a_timeout() {
    let manager = Arc::new(HeartbeatManager::new(Duration::from_millis(50), Duration::from_millis(100)));
    let mut timeouts = manager.subscribe_timeout();

    let m = manager.clone();
    manager
      .start(move || {
        let m = m.clone();
        async move {
          m.record_pong();
          Ok(())
        }
      })
      .await
      .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(400), timeouts.recv()).await;
    assert!(result.is_err(), "no timeout should have fired while pongs kept arriving");

    manager.stop().await;
  }

  #[tokio::test]
  async fn second_start_before_stop_fails() {
    let manager = HeartbeatManager::new(Duration::from_secs(10), Duration::from_secs(10));
    manager.start(|| async { Ok(()) }).await.unwrap();
    let err = manager.start(|| async { Ok(()) }).await.unwrap_err();
    assert_eq!(err, DealerError::AlreadyConnected);
    manager.stop().await;
  }
}
