use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

/// Exponential-backoff reconnection loop. At most one
/// reconnection loop is in flight at a time; concurrent `trigger` calls
/// while already reconnecting are ignored.
pub struct ReconnectionManager {
  initial_delay: Duration,
  max_delay: Duration,
  max_attempts: Option<u32>,
  attempts: AtomicU32,
  is_reconnecting: AtomicBool,
  cancel: Arc<Notify>,
  cancelled: AtomicBool,
  succeeded_tx: broadcast::Sender<()>,
  failed_tx: broadcast::Sender<()>,
}

impl ReconnectionManager {
  pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
    let (succeeded_tx, _) = broadcast::channel(8);
    let (failed_tx, _) = broadcast::channel(8);
    Self {
      initial_delay,
      max_delay,
      max_attempts,
      attempts: AtomicU32::new(0),
      is_reconnecting: AtomicBool::new(false),
      cancel: Arc::new(Notify::new()),
      cancelled: AtomicBool::new(false),
      succeeded_tx,
      failed_tx,
    }
  }

  pub fn subscribe_succeeded(&self) -> broadcast::Receiver<()> {
    self.succeeded_tx.subscribe()
  }

  pub fn subscribe_failed(&self) -> broadcast::Receiver<()> {
    self.failed_tx.subscribe()
  }

  pub fn attempt_count(&self) -> u32 {
    self.attempts.load(Ordering::SeqCst)
  }

  pub fn is_reconnecting(&self) -> bool {
    self.is_reconnecting.load(Ordering::SeqCst)
  }

  fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let scale = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    self.initial_delay.saturating_mul(scale).min(self.max_delay)
  }

  /// Runs callback invocations until one succeeds or `max_attempts` is
  /// exhausted. Redundant concurrent triggers are ignored while a loop is
  /// already in flight.
  pub async fn trigger<F, Fut>(&self, callback: F)
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), ()>>,
  {
    if self.is_reconnecting.swap(true, Ordering::SeqCst) {
      return;
    }
    self.cancelled.store(false, Ordering::SeqCst);

    loop {
      if self.cancelled.load(Ordering::SeqCst) {
        self.is_reconnecting.store(false, Ordering::SeqCst);
        return;
      }

      let outcome = tokio::select! {
        result = callback() => Some(result),
        _ = self.cancel.notified() => None,
      };

      match outcome {
        Some(Ok(())) => {
          self.attempts.store(0, Ordering::SeqCst);
          self.is_reconnecting.store(false, Ordering::SeqCst);
          let _ = self.succeeded_tx.send(());
          return;
        }
        Some(Err(())) => {
          let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
          if self.max_attempts.is_some_and(|max| attempt >= max) {
            self.is_reconnecting.store(false, Ordering::SeqCst);
            let _ = self.failed_tx.send(());
            return;
          }

          let delay = self.delay_for_attempt(attempt);
          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.notified() => {
              self.is_reconnecting.store(false, Ordering::SeqCst);
              return;
            }
          }
        }
        None => {
          self.is_reconnecting.store(false, Ordering::SeqCst);
          return;
        }
      }
    }
  }

  /// Aborts both the sleep and an in-flight callback; no further attempts
  /// are scheduled.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    self.cancel.notify_waiters();
  }

  pub fn reset(&self) {
    self.attempts.store(0, Ordering::SeqCst);
    self.is_reconnecting.store(false, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use tokio::time::Instant;

  #[tokio::test(start_paused = true)]
  async fn backoff_and_recovery_matches_the_documented_gaps() {
    let manager = ReconnectionManager::new(Duration::from_millis(100), Duration::from_secs(10), Some(4));
    let mut succeeded = manager.subscribe_succeeded();

    let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let remaining_failures = Arc::new(AtomicU32::new(3));

    let invocations_clone = invocations.clone();
    let remaining_clone = remaining_failures.clone();
    manager
      .trigger(move || {
        let invocations = invocations_clone.clone();
        let remaining = remaining_clone.clone();
        async move {
          invocations.lock().unwrap().push(Instant::now());
          if remaining.load(Ordering::SeqCst) > 0 {
            remaining.fetch_sub(1, Ordering::SeqCst);
            Err(())
          } else {
            Ok(())
          }
        }
      })
      .await;

    succeeded.try_recv().expect("exactly one reconnection_succeeded event");
    assert_eq!(manager.attempt_count(), 0);

    let timestamps = invocations.lock().unwrap().clone();
    assert_eq!(timestamps.len(), 4);

    let gaps: Vec<Duration> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)];
    for (gap, expected) in gaps.iter().zip(expected.iter()) {
      let tolerance = Duration::from_millis(100);
      assert!(gap.abs_diff(*expected) <= tolerance, "gap {gap:?} not within tolerance of {expected:?}");
    }
  }

  #[tokio::test]
  async fn concurrent_triggers_while_reconnecting_are_ignored() {
    let manager = Arc::new(ReconnectionManager::new(Duration::from_millis(10), Duration::from_secs(1), Some(5)));
    let call_count = Arc::new(AtomicU32::new(0));

    let m1 = manager.clone();
    let c1 = call_count.clone();
    let first = tokio::spawn(async move {
      m1.trigger(move || {
        let c1 = c1.clone();
        async move {
          c1.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(())
        }
      })
      .await;
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.trigger(|| async { Ok(()) }).await;

    first.await.unwrap();
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancel_stops_further_attempts() {
    let manager = Arc::new(ReconnectionManager::new(Duration::from_millis(20), Duration::from_secs(1), None));
    let call_count = Arc::new(AtomicU32::new(0));

    let m = manager.clone();
    let c = call_count.clone();
    let handle = tokio::spawn(async move {
      m.trigger(move || {
        let c = c.clone();
        async move {
          c.fetch_add(1, Ordering::SeqCst);
          Err(())
        }
      })
      .await;
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.cancel();
    handle.await.unwrap();

    let count_after_cancel = call_count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(call_count.load(Ordering::SeqCst), count_after_cancel);
    assert!(!manager.is_reconnecting());
  }
}
