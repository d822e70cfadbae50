//! Process-wide session state — device identity, the current access token,
//! and the dealer-issued connection id — threaded explicitly into the
//! dealer, state manager and HTTP client rather than held as globals.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::auth::{AccessToken, AuthError, Login5Client, StoredCredentials};
use crate::config::Config;

/// Shared session handle. Cheap to clone: everything behind an `Arc`.
#[derive(Clone)]
pub struct Session {
  inner: Arc<Inner>,
}

struct Inner {
  config: Config,
  login5: Login5Client,
  credentials: StoredCredentials,
  /// Held across the refresh call itself so concurrent callers coalesce
  /// onto a single in-flight login5 exchange: at most one access-token
  /// refresh per session, with concurrent callers awaiting the same
  /// refresh.
  token: Mutex<Option<AccessToken>>,
  /// Replays the current value to new subscribers the way the dealer's
  /// observable streams do.
  connection_id: RwLock<Option<String>>,
}

impl Session {
  pub fn new(config: Config, login5: Login5Client, credentials: StoredCredentials) -> Self {
    Self {
      inner: Arc::new(Inner {
        config,
        login5,
        credentials,
        token: Mutex::new(None),
        connection_id: RwLock::new(None),
      }),
    }
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  /// Returns a valid access token, refreshing through login5 if the
  /// current one is absent or near expiry. Concurrent callers block on
  /// the same refresh rather than racing separate login5 exchanges.
  pub async fn access_token(&self) -> Result<AccessToken, AuthError> {
    let mut guard = self.inner.token.lock().await;
    if let Some(token) = guard.as_ref() {
      if !token.should_refresh() {
        return Ok(token.clone());
      }
    }

    let fresh = self.inner.login5.login(self.inner.credentials.clone()).await?;
    *guard = Some(fresh.clone());
    Ok(fresh)
  }

  pub async fn connection_id(&self) -> Option<String> {
    self.inner.connection_id.read().await.clone()
  }

  pub async fn set_connection_id(&self, id: Option<String>) {
    *self.inner.connection_id.write().await = id;
  }

  pub fn device_id(&self) -> &str {
    &self.inner.config.device_id
  }
}
