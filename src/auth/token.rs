use std::time::{Duration, Instant};

/// `{token, token_type="Bearer", expires_at}`.
///
/// Never logged in full: `Debug` redacts the token body.
#[derive(Clone)]
pub struct AccessToken {
  token: String,
  expires_at: Instant,
}

const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

impl AccessToken {
  pub fn new(token: String, expires_in: Duration) -> Self {
    Self {
      token,
      expires_at: Instant::now() + expires_in,
    }
  }

  pub fn token(&self) -> &str {
    &self.token
  }

  pub fn token_type(&self) -> &'static str {
    "Bearer"
  }

  pub fn authorization_header(&self) -> String {
    format!("Bearer {}", self.token)
  }

  pub fn expires_at(&self) -> Instant {
    self.expires_at
  }

  /// True once fewer than `threshold` remains before expiry (default 5 minutes).
  pub fn should_refresh(&self) -> bool {
    self.should_refresh_with_threshold(DEFAULT_REFRESH_THRESHOLD)
  }

  pub fn should_refresh_with_threshold(&self, threshold: Duration) -> bool {
    self.expires_at.checked_duration_since(Instant::now()).map(|remaining| remaining < threshold).unwrap_or(true)
  }
}

impl std::fmt::Debug for AccessToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AccessToken")
      .field("token", &"<redacted>")
      .field("token_type", &self.token_type())
      .field("expires_at", &self.expires_at)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_token_does_not_need_refresh() {
    let token = AccessToken::new("abc".to_string(), Duration::from_secs(3600));
    assert!(!token.should_refresh());
  }

  #[test]
  fn token_within_threshold_needs_refresh() {
    let token = AccessToken::new("abc".to_string(), Duration::from_secs(60));
    assert!(token.should_refresh());
  }

  #[test]
  fn debug_never_prints_the_raw_token() {
    let token = AccessToken::new("super-secret".to_string(), Duration::from_secs(3600));
    let rendered = format!("{:?}", token);
    assert!(!rendered.contains("super-secret"));
  }
}
