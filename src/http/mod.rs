//! The authenticated spclient HTTP surface: typed retry, access-token
//! refresh, and Spotify-specific failure mapping.

mod spclient;

pub use spclient::SpotifyHttpApi;

use std::time::Duration;

use log::warn;
use reqwest::StatusCode;
use thiserror::Error;

use crate::session::Session;

const MAX_RETRIES: u8 = 3;

/// Closed set of spclient failure reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
  #[error("not found")]
  NotFound,
  #[error("unauthorized")]
  Unauthorized,
  #[error("rate limited")]
  RateLimited,
  #[error("server error")]
  ServerError,
  #[error("request failed: {0}")]
  RequestFailed(String),
}

fn map_status(status: StatusCode) -> HttpError {
  match status.as_u16() {
    404 => HttpError::NotFound,
    401 | 403 => HttpError::Unauthorized,
    429 => HttpError::RateLimited,
    500..=599 => HttpError::ServerError,
    other => HttpError::RequestFailed(format!("unexpected status {other}")),
  }
}

/// Wraps every spclient call with the cross-cutting behavior every endpoint
/// needs: token refresh, headers, retry with exponential backoff on
/// 429/503/transport errors, and status-code mapping.
pub struct AuthenticatedHttpClient {
  http: reqwest::Client,
  session: Session,
  user_agent: String,
}

impl AuthenticatedHttpClient {
  pub fn new(http: reqwest::Client, session: Session, user_agent: impl Into<String>) -> Self {
    Self { http, session, user_agent: user_agent.into() }
  }

  pub fn http(&self) -> &reqwest::Client {
    &self.http
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  /// `request_factory` is called fresh on every attempt (a `RequestBuilder`
  /// can't be replayed once sent); it gets a clean client handle to build
  /// from.
  pub async fn send(&self, locale_override: Option<&str>, request_factory: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder) -> Result<reqwest::Response, HttpError> {
    let mut attempt: u8 = 0;
    loop {
      let token = self.session.access_token().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;

      let mut builder = request_factory(&self.http).header("Authorization", token.authorization_header()).header("User-Agent", &self.user_agent);
      if let Some(locale) = locale_override {
        builder = builder.header("Accept-Language", locale);
      }

      match builder.send().await {
        Ok(response) => {
          let status = response.status();
          if status.is_success() {
            return Ok(response);
          }
          if Self::retryable(status) && attempt < MAX_RETRIES {
            Self::backoff(attempt).await;
            attempt += 1;
            continue;
          }
          return Err(map_status(status));
        }
        Err(e) => {
          if attempt < MAX_RETRIES {
            warn!("spclient request error on attempt {attempt}: {e}");
            Self::backoff(attempt).await;
            attempt += 1;
            continue;
          }
          return Err(HttpError::RequestFailed(e.to_string()));
        }
      }
    }
  }

  fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
  }

  async fn backoff(attempt: u8) {
    tokio::time::sleep(Duration::from_secs(2u64.saturating_pow(u32::from(attempt)))).await;
  }
}
