//! Credential-for-token exchange (login5) and the hashcash proof-of-work
//! challenge it sometimes demands.

mod hashcash;
mod login5;
mod token;

pub use hashcash::HashcashSolver;
pub use login5::Login5Client;
pub use token::AccessToken;

use thiserror::Error;

/// Closed set of login5 failure reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
  #[error("invalid credentials")]
  InvalidCredentials,
  #[error("bad request")]
  BadRequest,
  #[error("unsupported login protocol")]
  UnsupportedProtocol,
  #[error("login5 request timed out")]
  Timeout,
  #[error("unknown identifier")]
  UnknownIdentifier,
  #[error("too many attempts")]
  TooManyAttempts,
  #[error("invalid phone number")]
  InvalidPhoneNumber,
  #[error("try again later")]
  TryAgainLater,
  #[error("no stored credentials available")]
  NoStoredCredentials,
  #[error("login5 issued a code challenge, which this client cannot solve")]
  CodeChallengeNotSupported,
  #[error("exceeded the maximum number of login5 retries")]
  MaxRetriesExceeded,
  #[error("login5 response carried neither an ok result nor an error")]
  NoOkResponse,
  #[error("unknown login5 error")]
  Unknown,
  #[error("transport error: {0}")]
  Transport(String),
}
