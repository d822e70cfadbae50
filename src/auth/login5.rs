use std::time::Duration;

use log::{info, warn};
use protobuf::{Message, MessageField};

use super::{hashcash::HashcashSolver, token::AccessToken, AuthError};
use crate::proto::login5::{
  ChallengeSolutions, ClientInfo, HashcashSolution, LoginError as ProtoLoginError, LoginRequest, LoginResponse,
  StoredCredential,
};

const MAX_RETRIES: u8 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Credentials saved from a prior, successful authentication — the
/// reusable blob login5 hands back in `LoginOk.stored_credential`.
#[derive(Clone)]
pub struct StoredCredentials {
  pub username: String,
  pub data: Vec<u8>,
}

/// Exchanges [`StoredCredentials`] for an [`AccessToken`] against login5,
/// solving any hashcash challenge it demands along the way.
pub struct Login5Client {
  http: reqwest::Client,
  endpoint: String,
  client_id: String,
  device_id: String,
}

impl Login5Client {
  pub fn new(http: reqwest::Client, endpoint: impl Into<String>, client_id: impl Into<String>, device_id: impl Into<String>) -> Self {
    Self {
      http,
      endpoint: endpoint.into(),
      client_id: client_id.into(),
      device_id: device_id.into(),
    }
  }

  pub async fn login(&self, credentials: StoredCredentials) -> Result<AccessToken, AuthError> {
    if credentials.username.is_empty() && credentials.data.is_empty() {
      return Err(AuthError::NoStoredCredentials);
    }

    let mut login_context: Vec<u8> = Vec::new();
    let mut challenge_solutions: Option<ChallengeSolutions> = None;

    for attempt in 0..MAX_RETRIES {
      let response = self
        .send_request(&credentials, login_context.clone(), challenge_solutions.take())
        .await?;

      if let Some(token) = Self::token_from_ok(&response) {
        return Ok(token);
      }

      if response.has_challenges() {
        let challenges = response.challenges();
        let solved = self.solve_challenges(challenges)?;
        challenge_solutions = Some(solved);
        login_context = response.login_context.clone();
        continue;
      }

      match Self::classify_error(&response) {
        RetryableOutcome::Retry => {
          warn!("login5 attempt {} hit a retryable error, waiting {:?}", attempt + 1, RETRY_DELAY);
          tokio::time::sleep(RETRY_DELAY).await;
          login_context = response.login_context.clone();
          continue;
        }
        RetryableOutcome::Fail(err) => return Err(err),
      }
    }

    Err(AuthError::MaxRetriesExceeded)
  }

  async fn send_request(
    &self,
    credentials: &StoredCredentials,
    login_context: Vec<u8>,
    challenge_solutions: Option<ChallengeSolutions>,
  ) -> Result<LoginResponse, AuthError> {
    let mut request = LoginRequest::new();

    let mut client_info = ClientInfo::new();
    client_info.client_id = self.client_id.clone();
    client_info.device_id = self.device_id.clone();
    request.client_info = MessageField::some(client_info);

    let mut stored_credential = StoredCredential::new();
    stored_credential.username = credentials.username.clone();
    stored_credential.data = credentials.data.clone();
    request.stored_credential = MessageField::some(stored_credential);

    request.login_context = login_context;
    if let Some(solutions) = challenge_solutions {
      request.challenge_solutions = MessageField::some(solutions);
    }

    let body = request.write_to_bytes().map_err(|e| AuthError::Transport(e.to_string()))?;

    let http_response = self
      .http
      .post(&self.endpoint)
      .header("Content-Type", "application/x-protobuf")
      .header("Accept", "application/x-protobuf")
      .body(body)
      .send()
      .await
      .map_err(|e| AuthError::Transport(e.to_string()))?;

    let bytes = http_response.bytes().await.map_err(|e| AuthError::Transport(e.to_string()))?;

    LoginResponse::parse_from_bytes(&bytes).map_err(|e| AuthError::Transport(e.to_string()))
  }

  fn token_from_ok(response: &LoginResponse) -> Option<AccessToken> {
    if !response.has_ok() {
      return None;
    }
    let ok = response.ok();
    info!("login5 exchange succeeded for {}", ok.username);
    Some(AccessToken::new(
      ok.access_token.clone(),
      Duration::from_secs(ok.access_token_expires_in.max(0) as u64),
    ))
  }

  fn classify_error(response: &LoginResponse) -> RetryableOutcome {
    if !response.has_error() {
      return RetryableOutcome::Fail(AuthError::NoOkResponse);
    }
    match response.error() {
      ProtoLoginError::TIMEOUT => RetryableOutcome::Retry,
      ProtoLoginError::TOO_MANY_ATTEMPTS => RetryableOutcome::Retry,
      ProtoLoginError::INVALID_CREDENTIALS => RetryableOutcome::Fail(AuthError::InvalidCredentials),
      ProtoLoginError::BAD_REQUEST => RetryableOutcome::Fail(AuthError::BadRequest),
      ProtoLoginError::UNSUPPORTED_LOGIN_PROTOCOL => RetryableOutcome::Fail(AuthError::UnsupportedProtocol),
      ProtoLoginError::UNKNOWN_IDENTIFIER => RetryableOutcome::Fail(AuthError::UnknownIdentifier),
      ProtoLoginError::INVALID_PHONENUMBER => RetryableOutcome::Fail(AuthError::InvalidPhoneNumber),
      ProtoLoginError::TRY_AGAIN_LATER => RetryableOutcome::Fail(AuthError::TryAgainLater),
      ProtoLoginError::UNKNOWN_ERROR => RetryableOutcome::Fail(AuthError::Unknown),
    }
  }

  fn solve_challenges(&self, challenges: &crate::proto::login5::Challenges) -> Result<ChallengeSolutions, AuthError> {
    let mut solutions = ChallengeSolutions::new();

    for challenge in &challenges.challenges {
      if challenge.has_code() {
        return Err(AuthError::CodeChallengeNotSupported);
      }
      if challenge.has_hashcash() {
        let hashcash = challenge.hashcash();
        let (suffix, elapsed) = HashcashSolver::solve(&hashcash.context, &hashcash.prefix, hashcash.length.max(0) as u32);

        let mut proto_duration = crate::proto::login5::Duration::new();
        proto_duration.seconds = elapsed.as_secs() as i64;
        proto_duration.nanos = elapsed.subsec_nanos() as i32;

        let mut solution = HashcashSolution::new();
        solution.suffix = suffix;
        solution.duration = MessageField::some(proto_duration);
        solutions.hashcash = MessageField::some(solution);
      }
    }

    Ok(solutions)
  }
}

enum RetryableOutcome {
  Retry,
  Fail(AuthError),
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn error_response_body(error: ProtoLoginError) -> Vec<u8> {
    let mut response = LoginResponse::new();
    response.set_error(error);
    response.write_to_bytes().unwrap()
  }

  #[tokio::test]
  async fn invalid_credentials_fails_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/login5"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(error_response_body(ProtoLoginError::INVALID_CREDENTIALS)))
      .expect(1)
      .mount(&server)
      .await;

    let client = Login5Client::new(reqwest::Client::new(), format!("{}/login5", server.uri()), "client-id", "device-id");
    let credentials = StoredCredentials { username: "alice".to_string(), data: vec![9, 9, 9] };

    let err = client.login(credentials).await.unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials);
  }

  #[tokio::test]
  async fn empty_stored_credentials_are_rejected_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/login5")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let client = Login5Client::new(reqwest::Client::new(), format!("{}/login5", server.uri()), "client-id", "device-id");
    let credentials = StoredCredentials { username: String::new(), data: Vec::new() };

    let err = client.login(credentials).await.unwrap_err();
    assert_eq!(err, AuthError::NoStoredCredentials);
  }

  #[test]
  fn classifies_timeout_and_too_many_attempts_as_retryable() {
    let mut response = LoginResponse::new();
    response.set_error(ProtoLoginError::TIMEOUT);
    assert!(matches!(Login5Client::classify_error(&response), RetryableOutcome::Retry));

    let mut response = LoginResponse::new();
    response.set_error(ProtoLoginError::TOO_MANY_ATTEMPTS);
    assert!(matches!(Login5Client::classify_error(&response), RetryableOutcome::Retry));
  }

  #[test]
  fn classifies_invalid_credentials_as_a_terminal_failure() {
    let mut response = LoginResponse::new();
    response.set_error(ProtoLoginError::INVALID_CREDENTIALS);
    match Login5Client::classify_error(&response) {
      RetryableOutcome::Fail(AuthError::InvalidCredentials) => {}
      other => panic!("expected InvalidCredentials, got a different outcome: {}", matches!(other, RetryableOutcome::Retry)),
    }
  }

  #[test]
  fn token_from_ok_reads_expiry_from_seconds() {
    let mut response = LoginResponse::new();
    let mut ok = crate::proto::login5::LoginOk::new();
    ok.username = "alice".to_string();
    ok.access_token = "tok".to_string();
    ok.access_token_expires_in = 3600;
    response.set_ok(ok);

    let token = Login5Client::token_from_ok(&response).expect("token");
    assert_eq!(token.token(), "tok");
    assert!(!token.should_refresh());
  }
}
