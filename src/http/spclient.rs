//! The concrete spclient endpoint table.

use async_trait::async_trait;
use protobuf::Message;
use reqwest::Method;

use super::{AuthenticatedHttpClient, HttpError};
use crate::playback::{ConnectStatePublisher, PutStateArgs};
use crate::proto::collection::{DeltaRequest, DeltaResponse, PageRequest, PageResponse, WriteRequest};
use crate::proto::connect::{ClusterUpdate, Device, DeviceInfo, PlayerOptions, PlayerState, PutStateRequest};
use crate::proto::context::{Context, ContextPage};
use crate::proto::playlist::{ListChanges, SelectedListContent};

const APPLICATION_PROTOBUF: &str = "application/x-protobuf";

/// One playlist or collection revision in its `"{counter},{hash_hex}"` query form.
pub struct Revision {
  pub counter: i32,
  pub hash: Vec<u8>,
}

impl Revision {
  pub fn to_query_form(&self) -> String {
    let hash_hex = self.hash.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{},{}", self.counter, hash_hex)
  }
}

/// The concrete spclient endpoint table, built over an [`AuthenticatedHttpClient`].
pub struct SpotifyHttpApi {
  client: AuthenticatedHttpClient,
  spclient_base: String,
}

impl SpotifyHttpApi {
  pub fn new(client: AuthenticatedHttpClient, spclient_base: impl Into<String>) -> Self {
    Self { client, spclient_base: spclient_base.into() }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.spclient_base, path)
  }

  /// Config's `locale_override` threaded into every call as `Accept-Language`.
  fn locale(&self) -> Option<String> {
    self.client.session().config().locale_override.clone()
  }

  pub async fn metadata(&self, kind: &str, id: &str) -> Result<Vec<u8>, HttpError> {
    let url = self.url(&format!("/metadata/4/{kind}/{id}?market=from_token"));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    response.bytes().await.map(|b| b.to_vec()).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  /// `"Restricted"` in the response body maps to `Unauthorized` regardless
  /// of HTTP status.
  pub async fn storage_resolve(&self, file_id_hex: &str) -> Result<StorageResolveResponse, HttpError> {
    let url = self.url(&format!("/storage-resolve/files/audio/interactive/{file_id_hex}"));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    let parsed: StorageResolveResponse = response.json().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    if parsed.result == "Restricted" {
      return Err(HttpError::Unauthorized);
    }
    Ok(parsed)
  }

  pub async fn lyrics(&self, track_id: &str, encoded_uri: &str) -> Result<Option<serde_json::Value>, HttpError> {
    let url = self.url(&format!("/color-lyrics/v2/track/{track_id}/image/{encoded_uri}?format=json&vocalRemoval=false&market=from_token"));
    let locale = self.locale();
    match self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url).header("app-platform", "Android")).await {
      Ok(response) => response.json().await.map(Some).map_err(|e| HttpError::RequestFailed(e.to_string())),
      Err(HttpError::NotFound) => Ok(None),
      Err(other) => Err(other),
    }
  }

  pub async fn context_resolve(&self, escaped_uri: &str) -> Result<Context, HttpError> {
    let url = self.url(&format!("/context-resolve/v1/{escaped_uri}"));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    let json: serde_json::Value = response.json().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    json_to_protobuf(&json)
  }

  pub async fn context_page(&self, page_url: &str) -> Result<ContextPage, HttpError> {
    let stripped = page_url.strip_prefix("hm://").unwrap_or(page_url);
    let url = self.url(&format!("/{stripped}"));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    let bytes = response.bytes().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    ContextPage::parse_from_bytes(&bytes).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  pub async fn collection_page(&self, request: &PageRequest) -> Result<PageResponse, HttpError> {
    self.post_protobuf("/collection/v2/paging", request).await
  }

  pub async fn collection_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, HttpError> {
    self.post_protobuf("/collection/v2/delta", request).await
  }

  pub async fn collection_write(&self, request: &WriteRequest) -> Result<(), HttpError> {
    let body = request.write_to_bytes().map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    let url = self.url("/collection/v2/write");
    let locale = self.locale();
    self
      .client
      .send(locale.as_deref(), |http| http.request(Method::POST, &url).header("Content-Type", APPLICATION_PROTOBUF).body(body.clone()))
      .await?;
    Ok(())
  }

  pub async fn playlist(&self, uri_as_path: &str, decorate: &str, from: u32, length: u32) -> Result<SelectedListContent, HttpError> {
    let url = self.url(&format!("/playlist/v2/{uri_as_path}?decorate={decorate}&from={from}&length={length}"));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    let bytes = response.bytes().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    SelectedListContent::parse_from_bytes(&bytes).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  pub async fn playlist_diff(&self, uri_as_path: &str, revision: &Revision) -> Result<SelectedListContent, HttpError> {
    let url = self.url(&format!("/playlist/v2/{uri_as_path}/diff?revision={}", revision.to_query_form()));
    let locale = self.locale();
    let response = self.client.send(locale.as_deref(), |http| http.request(Method::GET, &url)).await?;
    let bytes = response.bytes().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    SelectedListContent::parse_from_bytes(&bytes).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  /// A 409 response means the server's revision moved under us; the caller
  /// should refetch via [`Self::playlist`] and retry.
  pub async fn playlist_change(&self, uri_as_path: &str, changes: &ListChanges) -> Result<SelectedListContent, HttpError> {
    let url = self.url(&format!("/playlist/v2/{uri_as_path}/changes"));
    let response = self.post_protobuf_response(&url, changes).await?;
    let bytes = response.bytes().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    SelectedListContent::parse_from_bytes(&bytes).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  /// Fire-and-forget telemetry; failures are swallowed.
  pub async fn send_event(&self, tab_delimited_body: String) {
    let url = self.url("/event-service/v1/events");
    let locale = self.locale();
    if let Err(e) = self.client.send(locale.as_deref(), |http| http.request(Method::POST, &url).header("Content-Type", "text/plain").body(tab_delimited_body.clone())).await {
      log::debug!("event-service call failed, dropping: {e}");
    }
  }

  async fn post_protobuf<Req: Message, Resp: Message>(&self, path: &str, request: &Req) -> Result<Resp, HttpError> {
    let url = self.url(path);
    let response = self.post_protobuf_response(&url, request).await?;
    let bytes = response.bytes().await.map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    Resp::parse_from_bytes(&bytes).map_err(|e| HttpError::RequestFailed(e.to_string()))
  }

  async fn post_protobuf_response<Req: Message>(&self, url: &str, request: &Req) -> Result<reqwest::Response, HttpError> {
    let body = request.write_to_bytes().map_err(|e| HttpError::RequestFailed(e.to_string()))?;
    let locale = self.locale();
    self.client.send(locale.as_deref(), |http| http.request(Method::POST, url).header("Content-Type", APPLICATION_PROTOBUF).body(body.clone())).await
  }
}

#[async_trait]
impl ConnectStatePublisher for SpotifyHttpApi {
  async fn put_connect_state(&self, connection_id: &str, request: PutStateArgs) -> Result<(), String> {
    let player_state = PlayerState {
      track_uri: request.track_uri.unwrap_or_default(),
      position_as_of_timestamp: request.position_ms,
      is_playing: request.is_playing,
      is_paused: request.is_paused,
      options: protobuf::MessageField::some(PlayerOptions {
        shuffling_context: request.options.shuffling,
        repeating_context: request.options.repeating_context,
        repeating_track: request.options.repeating_track,
        ..Default::default()
      }),
      ..Default::default()
    };
    let device = Device {
      device_info: protobuf::MessageField::some(DeviceInfo {
        device_id: request.device_id.clone(),
        name: request.device_name,
        device_type: request.device_type,
        ..Default::default()
      }),
      player_state: protobuf::MessageField::some(player_state),
      ..Default::default()
    };
    let put_state = PutStateRequest { device: protobuf::MessageField::some(device), ..Default::default() };

    let url = self.url(&format!("/connect-state/v1/devices/{}", request.device_id));
    let body = put_state.write_to_bytes().map_err(|e| e.to_string())?;
    let locale = self.locale();
    let response = self
      .client
      .send(locale.as_deref(), |http| {
        http
          .request(Method::PUT, &url)
          .header("Content-Type", APPLICATION_PROTOBUF)
          .header("X-Spotify-Connection-Id", connection_id)
          .body(body.clone())
      })
      .await
      .map_err(|e| e.to_string())?;

    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    ClusterUpdate::parse_from_bytes(&bytes).map_err(|e| e.to_string())?;
    Ok(())
  }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageResolveResponse {
  pub result: String,
  #[serde(default)]
  pub cdnurl: Vec<String>,
}

/// spclient hands context-resolve back as JSON even though the rest of the
/// context pipeline is protobuf; re-encode into the generated message so
/// callers only ever deal with one `Context` type.
fn json_to_protobuf(json: &serde_json::Value) -> Result<Context, HttpError> {
  let mut context = Context::new();
  if let Some(uri) = json.get("uri").and_then(|v| v.as_str()) {
    context.uri = uri.to_string();
  }
  if let Some(url) = json.get("url").and_then(|v| v.as_str()) {
    context.url = url.to_string();
  }
  if let Some(pages) = json.get("pages").and_then(|v| v.as_array()) {
    for page in pages {
      let mut ctx_page = ContextPage::new();
      if let Some(tracks) = page.get("tracks").and_then(|v| v.as_array()) {
        for track in tracks {
          if let Some(uri) = track.get("uri").and_then(|v| v.as_str()) {
            let mut ctx_track = crate::proto::context::ContextTrack::new();
            ctx_track.uri = uri.to_string();
            ctx_page.tracks.push(ctx_track);
          }
        }
      }
      context.pages.push(ctx_page);
    }
  }
  Ok(context)
}
