use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{ConnectionState, DealerError};

/// A frame as seen by a `DealerConnection` caller: either one reassembled
/// text message or one reassembled binary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
  Text(String),
  Binary(Vec<u8>),
}

/// One Spotify dealer WebSocket. Single-owner: the socket is never shared
/// across tasks, only observed through the channels `DealerClient` builds
/// on top of it.
pub struct DealerConnection {
  socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
  state: ConnectionState,
}

impl Default for DealerConnection {
  fn default() -> Self {
    Self::new()
  }
}

impl DealerConnection {
  pub fn new() -> Self {
    Self { socket: None, state: ConnectionState::Disconnected }
  }

  pub fn state(&self) -> ConnectionState {
    self.state
  }

  pub async fn connect(&mut self, url: &str) -> Result<(), DealerError> {
    if !url.starts_with("wss://") {
      return Err(DealerError::InvalidUrl(url.to_string()));
    }
    if self.state != ConnectionState::Disconnected {
      return Err(DealerError::AlreadyConnected);
    }

    self.state = ConnectionState::Connecting;
    match connect_async(url).await {
      Ok((socket, _response)) => {
        self.socket = Some(socket);
        self.state = ConnectionState::Connected;
        Ok(())
      }
      Err(e) => {
        self.state = ConnectionState::Disconnected;
        Err(DealerError::IoError(e.to_string()))
      }
    }
  }

  pub async fn send_text(&mut self, text: String) -> Result<(), DealerError> {
    self.send(WsMessage::Text(text)).await
  }

  pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), DealerError> {
    self.send(WsMessage::Binary(bytes)).await
  }

  async fn send(&mut self, message: WsMessage) -> Result<(), DealerError> {
    if self.state != ConnectionState::Connected {
      return Err(DealerError::NotConnected);
    }
    let socket = self.socket.as_mut().ok_or(DealerError::NotConnected)?;
    if socket.send(message).await.is_err() {
      self.state = ConnectionState::Disconnected;
      return Err(DealerError::IoError("send failed".to_string()));
    }
    Ok(())
  }

  /// Reads the next reassembled frame. `tokio-tungstenite` already
  /// coalesces WebSocket continuation fragments into one `Message`, so a
  /// single `next()` call yields one fully reassembled frame regardless of
  /// how many fragments it arrived as; single-segment and multi-segment
  /// inputs are indistinguishable to callers.
  pub async fn recv(&mut self) -> Option<Result<InboundFrame, DealerError>> {
    let socket = self.socket.as_mut()?;
    loop {
      match socket.next().await {
        Some(Ok(WsMessage::Text(text))) => return Some(Ok(InboundFrame::Text(text))),
        Some(Ok(WsMessage::Binary(bytes))) => return Some(Ok(InboundFrame::Binary(bytes))),
        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
        Some(Ok(WsMessage::Close(_))) | None => {
          self.state = ConnectionState::Disconnected;
          return None;
        }
        Some(Ok(WsMessage::Frame(_))) => continue,
        Some(Err(e)) => {
          self.state = ConnectionState::Disconnected;
          return Some(Err(DealerError::IoError(e.to_string())));
        }
      }
    }
  }

  /// Idempotent: closes the socket, if any, and returns to `Disconnected`.
  pub async fn dispose(&mut self) {
    if let Some(mut socket) = self.socket.take() {
      let _ = socket.close(None).await;
    }
    self.state = ConnectionState::Disconnected;
  }
}

/// Pure buffer-reassembly helper: returns
/// `None` for an empty buffer, otherwise the entire buffered sequence as
/// one message, having drained the buffer.
pub fn try_read_message(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
  if buffer.is_empty() {
    return None;
  }
  Some(std::mem::take(buffer))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_buffer_yields_no_message() {
    let mut buffer = Vec::new();
    assert_eq!(try_read_message(&mut buffer), None);
  }

  #[test]
  fn single_segment_is_returned_whole_and_buffer_is_drained() {
    let mut buffer = b"hello".to_vec();
    assert_eq!(try_read_message(&mut buffer), Some(b"hello".to_vec()));
    assert!(buffer.is_empty());
  }

  #[test]
  fn multi_segment_fragments_concatenate_into_one_message() {
    let fragments: [&[u8]; 3] = [b"frag-one-", b"frag-two-", b"frag-three"];
    let mut buffer = Vec::new();
    for fragment in fragments {
      buffer.extend_from_slice(fragment);
    }
    let expected: Vec<u8> = fragments.concat();

    let message = try_read_message(&mut buffer).unwrap();
    assert_eq!(message, expected);
    assert!(buffer.is_empty());
  }

  #[tokio::test]
  async fn connect_rejects_non_wss_urls() {
    let mut connection = DealerConnection::new();
    let err = connection.connect("ws://dealer.spotify.com").await.unwrap_err();
    assert_eq!(err, DealerError::InvalidUrl("ws://dealer.spotify.com".to_string()));
  }

  #[tokio::test]
  async fn send_before_connect_is_not_connected() {
    let mut connection = DealerConnection::new();
    let err = connection.send_text("hi".to_string()).await.unwrap_err();
    assert_eq!(err, DealerError::NotConnected);
  }

  #[tokio::test]
  async fn dispose_is_idempotent() {
    let mut connection = DealerConnection::new();
    connection.dispose().await;
    connection.dispose().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
  }
}
