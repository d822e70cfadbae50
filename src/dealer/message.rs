use std::collections::HashMap;
use std::io::Read;

use base64::Engine;
use flate2::read::GzDecoder;

use super::DealerError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A fire-and-forget dealer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealerMessage {
  pub uri: String,
  pub headers: HashMap<String, String>,
  pub payload: Vec<u8>,
}

/// A dealer message that requires a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealerRequest {
  pub key: String,
  pub message_id: u64,
  pub sender_device_id: String,
  pub message_ident: String,
  pub payload: serde_json::Value,
}

/// Outcome reported back to the dealer for a [`DealerRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
  Success,
  DeferredResponse,
  UnknownSendCommandResult,
  UpstreamError,
}

impl RequestResult {
  /// Only `Success` maps to `true` in the `{"success": bool}` reply payload.
  pub fn is_success(self) -> bool {
    matches!(self, RequestResult::Success)
  }
}

/// Replayed to new subscribers; initial value is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  Failed,
}

/// Decodes a `message` frame's payload: optional base64, then optional
/// gzip, detected either by header or by `1f 8b` magic-byte autodetection —
/// both paths are kept rather than picking one.
pub fn decode_payload(headers: &HashMap<String, String>, payload: Option<&str>) -> Result<Vec<u8>, DealerError> {
  let raw = match payload {
    Some(encoded) => base64::engine::general_purpose::STANDARD
      .decode(encoded)
      .map_err(|e| DealerError::MalformedFrame(format!("invalid base64 payload: {e}")))?,
    None => Vec::new(),
  };

  if raw.is_empty() {
    return Ok(raw);
  }

  let headers_say_gzip = headers
    .iter()
    .any(|(k, v)| (k.eq_ignore_ascii_case("Transfer-Encoding") || k.eq_ignore_ascii_case("Content-Encoding")) && v.eq_ignore_ascii_case("gzip"));
  let looks_like_gzip = raw.len() >= 2 && raw[0..2] == GZIP_MAGIC;

  if headers_say_gzip || looks_like_gzip {
    let mut decoder = GzDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder
      .read_to_end(&mut out)
      .map_err(|e| DealerError::MalformedFrame(format!("gzip decode failed: {e}")))?;
    Ok(out)
  } else {
    Ok(raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  #[test]
  fn decodes_plain_base64_payload() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
    let headers = HashMap::new();
    let decoded = decode_payload(&headers, Some(&encoded)).unwrap();
    assert_eq!(decoded, b"hello");
  }

  #[test]
  fn decodes_gzip_payload_signalled_by_header() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"payload body").unwrap();
    let gzipped = encoder.finish().unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&gzipped);

    let mut headers = HashMap::new();
    headers.insert("Content-Encoding".to_string(), "gzip".to_string());

    let decoded = decode_payload(&headers, Some(&encoded)).unwrap();
    assert_eq!(decoded, b"payload body");
  }

  #[test]
  fn autodetects_gzip_by_magic_bytes_without_headers() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"cluster update bytes").unwrap();
    let gzipped = encoder.finish().unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&gzipped);

    let decoded = decode_payload(&HashMap::new(), Some(&encoded)).unwrap();
    assert_eq!(decoded, b"cluster update bytes");
  }

  #[test]
  fn missing_payload_decodes_to_empty() {
    assert_eq!(decode_payload(&HashMap::new(), None).unwrap(), Vec::<u8>::new());
  }

  #[test]
  fn only_success_maps_to_a_true_reply() {
    assert!(RequestResult::Success.is_success());
    assert!(!RequestResult::DeferredResponse.is_success());
    assert!(!RequestResult::UnknownSendCommandResult.is_success());
    assert!(!RequestResult::UpstreamError.is_success());
  }
}
