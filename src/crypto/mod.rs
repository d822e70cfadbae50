//! Cryptographic primitives used on the wire: AES-128-CTR for encrypted
//! audio files and the Shannon stream cipher for the session control
//! channel's framed packets.

mod aes_ctr;
mod shannon;

pub use aes_ctr::AesCtrDecryptStream;
pub use shannon::ShannonCipher;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
  #[error("invalid key length: expected {expected} bytes, got {actual}")]
  InvalidKeyLength { expected: usize, actual: usize },
  #[error("MAC verification failed")]
  MacVerificationFailed,
}
