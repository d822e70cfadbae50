use std::io::{self, Read, Seek, SeekFrom};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

use super::CryptoError;

/// librespot's fixed IV for AES-128-CTR encrypted audio files.
const AUDIO_AES_IV: [u8; 16] = [0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d, 0x93];

const BLOCK_SIZE: u64 = 16;

/// Seekable AES-128-CTR decryption over an arbitrary `Read + Seek` byte
/// source. When constructed with `key = None` it is a transparent
/// pass-through (unencrypted files are signalled this way).
pub struct AesCtrDecryptStream<R> {
  inner: R,
  cipher: Option<Aes128>,
  iv: u128,
  position: u64,
  inner_position: u64,
  cached_block: Option<(u64, [u8; 16])>,
}

impl<R: Read + Seek> AesCtrDecryptStream<R> {
  pub fn new(inner: R, key: Option<&[u8]>) -> Result<Self, CryptoError> {
    let cipher = key
      .map(|key| {
        let key: &[u8; 16] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
          expected: 16,
          actual: key.len(),
        })?;
        Ok::<_, CryptoError>(Aes128::new(GenericArray::from_slice(key)))
      })
      .transpose()?;

    Ok(Self {
      inner,
      cipher,
      iv: u128::from_be_bytes(AUDIO_AES_IV),
      position: 0,
      inner_position: 0,
      cached_block: None,
    })
  }

  fn keystream_block(&mut self, block_index: u64) -> [u8; 16] {
    if let Some((cached_index, cached_block)) = self.cached_block {
      if cached_index == block_index {
        return cached_block;
      }
    }

    let counter = self.iv.wrapping_add(u128::from(block_index));
    let mut block = counter.to_be_bytes();
    if let Some(cipher) = &self.cipher {
      cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    }
    self.cached_block = Some((block_index, block));
    block
  }
}

impl<R: Read + Seek> Read for AesCtrDecryptStream<R> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if self.inner_position != self.position {
      self.inner.seek(SeekFrom::Start(self.position))?;
      self.inner_position = self.position;
    }

    let n = self.inner.read(buf)?;

    if self.cipher.is_some() {
      for (i, byte) in buf[..n].iter_mut().enumerate() {
        let absolute = self.position + i as u64;
        let block_index = absolute / BLOCK_SIZE;
        let block_offset = (absolute % BLOCK_SIZE) as usize;
        let keystream = self.keystream_block(block_index);
        *byte ^= keystream[block_offset];
      }
    }

    self.position += n as u64;
    self.inner_position += n as u64;
    Ok(n)
  }
}

impl<R: Read + Seek> Seek for AesCtrDecryptStream<R> {
  fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
    // Defer the inner seek to the next read; only the logical position
    // changes here. The read aligns the base stream to that position.
    let new_position = match pos {
      SeekFrom::Start(p) => p,
      SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
      SeekFrom::End(_) => return Err(io::Error::new(io::ErrorKind::Unsupported, "AesCtrDecryptStream has no known length")),
    };
    self.position = new_position;
    Ok(self.position)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn key() -> [u8; 16] {
    [0x11; 16]
  }

  fn encrypt_all(plaintext: &[u8], key: &[u8]) -> Vec<u8> {
    let cursor = Cursor::new(plaintext.to_vec());
    let mut stream = AesCtrDecryptStream::new(cursor, Some(key)).unwrap();
    let mut out = vec![0u8; plaintext.len()];
    stream.read_exact(&mut out).unwrap();
    out
  }

  #[test]
  fn pass_through_when_key_is_none() {
    let plaintext = b"hello spotify".to_vec();
    let cursor = Cursor::new(plaintext.clone());
    let mut stream = AesCtrDecryptStream::new(cursor, None).unwrap();
    let mut out = vec![0u8; plaintext.len()];
    stream.read_exact(&mut out).unwrap();
    assert_eq!(out, plaintext);
  }

  #[test]
  fn rejects_wrong_key_length() {
    let cursor = Cursor::new(vec![0u8; 16]);
    let err = AesCtrDecryptStream::new(cursor, Some(&[0u8; 10])).unwrap_err();
    assert_eq!(err, CryptoError::InvalidKeyLength { expected: 16, actual: 10 });
  }

  #[test]
  fn seek_transparency_matches_reading_from_the_start() {
    // read(p, n) must equal read(0, p+n)[p..p+n].
    let key = key();
    let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    let ciphertext = encrypt_all(&data, &key);

    let p = 37usize;
    let n = 50usize;

    let mut full = AesCtrDecryptStream::new(Cursor::new(ciphertext.clone()), Some(&key)).unwrap();
    let mut from_start = vec![0u8; p + n];
    full.read_exact(&mut from_start).unwrap();

    let mut seeking = AesCtrDecryptStream::new(Cursor::new(ciphertext), Some(&key)).unwrap();
    seeking.seek(SeekFrom::Start(p as u64)).unwrap();
    let mut from_seek = vec![0u8; n];
    seeking.read_exact(&mut from_seek).unwrap();

    assert_eq!(from_seek, from_start[p..p + n]);
  }

  #[test]
  fn decrypting_a_round_trip_recovers_the_plaintext() {
    let key = key();
    let plaintext: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
    let ciphertext = encrypt_all(&plaintext, &key);
    let decrypted = encrypt_all(&ciphertext, &key);
    assert_eq!(decrypted, plaintext);
  }

  proptest::proptest! {
    #[test]
    fn seek_transparency_property(p in 0usize..300, n in 0usize..100) {
      let key = key();
      let data: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
      let ciphertext = encrypt_all(&data, &key);

      let mut full = AesCtrDecryptStream::new(Cursor::new(ciphertext.clone()), Some(&key)).unwrap();
      let mut from_start = vec![0u8; p + n];
      full.read_exact(&mut from_start).unwrap();

      let mut seeking = AesCtrDecryptStream::new(Cursor::new(ciphertext), Some(&key)).unwrap();
      seeking.seek(SeekFrom::Start(p as u64)).unwrap();
      let mut from_seek = vec![0u8; n];
      seeking.read_exact(&mut from_seek).unwrap();

      proptest::prop_assert_eq!(from_seek, from_start[p..p + n].to_vec());
    }
  }
}
