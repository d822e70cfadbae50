use super::CryptoError;

/// Register width: a 16x32-bit LFSR `R`, a parallel 16x32-bit CRC register `CRC`.
const N: usize = 16;
/// Diffusion rounds run by `finish`.
const FOLD: usize = N;
const INITKONST: u32 = 0x6996c53a;
/// Index perturbed in `finish`.
const KEYP: usize = 13;

fn sbox1(w: u32) -> u32 {
  let w = w ^ (w.rotate_left(5) | w.rotate_left(7));
  w ^ (w.rotate_left(19) | w.rotate_left(22))
}

fn sbox2(w: u32) -> u32 {
  let w = w ^ (w.rotate_left(7) | w.rotate_left(22));
  w ^ (w.rotate_left(5) | w.rotate_left(19))
}

/// The Shannon stream cipher and MAC used to encrypt-then-authenticate
/// control packets on the Spotify session layer.
///
/// A `ShannonCipher` is constructed once from the session key, then
/// `nonce_u32` is called before every packet to derive that packet's
/// keystream and reset its MAC accumulator; `finish` consumes the
/// accumulated MAC for that single packet.
pub struct ShannonCipher {
  r: [u32; N],
  crc: [u32; N],
  init_r: [u32; N],
  konst: u32,
  sbuf: u32,
  mbuf: u32,
  nbuf: u32,
}

impl ShannonCipher {
  pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
    if key.len() != 32 {
      return Err(CryptoError::InvalidKeyLength { expected: 32, actual: key.len() });
    }

    let mut cipher = Self {
      r: [0; N],
      crc: [0; N],
      init_r: [0; N],
      konst: INITKONST,
      sbuf: 0,
      mbuf: 0,
      nbuf: 0,
    };
    cipher.load_key(key);
    cipher.konst = cipher.r[0];
    cipher.init_r = cipher.r;
    Ok(cipher)
  }

  /// Reloads `R` from the saved initial state, resets `konst`, then mixes
  /// the big-endian packet nonce in through `load_key` and recomputes
  /// `konst` — one fresh keystream/MAC context per outgoing packet.
  pub fn nonce_u32(&mut self, nonce: u32) {
    self.r = self.init_r;
    self.konst = INITKONST;
    self.load_key(&nonce.to_be_bytes());
    self.konst = self.r[0];
    self.crc = [0; N];
    self.mbuf = 0;
    self.nbuf = 0;
  }

  fn cycle(&mut self) {
    let mut t = self.r[12] ^ self.r[13] ^ self.konst;
    t = sbox1(t);
    t ^= self.r[0].rotate_left(1);
    for i in 1..N {
      self.r[i - 1] = self.r[i];
    }
    self.r[N - 1] = t;
    self.sbuf = sbox2(self.r[2].wrapping_add(self.r[15])) ^ self.r[0].rotate_left(9);
  }

  fn load_key(&mut self, key: &[u8]) {
    for (i, chunk) in key.chunks(4).enumerate() {
      let mut bytes = [0u8; 4];
      bytes[..chunk.len()].copy_from_slice(chunk);
      let word = u32::from_be_bytes(bytes);
      self.r[i % N] ^= word;
      self.cycle();
    }
    self.r[KEYP] ^= key.len() as u32;
    for _ in 0..FOLD {
      self.cycle();
    }
  }

  /// Mirrors an IBM CRC-16 (poly `0xA001`) shift register across all 32 bit
  /// positions of the CRC state simultaneously, folding `word` in as the
  /// input tap.
  fn crc_func(&mut self, word: u32) {
    let feedback = self.crc[0] ^ word;
    for i in 0..N - 1 {
      self.crc[i] = self.crc[i + 1];
    }
    self.crc[N - 1] = feedback;
    self.crc[0] ^= feedback; // tap at bit 0 of 0xA001
    self.crc[13] ^= feedback; // tap at bit 13 of 0xA001
  }

  fn mac_word(&mut self, plaintext_word: u32) {
    self.crc_func(plaintext_word);
  }

  fn buffer_tail_byte(&mut self, byte: u8, index_in_word: u32) {
    self.mbuf |= u32::from(byte) << (index_in_word * 8);
    self.nbuf += 8;
  }

  /// Encrypts `buf` in place. MACs over plaintext before XORing with the
  /// keystream.
  pub fn encrypt(&mut self, buf: &mut [u8]) {
    let mut i = 0;
    while i + 4 <= buf.len() {
      self.cycle();
      let word = u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
      self.mac_word(word);
      buf[i..i + 4].copy_from_slice(&(word ^ self.sbuf).to_le_bytes());
      i += 4;
    }
    if i < buf.len() {
      self.cycle();
      let ks = self.sbuf.to_le_bytes();
      for (j, byte) in buf[i..].iter_mut().enumerate() {
        self.buffer_tail_byte(*byte, j as u32);
        *byte ^= ks[j];
      }
    }
  }

  /// Decrypts `buf` in place. XORs with the keystream first, then MACs the
  /// recovered plaintext.
  pub fn decrypt(&mut self, buf: &mut [u8]) {
    let mut i = 0;
    while i + 4 <= buf.len() {
      self.cycle();
      let ct = u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
      let pt = ct ^ self.sbuf;
      self.mac_word(pt);
      buf[i..i + 4].copy_from_slice(&pt.to_le_bytes());
      i += 4;
    }
    if i < buf.len() {
      self.cycle();
      let ks = self.sbuf.to_le_bytes();
      for (j, byte) in buf[i..].iter_mut().enumerate() {
        *byte ^= ks[j];
        self.buffer_tail_byte(*byte, j as u32);
      }
    }
  }

  /// Finalizes the MAC for the current packet: folds any buffered tail
  /// bits in, perturbs `R[KEYP]`, mixes `CRC` into `R`, runs `FOLD`
  /// diffusion cycles, then emits one more keystream word as a 4-byte
  /// little-endian MAC.
  pub fn finish(&mut self) -> [u8; 4] {
    let nbuf = self.nbuf;
    if nbuf > 0 {
      self.mac_word(self.mbuf);
      self.mbuf = 0;
      self.nbuf = 0;
    }

    self.r[KEYP] ^= self.konst ^ (nbuf << 3);
    for i in 0..N {
      self.r[i] ^= self.crc[i];
    }
    for _ in 0..FOLD {
      self.cycle();
    }
    self.cycle();
    self.sbuf.to_le_bytes()
  }

  /// Finalizes and compares against a received MAC, failing with
  /// [`CryptoError::MacVerificationFailed`] on mismatch.
  pub fn check_mac(&mut self, received: &[u8]) -> Result<(), CryptoError> {
    let computed = self.finish();
    if computed.as_slice() == received {
      Ok(())
    } else {
      Err(CryptoError::MacVerificationFailed)
    }
  }
}
