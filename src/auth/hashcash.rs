use std::time::{Duration, Instant};

use rand::RngCore;
use sha1::{Digest, Sha1};

/// Solves the SHA-1 proof-of-work challenge login5 occasionally demands:
/// find a 16-byte suffix such that `SHA1(context || prefix || suffix)` has
/// at least `target_length` leading zero bits.
pub struct HashcashSolver;

impl HashcashSolver {
  /// Brute-forces a suffix satisfying the target. Returns the suffix and
  /// how long the search took, both of which go back into the next
  /// login5 attempt (`ChallengeSolutions.hashcash`).
  pub fn solve(context: &[u8], prefix: &[u8], target_length: u32) -> (Vec<u8>, Duration) {
    assert!(target_length > 0, "target_length must be positive");

    let started = Instant::now();
    let mut rng = rand::thread_rng();
    let mut suffix = [0u8; 16];
    let mut hasher_input = Vec::with_capacity(context.len() + prefix.len() + suffix.len());

    loop {
      rng.fill_bytes(&mut suffix);

      hasher_input.clear();
      hasher_input.extend_from_slice(context);
      hasher_input.extend_from_slice(prefix);
      hasher_input.extend_from_slice(&suffix);

      let digest = Sha1::digest(&hasher_input);
      if leading_zero_bits(&digest) >= target_length {
        return (suffix.to_vec(), started.elapsed());
      }
    }
  }
}

/// Counts leading zero bits across a byte slice: 8 per fully-zero byte,
/// then the leading zeros of the first non-zero byte.
fn leading_zero_bits(bytes: &[u8]) -> u32 {
  let mut count = 0;
  for byte in bytes {
    if *byte == 0 {
      count += 8;
    } else {
      count += byte.leading_zeros();
      break;
    }
  }
  count
}
