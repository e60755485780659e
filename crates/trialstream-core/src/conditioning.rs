//! Bit-level entropy helpers and the SHA-256 generator behind the fallback source.
//!
//! # Architecture
//!
//! ```text
//! OS entropy (getrandom) → seed → state
//! state → SHA-256("out"  || state || counter) → bytes → bits
//!       → SHA-256("next" || state || counter) → state
//! ```
//!
//! The chain is the only place local randomness is produced. Remote units are
//! never conditioned: trials must see the source's bits exactly as delivered.

use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// SHA-256 counter-mode generator
// ---------------------------------------------------------------------------

/// SHA-256 chained generator.
///
/// Output blocks and the next state are separate, domain-tagged digests of
/// the current state, so emitted bytes never expose the state.
const OUTPUT_TAG: &[u8] = b"out";
const RATCHET_TAG: &[u8] = b"next";

#[derive(Clone)]
pub struct Sha256Stream {
    state: [u8; 32],
    counter: u64,
}

impl Sha256Stream {
    /// Seed from OS entropy.
    pub fn from_os() -> Result<Self, getrandom::Error> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed)?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic stream, for tests and replays.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(seed);
        Self {
            state: h.finalize().into(),
            counter: 0,
        }
    }

    pub fn next_block(&mut self) -> [u8; 32] {
        let out = self.digest(OUTPUT_TAG);
        self.state = self.digest(RATCHET_TAG);
        self.counter += 1;
        out
    }

    fn digest(&self, tag: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(tag);
        h.update(self.state);
        h.update(self.counter.to_le_bytes());
        h.finalize().into()
    }

    /// Produce exactly `n` bytes.
    pub fn fill_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n + 32);
        while out.len() < n {
            out.extend_from_slice(&self.next_block());
        }
        out.truncate(n);
        out
    }
}

impl std::fmt::Debug for Sha256Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Stream")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Bit helpers
// ---------------------------------------------------------------------------

/// Unpack bytes into 0/1 units, MSB first.
pub fn unpack_bits(data: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for &byte in data {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

/// True when every unit is 0 or 1.
pub fn is_binary(units: &[u8]) -> bool {
    units.iter().all(|&u| u <= 1)
}

/// Shannon entropy of a 0/1 sequence in bits per unit (0.0 to 1.0).
pub fn shannon_bits(bits: &[u8]) -> f64 {
    if bits.is_empty() {
        return 0.0;
    }
    let ones = bits.iter().filter(|&&b| b == 1).count() as f64;
    let n = bits.len() as f64;
    let mut h = 0.0;
    for count in [ones, n - ones] {
        if count > 0.0 {
            let p = count / n;
            h -= p * p.log2();
        }
    }
    h
}

/// Shannon entropy of each of `parts` equal consecutive slices.
///
/// Trailing units that do not fill a whole part are left out.
pub fn split_entropy(bits: &[u8], parts: usize) -> Vec<f64> {
    if parts == 0 {
        return Vec::new();
    }
    let size = bits.len() / parts;
    if size == 0 {
        return vec![0.0; parts];
    }
    bits.chunks_exact(size)
        .take(parts)
        .map(shannon_bits)
        .collect()
}
