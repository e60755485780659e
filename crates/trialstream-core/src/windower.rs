//! Cross-block Shannon entropy windows.
//!
//! Each channel has an accumulator that survives block boundaries. Bits are
//! appended, complete windows are sliced off the front, and whatever is left
//! waits for the next block. Nothing is ever dropped, so for every channel
//! `windows * size + remainder == total fed`.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::conditioning::shannon_bits;
use crate::trial::Channel;

const MAX_PREALLOCATED_BITS: usize = 1 << 16;

/// Entropy of one full window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyWindow {
    /// Sequence number of this window within its channel.
    pub global_index: u64,
    /// Half-open range of channel bit positions covered.
    pub bit_range: (u64, u64),
    pub entropy: f64,
}

#[derive(Debug, Clone)]
pub struct EntropyWindower {
    size: usize,
    accumulator: Vec<u8>,
    windows_emitted: u64,
    total_fed: u64,
}

impl EntropyWindower {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            accumulator: Vec::with_capacity(size.min(MAX_PREALLOCATED_BITS)),
            windows_emitted: 0,
            total_fed: 0,
        }
    }

    /// Append bits and return every window that became complete.
    pub fn feed(&mut self, bits: &[u8]) -> Vec<EntropyWindow> {
        self.accumulator.extend_from_slice(bits);
        self.total_fed += bits.len() as u64;

        let mut windows = Vec::new();
        while self.accumulator.len() >= self.size {
            let start = self.windows_emitted * self.size as u64;
            let entropy = shannon_bits(&self.accumulator[..self.size]);
            self.accumulator.drain(..self.size);
            windows.push(EntropyWindow {
                global_index: self.windows_emitted,
                bit_range: (start, start + self.size as u64),
                entropy,
            });
            self.windows_emitted += 1;
        }
        windows
    }

    /// Bits still waiting for a full window.
    pub fn remainder(&self) -> &[u8] {
        &self.accumulator
    }

    pub fn window_size(&self) -> usize {
        self.size
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted
    }

    pub fn total_fed(&self) -> u64 {
        self.total_fed
    }
}

/// A window tagged with its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub channel: Channel,
    #[serde(flatten)]
    pub window: EntropyWindow,
}

/// One windower per active channel.
#[derive(Debug, Clone)]
pub struct ChannelWindowers {
    subject: EntropyWindower,
    ghost: EntropyWindower,
    demon: Option<EntropyWindower>,
}

impl ChannelWindowers {
    pub fn new(size: usize, demon: bool) -> Self {
        Self {
            subject: EntropyWindower::new(size),
            ghost: EntropyWindower::new(size),
            demon: demon.then(|| EntropyWindower::new(size)),
        }
    }

    /// Feed every channel of `block` into its accumulator.
    pub fn feed_block(&mut self, block: &Block) -> Vec<ChannelWindow> {
        let mut out = Vec::new();
        for channel in [Channel::Subject, Channel::Ghost, Channel::Demon] {
            let bits = block.channel_bits(channel);
            if let Some(windower) = self.get_mut(channel) {
                out.extend(
                    windower
                        .feed(&bits)
                        .into_iter()
                        .map(|window| ChannelWindow { channel, window }),
                );
            }
        }
        out
    }

    pub fn get(&self, channel: Channel) -> Option<&EntropyWindower> {
        match channel {
            Channel::Subject => Some(&self.subject),
            Channel::Ghost => Some(&self.ghost),
            Channel::Demon => self.demon.as_ref(),
        }
    }

    fn get_mut(&mut self, channel: Channel) -> Option<&mut EntropyWindower> {
        match channel {
            Channel::Subject => Some(&mut self.subject),
            Channel::Ghost => Some(&mut self.ghost),
            Channel::Demon => self.demon.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_bits(n: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) & 1) as u8
            })
            .collect()
    }

    #[test]
    fn test_nine_bits_window_four() {
        let mut w = EntropyWindower::new(4);
        let windows = w.feed(&[1, 0, 1, 0, 1, 1, 0, 0, 1]);
        assert_eq!(windows.len(), 2);
        assert_eq!(w.remainder(), &[1]);
        assert_eq!(windows[0].bit_range, (0, 4));
        assert_eq!(windows[1].bit_range, (4, 8));
        assert!((windows[0].entropy - 1.0).abs() < 1e-12);
        assert!((windows[1].entropy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_huge_window_size_does_not_preallocate() {
        let mut w = EntropyWindower::new(usize::MAX);
        assert!(w.feed(&[1, 0, 1]).is_empty());
        assert_eq!(w.remainder(), &[1, 0, 1]);
    }

    #[test]
    fn test_remainder_carries_into_next_feed() {
        let mut w = EntropyWindower::new(4);
        assert!(w.feed(&[1, 1, 1]).is_empty());
        let windows = w.feed(&[1, 0]);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].entropy, 0.0);
        assert_eq!(w.remainder(), &[0]);
        assert_eq!(windows[0].global_index, 0);
    }

    #[test]
    fn test_window_emitted_exactly_at_size() {
        let mut w = EntropyWindower::new(3);
        assert_eq!(w.feed(&[1, 0]).len(), 0);
        assert_eq!(w.feed(&[1]).len(), 1);
        assert!(w.remainder().is_empty());
    }

    #[test]
    fn test_conservation_over_irregular_feeds() {
        let bits = lcg_bits(5_000, 42);
        for size in [1usize, 7, 64, 1_000] {
            let mut w = EntropyWindower::new(size);
            let mut offset = 0;
            let mut emitted = 0u64;
            let mut step = 1;
            while offset < bits.len() {
                let end = (offset + step).min(bits.len());
                emitted += w.feed(&bits[offset..end]).len() as u64;
                offset = end;
                step = step * 3 % 97 + 1;
                assert_eq!(
                    emitted * size as u64 + w.remainder().len() as u64,
                    w.total_fed()
                );
                assert!(w.remainder().len() < size);
            }
            assert_eq!(w.total_fed(), 5_000);
            assert_eq!(w.windows_emitted(), emitted);
        }
    }

    #[test]
    fn test_window_indices_are_contiguous() {
        let mut w = EntropyWindower::new(10);
        let mut all = w.feed(&lcg_bits(35, 1));
        all.extend(w.feed(&lcg_bits(35, 2)));
        for (i, win) in all.iter().enumerate() {
            assert_eq!(win.global_index, i as u64);
            assert_eq!(win.bit_range, (i as u64 * 10, i as u64 * 10 + 10));
        }
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn test_channel_windowers_without_demon() {
        let w = ChannelWindowers::new(8, false);
        assert!(w.get(Channel::Subject).is_some());
        assert!(w.get(Channel::Demon).is_none());
    }
}
