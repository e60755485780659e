//! Trials, channels and the per-trial draw policy.

use serde::{Deserialize, Serialize};

/// One of the parallel comparison streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// The experimental channel.
    Subject,
    /// Control drawn alongside the subject unit.
    Ghost,
    /// Optional second control.
    Demon,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subject => write!(f, "subject"),
            Self::Ghost => write!(f, "ghost"),
            Self::Demon => write!(f, "demon"),
        }
    }
}

/// How a trial's units are drawn from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStrategy {
    /// Subject and ghost come from one two-unit draw at adjacent offsets.
    Alternating,
    /// Each channel gets its own one-unit draw.
    Independent,
}

impl ChannelStrategy {
    /// Strategy for the trial at zero-based `index`.
    ///
    /// Odd-numbered trials (1st, 3rd, ...) alternate; even-numbered trials are
    /// independent. Fixed by parity, not configurable per run.
    pub fn for_trial(index: usize) -> Self {
        let trial_number = index + 1;
        if trial_number % 2 == 1 {
            Self::Alternating
        } else {
            Self::Independent
        }
    }
}

impl std::fmt::Display for ChannelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alternating => write!(f, "alternating"),
            Self::Independent => write!(f, "independent"),
        }
    }
}

/// The binary value every channel is scored against for a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAssignment {
    pub value: u8,
}

impl TargetAssignment {
    /// Pick one of `allowed` using OS entropy.
    ///
    /// A single allowed value is returned without drawing.
    pub fn draw(allowed: &[u8]) -> Result<Self, getrandom::Error> {
        match allowed {
            [] => Ok(Self { value: 1 }),
            [only] => Ok(Self { value: *only }),
            _ => {
                let mut byte = [0u8; 1];
                // Rejection sampling keeps the pick uniform for any set size.
                let limit = 256 - 256 % allowed.len();
                loop {
                    getrandom::fill(&mut byte)?;
                    if (byte[0] as usize) < limit {
                        return Ok(Self {
                            value: allowed[byte[0] as usize % allowed.len()],
                        });
                    }
                }
            }
        }
    }

    pub fn fixed(value: u8) -> Self {
        Self { value }
    }

    pub fn is_hit(&self, unit: u8) -> bool {
        unit == self.value
    }
}

/// One recorded trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub index: usize,
    pub strategy: ChannelStrategy,
    pub subject_unit: u8,
    pub ghost_unit: u8,
    pub demon_unit: Option<u8>,
    /// Stream positions of the units in draw order: subject, ghost, demon.
    pub raw_source_indices: Vec<u64>,
    /// Whether the subject and ghost units came from the same chunk.
    pub same_chunk: bool,
    /// Source label of each unit, parallel to `raw_source_indices`.
    pub source_labels: Vec<String>,
    /// True when any unit came from the local fallback generator.
    pub fallback: bool,
    pub subject_hit: bool,
    pub ghost_hit: bool,
    pub demon_hit: Option<bool>,
    /// Offset from the block clock origin.
    pub at_ms: u64,
}

impl TrialOutcome {
    pub fn unit(&self, channel: Channel) -> Option<u8> {
        match channel {
            Channel::Subject => Some(self.subject_unit),
            Channel::Ghost => Some(self.ghost_unit),
            Channel::Demon => self.demon_unit,
        }
    }

    pub fn hit(&self, channel: Channel) -> Option<bool> {
        match channel {
            Channel::Subject => Some(self.subject_hit),
            Channel::Ghost => Some(self.ghost_hit),
            Channel::Demon => self.demon_hit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_by_parity() {
        assert_eq!(ChannelStrategy::for_trial(0), ChannelStrategy::Alternating);
        assert_eq!(ChannelStrategy::for_trial(1), ChannelStrategy::Independent);
        assert_eq!(ChannelStrategy::for_trial(2), ChannelStrategy::Alternating);
        assert_eq!(ChannelStrategy::for_trial(9), ChannelStrategy::Independent);
    }

    #[test]
    fn test_strategy_split_is_even() {
        let alternating = (0..100)
            .filter(|&i| ChannelStrategy::for_trial(i) == ChannelStrategy::Alternating)
            .count();
        assert_eq!(alternating, 50);
    }

    #[test]
    fn test_target_draw_respects_allowed_set() {
        for _ in 0..50 {
            let t = TargetAssignment::draw(&[0, 1]).unwrap();
            assert!(t.value <= 1);
        }
        assert_eq!(TargetAssignment::draw(&[1]).unwrap().value, 1);
        assert_eq!(TargetAssignment::draw(&[0]).unwrap().value, 0);
    }

    #[test]
    fn test_is_hit() {
        let t = TargetAssignment::fixed(1);
        assert!(t.is_hit(1));
        assert!(!t.is_hit(0));
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::Subject.to_string(), "subject");
        assert_eq!(Channel::Demon.to_string(), "demon");
        assert_eq!(ChannelStrategy::Alternating.to_string(), "alternating");
    }
}
