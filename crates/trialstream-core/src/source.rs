//! Entropy source contract, reconnection policy and the local fallback.
//!
//! A source is anything that can be connected for a while and then pushes
//! [`SourceEvent`]s through a `tokio::sync::mpsc` channel. Consumers never
//! read from a source directly: chunks are appended to the block's
//! [`StreamBuffer`](crate::buffer::StreamBuffer) and trials pop from there.
//!
//! When a source cannot be reached after the bounded retries in
//! [`RetryPolicy`], the block continues on a [`FallbackSource`], whose units
//! carry the [`FALLBACK_LABEL`] so downstream consumers can tell the two apart.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::buffer::BitChunk;
use crate::conditioning::{Sha256Stream, is_binary, unpack_bits};
use crate::config::RetryPolicy;

/// Source label attached to every unit produced locally.
pub const FALLBACK_LABEL: &str = "fallback";

/// Event delivered by a connected source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Chunk(BitChunk),
    /// The source has delivered everything it will for this connection.
    Complete,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("malformed chunk: {0}")]
    Malformed(String),

    #[error("source disconnected")]
    Disconnected,
}

/// Trait that every remote entropy source implements.
pub trait EntropySource: Send {
    /// Label stamped on this source's chunks.
    fn label(&self) -> &str;

    /// Open a connection expected to last about `duration_hint`.
    fn connect(
        &mut self,
        duration_hint: Duration,
    ) -> impl Future<Output = Result<mpsc::Receiver<SourceEvent>, SourceError>> + Send;

    /// Stop delivering. Calling it on a disconnected source does nothing.
    fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

/// State of a block's link to its source.
#[derive(Debug)]
pub enum Connection {
    Live(mpsc::Receiver<SourceEvent>),
    /// The source finished or went away; nothing more will arrive.
    Closed,
    /// Retries were exhausted; the block runs on the local generator.
    Fallback,
}

impl Connection {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }

    /// Next event from a live connection. Never resolves otherwise.
    pub async fn recv(&mut self) -> Option<SourceEvent> {
        match self {
            Self::Live(rx) => rx.recv().await,
            _ => std::future::pending().await,
        }
    }
}

/// Connect with exponential backoff.
///
/// Makes at most `policy.max_attempts` attempts, sleeping `policy.backoff(n)`
/// after failed attempt `n`. Never fails: exhaustion yields
/// [`Connection::Fallback`].
pub async fn connect_with_retry<S: EntropySource>(
    source: &mut S,
    duration_hint: Duration,
    policy: &RetryPolicy,
) -> Connection {
    for attempt in 1..=policy.max_attempts {
        match source.connect(duration_hint).await {
            Ok(rx) => {
                if attempt > 1 {
                    log::info!("connected to {} on attempt {attempt}", source.label());
                }
                return Connection::Live(rx);
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                log::warn!(
                    "connect to {} failed (attempt {attempt}/{}): {e}; retrying in {} ms",
                    source.label(),
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::warn!(
                    "connect to {} failed (attempt {attempt}/{}): {e}; using {FALLBACK_LABEL}",
                    source.label(),
                    policy.max_attempts
                );
            }
        }
    }
    Connection::Fallback
}

/// Reject chunks that are not strictly binary or are too short to use.
pub fn validate_chunk(chunk: &BitChunk, min_units: usize) -> Result<(), SourceError> {
    if chunk.len() < min_units {
        return Err(SourceError::Malformed(format!(
            "{} units from {}, need at least {min_units}",
            chunk.len(),
            chunk.source_label
        )));
    }
    if !is_binary(&chunk.units) {
        return Err(SourceError::Malformed(format!(
            "non-binary unit in chunk from {}",
            chunk.source_label
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fallback generator
// ---------------------------------------------------------------------------

/// Local cryptographically-strong unit generator.
#[derive(Debug, Clone)]
pub struct FallbackSource {
    stream: Sha256Stream,
    pending: VecDeque<u8>,
    produced: u64,
}

impl FallbackSource {
    pub fn from_os() -> Result<Self, getrandom::Error> {
        Ok(Self::with_stream(Sha256Stream::from_os()?))
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        Self::with_stream(Sha256Stream::from_seed(seed))
    }

    fn with_stream(stream: Sha256Stream) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            produced: 0,
        }
    }

    /// An independent generator seeded from this one's next block.
    pub fn fork(&mut self) -> Self {
        Self::from_seed(&self.stream.next_block())
    }

    pub fn label(&self) -> &'static str {
        FALLBACK_LABEL
    }

    /// Next `n` 0/1 units.
    pub fn next_units(&mut self, n: usize) -> Vec<u8> {
        while self.pending.len() < n {
            self.pending.extend(unpack_bits(&self.stream.next_block()));
        }
        self.produced += n as u64;
        self.pending.drain(..n).collect()
    }

    /// Next `n` units packaged as a labelled chunk.
    pub fn next_chunk(&mut self, n: usize) -> BitChunk {
        BitChunk::new(FALLBACK_LABEL, self.next_units(n))
    }

    /// Units handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails `failures` times, then delivers one chunk and completes.
    struct FlakySource {
        failures: u32,
        attempts: u32,
        connected: bool,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: 0,
                connected: false,
            }
        }
    }

    impl EntropySource for FlakySource {
        fn label(&self) -> &str {
            "flaky"
        }

        async fn connect(
            &mut self,
            _duration_hint: Duration,
        ) -> Result<mpsc::Receiver<SourceEvent>, SourceError> {
            self.attempts += 1;
            if self.attempts <= self.failures {
                return Err(SourceError::Unreachable("refused".into()));
            }
            self.connected = true;
            let (tx, rx) = mpsc::channel(4);
            tx.try_send(SourceEvent::Chunk(BitChunk::new("flaky", vec![1, 0])))
                .unwrap();
            tx.try_send(SourceEvent::Complete).unwrap();
            Ok(rx)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_connect_first_try() {
        let mut src = FlakySource::new(0);
        let mut conn = connect_with_retry(&mut src, Duration::from_secs(1), &policy(3)).await;
        assert!(conn.is_live());
        assert_eq!(src.attempts, 1);
        assert!(matches!(conn.recv().await, Some(SourceEvent::Chunk(_))));
        assert!(matches!(conn.recv().await, Some(SourceEvent::Complete)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let mut src = FlakySource::new(2);
        let start = tokio::time::Instant::now();
        let conn = connect_with_retry(&mut src, Duration::from_secs(1), &policy(3)).await;
        assert!(conn.is_live());
        assert_eq!(src.attempts, 3);
        // 100 ms after the first failure, 200 ms after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhaustion_falls_back() {
        let mut src = FlakySource::new(10);
        let start = tokio::time::Instant::now();
        let conn = connect_with_retry(&mut src, Duration::from_secs(1), &policy(3)).await;
        assert!(conn.is_fallback());
        assert_eq!(src.attempts, 3);
        assert!(!src.connected);
        // No sleep after the last attempt.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_never_yields() {
        let mut conn = Connection::Closed;
        let res = tokio::time::timeout(Duration::from_secs(5), conn.recv()).await;
        assert!(res.is_err());
    }

    // -----------------------------------------------------------------------
    // Chunk validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_chunk() {
        assert!(validate_chunk(&BitChunk::new("s", vec![0, 1, 1]), 1).is_ok());
        assert!(matches!(
            validate_chunk(&BitChunk::new("s", vec![0, 2]), 1),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            validate_chunk(&BitChunk::new("s", vec![]), 1),
            Err(SourceError::Malformed(_))
        ));
        assert!(validate_chunk(&BitChunk::new("s", vec![1, 1]), 3).is_err());
    }

    // -----------------------------------------------------------------------
    // Fallback
    // -----------------------------------------------------------------------

    #[test]
    fn test_fallback_units_are_binary_and_counted() {
        let mut fb = FallbackSource::from_seed(b"fallback-test");
        let units = fb.next_units(1_000);
        assert_eq!(units.len(), 1_000);
        assert!(is_binary(&units));
        assert_eq!(fb.produced(), 1_000);
    }

    #[test]
    fn test_fallback_chunk_is_labelled() {
        let mut fb = FallbackSource::from_seed(b"x");
        let chunk = fb.next_chunk(5);
        assert_eq!(chunk.source_label, FALLBACK_LABEL);
        assert_eq!(chunk.len(), 5);
    }

    #[test]
    fn test_fallback_is_deterministic_per_seed() {
        let mut a = FallbackSource::from_seed(b"same");
        let mut b = FallbackSource::from_seed(b"same");
        assert_eq!(a.next_units(300), b.next_units(300));
    }

    #[test]
    fn test_fork_is_independent() {
        let mut parent = FallbackSource::from_seed(b"parent");
        let mut a = parent.fork();
        let mut b = parent.fork();
        assert_ne!(a.next_units(256), b.next_units(256));
    }

    #[test]
    fn test_fork_seed_is_not_in_parent_output() {
        let mut parent = FallbackSource::from_seed(b"parent");
        let mut child = parent.fork();
        let emitted = parent.next_units(256);
        let packed: Vec<u8> = emitted
            .chunks(8)
            .map(|byte| byte.iter().fold(0u8, |acc, &bit| (acc << 1) | bit))
            .collect();
        let mut guess = FallbackSource::from_seed(&packed);
        assert_ne!(child.next_units(256), guess.next_units(256));
    }

    #[test]
    fn test_fallback_from_os() {
        let mut fb = FallbackSource::from_os().unwrap();
        assert_eq!(fb.next_units(9).len(), 9);
    }
}
