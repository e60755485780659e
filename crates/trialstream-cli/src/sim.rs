//! Simulated entropy sources for local runs.
//!
//! [`SimulatedSource`] mimics a remote random-bit service: chunks arrive on a
//! jittery interval and the stream occasionally stalls for a while, which is
//! what exercises the governor's pause/resume path and the block guardrails.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trialstream_core::{
    BitChunk, EntropySource, FALLBACK_LABEL, FallbackSource, SourceError, SourceEvent,
};

/// Delivery pattern of a simulated source.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub chunk_units: usize,
    pub chunk_interval_ms: u64,
    /// Extra random delay per chunk, up to this many ms.
    pub jitter_ms: u64,
    /// Chance that a given chunk is preceded by a stall.
    pub stall_probability: f64,
    pub stall_ms: (u64, u64),
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            chunk_units: 64,
            chunk_interval_ms: 250,
            jitter_ms: 100,
            stall_probability: 0.02,
            stall_ms: (500, 3_000),
        }
    }
}

enum Bits {
    Pseudo,
    Local(FallbackSource),
}

pub struct SimulatedSource {
    label: String,
    settings: SimSettings,
    rng: StdRng,
    local: Option<FallbackSource>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedSource {
    /// Pseudo-random bits from a seeded generator.
    pub fn new(settings: SimSettings, seed: u64) -> Self {
        Self {
            label: "simulated".to_string(),
            settings,
            rng: StdRng::seed_from_u64(seed),
            local: None,
            task: None,
        }
    }

    /// Bits from the local SHA-256 generator, delivered on the same jittery
    /// schedule and labelled as fallback.
    pub fn local(settings: SimSettings, seed: u64, generator: FallbackSource) -> Self {
        let mut source = Self::new(settings, seed);
        source.label = FALLBACK_LABEL.to_string();
        source.local = Some(generator);
        source
    }
}

impl EntropySource for SimulatedSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn connect(
        &mut self,
        duration_hint: Duration,
    ) -> Result<mpsc::Receiver<SourceEvent>, SourceError> {
        self.disconnect();
        if self.settings.chunk_units == 0 {
            return Err(SourceError::Unreachable("chunk size is zero".into()));
        }
        log::debug!(
            "{}: streaming for up to {} ms",
            self.label,
            duration_hint.as_millis()
        );

        let (tx, rx) = mpsc::channel(256);
        let settings = self.settings.clone();
        let label = self.label.clone();
        let mut rng = StdRng::seed_from_u64(self.rng.random());
        let mut bits = match self.local.as_mut() {
            Some(generator) => Bits::Local(generator.fork()),
            None => Bits::Pseudo,
        };

        self.task = Some(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            while started.elapsed() < duration_hint {
                let mut delay = settings.chunk_interval_ms;
                if settings.jitter_ms > 0 {
                    delay += rng.random_range(0..=settings.jitter_ms);
                }
                if rng.random_bool(settings.stall_probability.clamp(0.0, 1.0)) {
                    let (lo, hi) = settings.stall_ms;
                    let stall = rng.random_range(lo..=hi.max(lo));
                    log::debug!("{label}: stalling for {stall} ms");
                    delay += stall;
                }
                tokio::time::sleep(Duration::from_millis(delay)).await;

                let units = match &mut bits {
                    Bits::Pseudo => (0..settings.chunk_units)
                        .map(|_| u8::from(rng.random::<bool>()))
                        .collect(),
                    Bits::Local(generator) => generator.next_units(settings.chunk_units),
                };
                if tx.send(SourceEvent::Chunk(BitChunk::new(&label, units))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(SourceEvent::Complete).await;
        }));
        Ok(rx)
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}
