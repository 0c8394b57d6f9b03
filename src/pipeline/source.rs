//! Heap sources feeding the ingest stage.
//!
//! The real receiver (UDP packets reassembled into heaps) lives outside this crate and
//! plugs in through [`HeapSource`]. [`MockHeapSource`] generates a reproducible heap
//! stream with configurable loss, blanking, phase switching and interval markers.

use crate::config::SourceConfig;
use crate::data::heap::{mjd_now, status, HeapHeader, HeapIndexEntry};
use crate::pipeline::cancel::{Interrupt, InterruptFlag};
use crate::pipeline::stage::StageError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest sleep between interrupt checks while pacing.
const PACING_SLICE: Duration = Duration::from_millis(10);

/// Result of asking a source for the next heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Received {
    /// Heap written into the payload buffer. A lost heap has an invalid index entry
    /// and a zeroed payload.
    Heap {
        /// Status word
        header: HeapHeader,
        /// Validity and receipt time
        index: HeapIndexEntry,
    },
    /// No more heaps will arrive
    Exhausted,
    /// The receive was interrupted from outside
    Interrupted,
}

/// Producer of heaps for the ingest stage.
pub trait HeapSource: Send {
    /// Receive the next heap into `payload` (`[channel][subband][stokes]`).
    fn next_heap(&mut self, payload: &mut [f32]) -> Result<Received, StageError>;

    /// Handle that wakes a blocked [`HeapSource::next_heap`].
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

/// Payload contents generated by [`MockHeapSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockPayload {
    /// Uniform noise in `[0, 1)`
    Noise,
    /// Every value set to the constant
    Constant(f32),
}

/// Seeded synthetic heap stream.
pub struct MockHeapSource {
    config: SourceConfig,
    rng: ChaCha8Rng,
    payload: MockPayload,
    counter: u64,
    epoch_mjd: f64,
    started: Option<Instant>,
    interrupt: InterruptFlag,
}

impl MockHeapSource {
    /// Source driven by `config`, timestamps starting now.
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            config: config.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            payload: MockPayload::Noise,
            counter: 0,
            epoch_mjd: mjd_now(),
            started: None,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Use a fixed payload pattern.
    pub fn with_payload(mut self, payload: MockPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Timestamp of heap 0.
    pub fn with_epoch(mut self, mjd: f64) -> Self {
        self.epoch_mjd = mjd;
        self
    }

    /// Heaps produced so far.
    pub fn produced(&self) -> u64 {
        self.counter
    }

    fn status_for(&self, n: u64) -> u32 {
        let c = &self.config;
        let mut bits = 0;
        if c.phase_period > 0 {
            bits |= ((n / c.phase_period) % 4) as u32 & status::PHASE_MASK;
        }
        if c.blank_every > 0 && (n + 1) % c.blank_every == 0 {
            bits |= status::BLANKING;
        }
        if c.interval_heaps > 0 && (n + 1) % c.interval_heaps == 0 {
            bits |= status::INTERVAL_END;
        }
        bits
    }

    /// Nominal heap spacing; 1 µs when unpaced so timestamps stay distinct.
    fn heap_interval(&self) -> Duration {
        Duration::from_micros(self.config.heap_interval_us.max(1))
    }

    /// Sleep until heap `n` is due. Returns false if interrupted.
    fn pace(&mut self, n: u64) -> bool {
        if self.config.heap_interval_us == 0 {
            return true;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_micros(self.config.heap_interval_us.saturating_mul(n));
        loop {
            if self.interrupt.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= due {
                return true;
            }
            std::thread::sleep((due - now).min(PACING_SLICE));
        }
    }
}

impl HeapSource for MockHeapSource {
    fn next_heap(&mut self, payload: &mut [f32]) -> Result<Received, StageError> {
        if self.interrupt.is_raised() {
            return Ok(Received::Interrupted);
        }
        let n = self.counter;
        if self.config.max_heaps > 0 && n >= self.config.max_heaps {
            return Ok(Received::Exhausted);
        }
        if !self.pace(n) {
            return Ok(Received::Interrupted);
        }

        let lost = self.config.loss_rate > 0.0
            && self.rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0));
        if lost {
            payload.fill(0.0);
        } else {
            match self.payload {
                MockPayload::Constant(v) => payload.fill(v),
                MockPayload::Noise => {
                    for v in payload.iter_mut() {
                        *v = self.rng.gen();
                    }
                }
            }
        }

        let elapsed_days = self.heap_interval().as_secs_f64() * n as f64 / 86_400.0;
        let header = HeapHeader::new(n, self.status_for(n));
        let index = HeapIndexEntry::new(self.epoch_mjd + elapsed_days, !lost);
        self.counter += 1;
        Ok(Received::Heap { header, index })
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(self.interrupt.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SourceConfig {
        SourceConfig {
            max_heaps: 8,
            ..SourceConfig::default()
        }
    }

    fn drain(source: &mut MockHeapSource) -> Vec<(HeapHeader, HeapIndexEntry)> {
        let mut payload = vec![0.0f32; 16];
        let mut out = Vec::new();
        while let Received::Heap { header, index } = source.next_heap(&mut payload).unwrap() {
            out.push((header, index));
        }
        out
    }

    #[test]
    fn stops_after_max_heaps() {
        let mut source = MockHeapSource::new(&config()).with_epoch(0.0);
        let heaps = drain(&mut source);
        assert_eq!(heaps.len(), 8);
        assert_eq!(source.produced(), 8);
        let counters: Vec<u64> = heaps.iter().map(|(h, _)| h.counter).collect();
        assert_eq!(counters, (0..8).collect::<Vec<_>>());
        assert!(heaps.windows(2).all(|w| w[1].1.mjd > w[0].1.mjd));
    }

    #[test]
    fn status_patterns() {
        let mut source = MockHeapSource::new(&SourceConfig {
            phase_period: 2,
            blank_every: 4,
            interval_heaps: 3,
            ..config()
        });
        let statuses: Vec<u32> = drain(&mut source).iter().map(|(h, _)| h.status).collect();
        assert_eq!(statuses[0], 0);
        assert_eq!(statuses[1], 0);
        assert_eq!(statuses[2], 1 | status::INTERVAL_END);
        assert_eq!(statuses[3], 1 | status::BLANKING);
        assert_eq!(statuses[4], 2);
        assert_eq!(statuses[5], 2 | status::INTERVAL_END);
        assert_eq!(statuses[7], 3 | status::BLANKING);
    }

    #[test]
    fn same_seed_same_stream() {
        let cfg = SourceConfig {
            loss_rate: 0.3,
            max_heaps: 64,
            seed: 7,
            ..SourceConfig::default()
        };
        let a: Vec<bool> = drain(&mut MockHeapSource::new(&cfg)).iter().map(|(_, i)| i.is_valid()).collect();
        let b: Vec<bool> = drain(&mut MockHeapSource::new(&cfg)).iter().map(|(_, i)| i.is_valid()).collect();
        assert_eq!(a, b);
        assert!(a.iter().any(|v| !v));
        assert!(a.iter().any(|v| *v));
    }

    #[test]
    fn lost_heaps_have_zero_payload() {
        let cfg = SourceConfig {
            loss_rate: 1.0,
            max_heaps: 1,
            ..SourceConfig::default()
        };
        let mut source = MockHeapSource::new(&cfg).with_payload(MockPayload::Constant(3.0));
        let mut payload = vec![9.0f32; 4];
        match source.next_heap(&mut payload).unwrap() {
            Received::Heap { index, .. } => assert!(!index.is_valid()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(payload.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn interrupt_wakes_paced_source() {
        let cfg = SourceConfig {
            heap_interval_us: 10_000_000,
            ..SourceConfig::default()
        };
        let mut source = MockHeapSource::new(&cfg);
        let mut payload = vec![0.0f32; 4];
        // heap 0 is due immediately
        assert!(matches!(source.next_heap(&mut payload).unwrap(), Received::Heap { .. }));

        let interrupter = source.interrupter().unwrap();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            interrupter.interrupt();
        });
        let started = Instant::now();
        assert_eq!(source.next_heap(&mut payload).unwrap(), Received::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }
}
