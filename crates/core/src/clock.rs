use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const DEFAULT_MAX_SAMPLES: usize = 5;

/// Offset between local wall-clock and venue time.
///
/// Shared as an `Arc` by the authenticator, the tracker and the reconciler.
/// The offset is the median of the most recent samples so a single slow
/// round-trip does not skew signing timestamps.
#[derive(Debug)]
pub struct SynchronizedClock {
    offset_ms: AtomicI64,
    samples: Mutex<VecDeque<i64>>,
    max_samples: usize,
}

impl SynchronizedClock {
    pub fn new() -> Self {
        Self::with_max_samples(DEFAULT_MAX_SAMPLES)
    }

    pub fn with_max_samples(max_samples: usize) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(max_samples.max(1))),
            max_samples: max_samples.max(1),
        }
    }

    /// Current venue-minus-local offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Venue-aligned current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.to_venue_time(Utc::now())
    }

    pub fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    pub fn to_venue_time(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local + Duration::milliseconds(self.offset_ms())
    }

    /// Time elapsed since a venue-aligned timestamp.
    pub fn age_of(&self, ts: DateTime<Utc>) -> Duration {
        self.now() - ts
    }

    pub fn is_stale(&self, ts: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_of(ts) > max_age
    }

    /// Record one server-time observation taken between `sent_at` and
    /// `received_at` (local times). Returns the new effective offset.
    pub fn add_sample(
        &self,
        sent_at: DateTime<Utc>,
        server_time: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> i64 {
        let local_mid = sent_at + (received_at - sent_at) / 2;
        let sample = (server_time - local_mid).num_milliseconds();

        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back(sample);
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
        let offset = median(samples.iter().copied());
        self.offset_ms.store(offset, Ordering::Release);

        debug!(sample_ms = sample, offset_ms = offset, samples = samples.len(), "clock sample");
        offset
    }

    /// Forget all samples. The next sample fully determines the offset.
    pub fn reset(&self) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.clear();
        self.offset_ms.store(0, Ordering::Release);
    }

    pub fn sample_count(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SynchronizedClock {
    fn default() -> Self {
        Self::new()
    }
}

fn median(values: impl Iterator<Item = i64>) -> i64 {
    let mut sorted: Vec<i64> = values.collect();
    if sorted.is_empty() {
        return 0;
    }
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}
