use std::collections::VecDeque;
use std::time::Instant;

/// Averages below this are reported as zero
const RATE_EPSILON: f64 = 0.0001;

/// Fixed capacity simple moving average
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest one when the window is full
    pub fn add(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the samples currently in the window
    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Converts a monotonically increasing byte counter into a smoothed rate
#[derive(Debug, Clone)]
pub struct RateCounter {
    last_bytes: u64,
    last_update: Option<Instant>,
    avg: MovingAverage,
}

impl RateCounter {
    /// Counter without a baseline, the first update only records one
    pub fn new(window: usize) -> Self {
        Self {
            last_bytes: 0,
            last_update: None,
            avg: MovingAverage::new(window),
        }
    }

    /// Counter starting from a known byte total and time
    #[cfg(test)]
    pub fn with_baseline(window: usize, bytes: u64, timestamp: Instant) -> Self {
        Self {
            last_bytes: bytes,
            last_update: Some(timestamp),
            avg: MovingAverage::new(window),
        }
    }

    /// Feed the current byte total, returns the smoothed rate (bytes/second)
    pub fn update(&mut self, bytes: u64, timestamp: Instant) -> f64 {
        let Some(last_update) = self.last_update else {
            self.last_bytes = bytes;
            self.last_update = Some(timestamp);
            return self.avg();
        };

        let delta = if self.last_bytes > bytes {
            // Counter reset, e.g. rules reloaded externally
            log::warn!(
                "Byte counter decreased from {} to {}, treating delta as 0",
                self.last_bytes,
                bytes
            );
            0
        } else {
            bytes - self.last_bytes
        };

        let elapsed = match timestamp.checked_duration_since(last_update) {
            Some(elapsed) if !elapsed.is_zero() => elapsed.as_secs_f64(),
            _ => {
                log::debug!(
                    "No time difference, skipping rate counter update (delta {} bytes)",
                    delta
                );
                return self.avg();
            }
        };

        self.avg.add(delta as f64 / elapsed);
        self.last_bytes = bytes;
        self.last_update = Some(timestamp);

        self.avg()
    }

    /// Current smoothed rate, zero when below floating point noise
    pub fn avg(&self) -> f64 {
        let avg = self.avg.avg();
        if avg < RATE_EPSILON {
            0.0
        } else {
            avg
        }
    }

    #[cfg(test)]
    pub fn last_bytes(&self) -> u64 {
        self.last_bytes
    }
}
