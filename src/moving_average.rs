use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::EncodeError;

/// MovingAverager maintains a windowed collection of samples per
/// `(device_token, sensor_id, interval)` and returns the arithmetic mean of
/// the samples inside `[now - interval, now]`, appending the new sample
/// atomically.
pub trait MovingAverager: Send + Sync {
    fn moving_average(
        &self,
        value: f64,
        device_token: &str,
        sensor_id: u32,
        interval: u32,
    ) -> Result<f64, EncodeError>;

    /// Liveness check, used by the pulse endpoint.
    fn ping(&self) -> Result<(), EncodeError>;

    /// Release any held resources.
    fn stop(&self);
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: i64,
    value: f64,
}

/// In-process implementation of `MovingAverager`. The store is a map keyed by
/// device token, sensor id and interval, holding time-ordered samples.
/// Append, eviction and the mean all happen under a single lock acquisition,
/// so concurrent calls for the same key observe some serial order.
pub struct InMemoryAverager {
    entries: Mutex<HashMap<String, Vec<Sample>>>,
    clock: Arc<dyn Clock>,
    verbose: bool,
}

impl InMemoryAverager {
    pub fn new(clock: Arc<dyn Clock>, verbose: bool) -> InMemoryAverager {
        InMemoryAverager {
            entries: Mutex::new(HashMap::new()),
            clock,
            verbose,
        }
    }

    #[cfg(test)]
    fn sample_count(&self, device_token: &str, sensor_id: u32, interval: u32) -> usize {
        let entries = self.entries.lock();
        entries
            .get(&build_key(device_token, sensor_id, interval))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl MovingAverager for InMemoryAverager {
    fn moving_average(
        &self,
        value: f64,
        device_token: &str,
        sensor_id: u32,
        interval: u32,
    ) -> Result<f64, EncodeError> {
        let key = build_key(device_token, sensor_id, interval);

        let now = self.clock.now();
        let cutoff = (now - Duration::seconds(i64::from(interval))).timestamp();

        let mut entries = self.entries.lock();
        let samples = entries.entry(key.clone()).or_default();

        samples.push(Sample {
            timestamp: now.timestamp(),
            value,
        });
        samples.retain(|s| s.timestamp >= cutoff);

        let sum: f64 = samples.iter().map(|s| s.value).sum();
        let mean = sum / samples.len() as f64;

        if self.verbose {
            debug!(
                "moving average for {}: {} samples, mean {}",
                key,
                samples.len(),
                mean
            );
        }

        Ok(mean)
    }

    fn ping(&self) -> Result<(), EncodeError> {
        Ok(())
    }

    fn stop(&self) {
        self.entries.lock().clear();
    }
}

/// Key for the sample set of a device/sensor/interval combination.
fn build_key(device_token: &str, sensor_id: u32, interval: u32) -> String {
    format!("{}:{}:{}", device_token, sensor_id, interval)
}
