//! Per-metric sensor polling. Every registered metric gets its own task, so a
//! slow or failing sensor only ever degrades its own reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::readings::{Metric, Reading, ReadingsCache, SharedCache};
use crate::sensor::sim::SimulatedSensor;
use crate::sensor::{SensorError, SensorPort};

/// Default poll interval for hardware-backed metrics.
pub const HARDWARE_INTERVAL: Duration = Duration::from_millis(2000);
/// Default poll interval for simulated metrics.
pub const SIMULATED_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// One metric
// ---------------------------------------------------------------------------

pub struct SensorSlot {
    metric: Metric,
    source: String,
    /// Shared with the blocking read job; a job that outlives its timeout
    /// still holds the lock, and the next poll reports `Busy`.
    port: Arc<Mutex<Box<dyn SensorPort>>>,
    /// The port itself is a simulator, so every value is flagged simulated.
    simulated: bool,
    fallback: Option<SimulatedSensor>,
    interval: Duration,
    timeout: Duration,
}

impl SensorSlot {
    pub fn new(metric: Metric, port: Box<dyn SensorPort>) -> Self {
        Self {
            metric,
            source: port.describe(),
            port: Arc::new(Mutex::new(port)),
            simulated: false,
            fallback: None,
            interval: HARDWARE_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn simulated(metric: Metric) -> Self {
        let mut slot = Self::new(metric, Box::new(SimulatedSensor::new(metric)))
            .with_interval(SIMULATED_INTERVAL);
        slot.simulated = true;
        slot
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Substitute simulated values when the port fails.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = Some(SimulatedSensor::new(self.metric));
        self
    }

    async fn read_port(&self) -> Result<f64, SensorError> {
        let port = Arc::clone(&self.port);
        let job = tokio::task::spawn_blocking(move || {
            let mut port = match port.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(SensorError::Busy),
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
            };
            port.read()
        });

        match tokio::time::timeout(self.timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SensorError::Hardware(format!("read task failed: {e}"))),
            Err(_) => Err(SensorError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Read once and store the outcome in the cache.
    pub async fn poll_once(&mut self, cache: &ReadingsCache) -> Reading {
        let reading = match self.read_port().await {
            Ok(value) if self.simulated => Reading::simulated(value),
            Ok(value) => Reading::measured(value),
            Err(e) => match self.fallback.as_mut() {
                Some(sim) => {
                    warn!(metric = %self.metric, source = %self.source, "sensor read failed, using simulated value: {e}");
                    Reading::simulated(sim.next_value())
                }
                None => {
                    warn!(metric = %self.metric, source = %self.source, "sensor read failed: {e}");
                    Reading::absent()
                }
            },
        };
        cache.update(self.metric, reading.clone()).await;
        reading
    }

    /// Poll until `running` is cleared.
    pub async fn run(mut self, cache: SharedCache, running: Arc<AtomicBool>) {
        info!(
            metric = %self.metric,
            source = %self.source,
            interval_ms = self.interval.as_millis() as u64,
            fallback = self.fallback.is_some(),
            "sensor polling started"
        );
        while running.load(Ordering::Relaxed) {
            let reading = self.poll_once(&cache).await;
            debug!(metric = %self.metric, value = ?reading.value, simulated = reading.simulated, "sensor polled");
            tokio::time::sleep(self.interval).await;
        }
        debug!(metric = %self.metric, "sensor polling stopped");
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SensorRegistry {
    slots: Vec<SensorSlot>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot, replacing any earlier one for the same metric.
    pub fn register(&mut self, slot: SensorSlot) {
        self.slots.retain(|s| s.metric != slot.metric);
        self.slots.push(slot);
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.slots.iter().map(|s| s.metric).collect()
    }

    pub fn spawn(self, cache: SharedCache, running: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        self.slots
            .into_iter()
            .map(|slot| tokio::spawn(slot.run(Arc::clone(&cache), Arc::clone(&running))))
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
