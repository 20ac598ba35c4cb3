//! Sensor capability boundary. Each metric is backed by one [`SensorPort`];
//! the concrete variant (hardware driver or simulator) is chosen once at
//! startup from configuration.

pub mod iio;
#[cfg(feature = "gpio")]
pub mod mcp3008;
pub mod sim;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("read timed out after {0} ms")]
    Timeout(u64),
    #[error("previous read still in progress")]
    Busy,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparsable value {0:?}")]
    Parse(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

/// A single physical or simulated quantity source.
///
/// `read` may block (bus transactions, sysfs reads); the registry runs it on
/// the blocking pool under a per-sensor timeout, so implementations only
/// need to return promptly on their own error paths.
pub trait SensorPort: Send {
    fn read(&mut self) -> Result<f64, SensorError>;

    /// Short label for logs, e.g. `"iio:/sys/bus/iio/devices/iio:device0"`.
    fn describe(&self) -> String;
}

/// Stand-in for a driver that cannot be constructed on this build or host.
/// Every read fails, so the registry either falls back to simulation or
/// reports the metric disconnected.
pub struct UnavailableSensor {
    reason: String,
}

impl UnavailableSensor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SensorPort for UnavailableSensor {
    fn read(&mut self) -> Result<f64, SensorError> {
        Err(SensorError::Unavailable(self.reason.clone()))
    }

    fn describe(&self) -> String {
        format!("unavailable:{}", self.reason)
    }
}

/// Map a raw ADC value onto 0..=100 % between two calibration endpoints.
/// Endpoints may be given in either order (capacitive moisture probes read
/// lower when wet). Out-of-range raw values clamp.
pub fn percent_between(raw: f64, raw_at_zero: f64, raw_at_full: f64) -> f64 {
    let range = raw_at_full - raw_at_zero;
    if range == 0.0 {
        return 0.0;
    }
    (((raw - raw_at_zero) / range) * 100.0).clamp(0.0, 100.0)
}

// ===========================================================================
// Tests
// ===========================================================================
