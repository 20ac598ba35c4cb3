//! Linux Industrial I/O (IIO) sysfs sensor.
//!
//! The kernel `dht11` driver (DHT11/DHT22) exposes
//! `in_temp_input` (milli-°C) and `in_humidityrelative_input` (milli-%),
//! and the `bmp280` driver (which also handles the BMP180) exposes
//! `in_pressure_input` in kPa. One attribute file backs one metric; `scale`
//! converts the raw number into the unit the rest of the system uses.

use std::fs;
use std::path::PathBuf;

use crate::sensor::{SensorError, SensorPort};

pub struct IioSensor {
    path: PathBuf,
    scale: f64,
}

impl IioSensor {
    pub fn new(path: impl Into<PathBuf>, scale: f64) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

/// Parse one sysfs attribute value. The kernel writes a bare integer or
/// decimal followed by a newline.
fn parse_attr(contents: &str) -> Result<f64, SensorError> {
    let trimmed = contents.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SensorError::Parse(trimmed.to_string()))
}

impl SensorPort for IioSensor {
    fn read(&mut self) -> Result<f64, SensorError> {
        // The dht11 driver returns EIO/ETIMEDOUT on checksum or timing
        // failures; those surface as SensorError::Io and the registry
        // retries on the next tick.
        let contents = fs::read_to_string(&self.path)?;
        Ok(parse_attr(&contents)? * self.scale)
    }

    fn describe(&self) -> String {
        format!("iio:{}", self.path.display())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
