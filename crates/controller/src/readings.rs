//! Latest-known sensor values shared between the polling tasks and the
//! fan-out readers (broadcast, persistence, CSV).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    SoilMoisture,
    Pressure,
    Light,
    Rain,
}

impl Metric {
    /// Every metric, in CSV column order.
    pub const ALL: [Metric; 6] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::SoilMoisture,
        Metric::Pressure,
        Metric::Light,
        Metric::Rain,
    ];

    /// Metrics a snapshot must carry before it is persisted.
    pub const REQUIRED: [Metric; 2] = [Metric::Temperature, Metric::Humidity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::SoilMoisture => "soil_moisture",
            Metric::Pressure => "pressure",
            Metric::Light => "light",
            Metric::Rain => "rain",
        }
    }

    /// Column title used in the daily CSV header.
    pub fn csv_label(&self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature (°C)",
            Metric::Humidity => "Humidity (%)",
            Metric::SoilMoisture => "Soil Moisture (%)",
            Metric::Pressure => "Pressure (hPa)",
            Metric::Light => "Light Level (%)",
            Metric::Rain => "Rain Level (%)",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Readings & snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// `None` when the sensor could not be read and no fallback applied.
    pub value: Option<f64>,
    pub simulated: bool,
    pub timestamp: DateTime<Local>,
}

impl Reading {
    pub fn measured(value: f64) -> Self {
        Self {
            value: Some(value),
            simulated: false,
            timestamp: Local::now(),
        }
    }

    pub fn simulated(value: f64) -> Self {
        Self {
            value: Some(value),
            simulated: true,
            timestamp: Local::now(),
        }
    }

    pub fn absent() -> Self {
        Self {
            value: None,
            simulated: false,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Connected,
    Disconnected,
}

/// Latest reading per metric plus the moment the copy was taken.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub readings: BTreeMap<Metric, Reading>,
    pub timestamp: DateTime<Local>,
}

impl Snapshot {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.readings.get(&metric).and_then(|r| r.value)
    }

    /// A metric is connected iff its latest poll produced a value. Metrics
    /// that have never been polled report disconnected.
    pub fn status(&self) -> BTreeMap<Metric, SensorStatus> {
        Metric::ALL
            .iter()
            .map(|m| {
                let status = if self.value(*m).is_some() {
                    SensorStatus::Connected
                } else {
                    SensorStatus::Disconnected
                };
                (*m, status)
            })
            .collect()
    }

    pub fn has_required(&self) -> bool {
        Metric::REQUIRED.iter().all(|m| self.value(*m).is_some())
    }

    pub fn to_record(&self) -> SnapshotRecord {
        SnapshotRecord {
            temperature: self.value(Metric::Temperature),
            humidity: self.value(Metric::Humidity),
            soil_moisture: self.value(Metric::SoilMoisture),
            pressure: self.value(Metric::Pressure),
            light: self.value(Metric::Light),
            rain: self.value(Metric::Rain),
            timestamp: self.timestamp,
        }
    }
}

/// Flat row handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub pressure: Option<f64>,
    pub light: Option<f64>,
    pub rain: Option<f64>,
    pub timestamp: DateTime<Local>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub type SharedCache = Arc<ReadingsCache>;

/// Written only by the sensor polling tasks, one writer per metric. The lock
/// is held for the insert or the clone, never across I/O.
#[derive(Default)]
pub struct ReadingsCache {
    readings: RwLock<BTreeMap<Metric, Reading>>,
}

impl ReadingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, metric: Metric, reading: Reading) {
        self.readings.write().await.insert(metric, reading);
    }

    pub async fn snapshot(&self) -> Snapshot {
        let readings = self.readings.read().await.clone();
        Snapshot {
            readings,
            timestamp: Local::now(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
