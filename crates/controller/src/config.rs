//! TOML config file loading, environment overrides, validation, and
//! database seeding for presets.

use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::csv_log::ValueRange;
use crate::db::Db;
use crate::readings::Metric;
use crate::registry::{SensorRegistry, SensorSlot, DEFAULT_TIMEOUT, HARDWARE_INTERVAL, SIMULATED_INTERVAL};
use crate::sensor::iio::IioSensor;
use crate::sensor::SensorPort;
use crate::store::{parse_days, parse_start_time, NewPreset, NewSchedule};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Force every sensor to its simulated variant.
    pub simulation: bool,
    pub database_url: String,
    pub intervals: Intervals,
    /// Keyed by metric name (`temperature`, `soil_moisture`, ...).
    pub sensors: BTreeMap<String, SensorEntry>,
    pub validation: BTreeMap<String, ValueRange>,
    pub csv: CsvSection,
    pub pump: PumpSection,
    pub mqtt: Option<MqttSection>,
    pub presets: Vec<PresetEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulation: true,
            database_url: "sqlite:irrigation.db?mode=rwc".into(),
            intervals: Intervals::default(),
            sensors: BTreeMap::new(),
            validation: BTreeMap::new(),
            csv: CsvSection {
                enabled: true,
                folder: Some("data/sensor_logs".into()),
                timestamp_format: default_timestamp_format(),
            },
            pump: PumpSection::default(),
            mqtt: None,
            presets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Intervals {
    /// Broadcast cadence; fractional seconds allowed.
    pub ui_secs: f64,
    pub db_secs: u64,
    pub csv_secs: u64,
    pub scheduler_secs: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            ui_secs: 1.0,
            db_secs: 60,
            csv_secs: 60,
            scheduler_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Simulated,
    Iio,
    Mcp3008,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    #[serde(default)]
    pub driver: Driver,
    /// Defaults to 2000 for hardware drivers, 1000 for simulated.
    pub interval_ms: Option<u64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Substitute simulated values when the hardware read fails.
    #[serde(default = "default_true")]
    pub fallback: bool,

    // iio
    pub path: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,

    // mcp3008
    pub channel: Option<u8>,
    #[serde(default)]
    pub raw_low: f64,
    #[serde(default = "default_raw_high")]
    pub raw_high: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub folder: Option<String>,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpSection {
    pub gpio_pin: i64,
    pub active_low: bool,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            gpio_pin: 21,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresetEntry {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    /// "HH:MM"
    pub start_time: String,
    pub duration_sec: i64,
    /// Weekday names; empty = every day.
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_scale() -> f64 {
    1.0
}
fn default_raw_high() -> f64 {
    1023.0
}
fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "irrigation-controller".into()
}
fn default_topic_prefix() -> String {
    "irrigation".into()
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Highest single-ended reading from the MCP3008 (10-bit).
const MCP3008_MAX: f64 = 1023.0;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_intervals(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_ranges(&mut errors);
        self.validate_csv(&mut errors);
        self.validate_pump(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_presets(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_intervals(&self, errors: &mut Vec<String>) {
        let i = &self.intervals;
        if !(i.ui_secs.is_finite() && i.ui_secs > 0.0) {
            errors.push(format!("intervals.ui_secs must be positive, got {}", i.ui_secs));
        } else if Duration::try_from_secs_f64(i.ui_secs).is_err() {
            errors.push(format!("intervals.ui_secs out of range, got {}", i.ui_secs));
        }
        for (name, v) in [
            ("db_secs", i.db_secs),
            ("csv_secs", i.csv_secs),
            ("scheduler_secs", i.scheduler_secs),
        ] {
            if v == 0 {
                errors.push(format!("intervals.{name} must be positive"));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        for (name, s) in &self.sensors {
            let ctx = format!("sensor '{name}'");
            if name.parse::<Metric>().is_err() {
                errors.push(format!("{ctx}: unknown metric"));
            }

            if s.interval_ms == Some(0) {
                errors.push(format!("{ctx}: interval_ms must be positive"));
            }
            if s.timeout_ms == 0 {
                errors.push(format!("{ctx}: timeout_ms must be positive"));
            }

            match s.driver {
                Driver::Simulated => {}
                Driver::Iio => {
                    if s.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                        errors.push(format!("{ctx}: iio driver requires a path"));
                    }
                    if !s.scale.is_finite() || s.scale == 0.0 {
                        errors.push(format!("{ctx}: scale must be a non-zero number"));
                    }
                }
                Driver::Mcp3008 => {
                    match s.channel {
                        None => errors.push(format!("{ctx}: mcp3008 driver requires a channel")),
                        Some(ch) if ch > 7 => {
                            errors.push(format!("{ctx}: channel {ch} out of range (0-7)"))
                        }
                        Some(_) => {}
                    }
                    for (field, v) in [("raw_low", s.raw_low), ("raw_high", s.raw_high)] {
                        if !(0.0..=MCP3008_MAX).contains(&v) {
                            errors.push(format!(
                                "{ctx}: {field} {v} out of MCP3008 range [0, {MCP3008_MAX}]"
                            ));
                        }
                    }
                    if s.raw_low == s.raw_high {
                        errors.push(format!(
                            "{ctx}: raw_low and raw_high are both {}: calibration range is zero",
                            s.raw_low
                        ));
                    }
                }
            }
        }
    }

    fn validate_ranges(&self, errors: &mut Vec<String>) {
        for (name, r) in &self.validation {
            if name.parse::<Metric>().is_err() {
                errors.push(format!("validation '{name}': unknown metric"));
            }
            if !(r.min < r.max) {
                errors.push(format!(
                    "validation '{name}': min ({}) must be less than max ({})",
                    r.min, r.max
                ));
            }
        }
    }

    fn validate_csv(&self, errors: &mut Vec<String>) {
        if !self.csv.enabled {
            return;
        }
        if self.csv.folder.as_deref().map_or(true, |f| f.trim().is_empty()) {
            errors.push("csv.folder is required when csv logging is enabled".into());
        }
        if StrftimeItems::new(&self.csv.timestamp_format).any(|i| matches!(i, Item::Error)) {
            errors.push(format!(
                "csv.timestamp_format '{}' is not a valid strftime pattern",
                self.csv.timestamp_format
            ));
        }
    }

    fn validate_pump(&self, errors: &mut Vec<String>) {
        if !VALID_GPIO_PINS.contains(&self.pump.gpio_pin) {
            errors.push(format!(
                "pump: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.pump.gpio_pin
            ));
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let Some(m) = &self.mqtt else { return };
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        let prefix = m.topic_prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt: topic_prefix '{}' must be non-empty and free of wildcards",
                m.topic_prefix
            ));
        }
    }

    fn validate_presets(&self, errors: &mut Vec<String>) {
        let active = self.presets.iter().filter(|p| p.active).count();
        if active > 1 {
            errors.push(format!("presets: {active} presets marked active, at most one allowed"));
        }

        for (i, p) in self.presets.iter().enumerate() {
            let ctx = if p.name.trim().is_empty() {
                errors.push(format!("presets[{i}]: name is empty"));
                format!("presets[{i}]")
            } else {
                format!("preset '{}'", p.name)
            };

            for (j, s) in p.schedules.iter().enumerate() {
                if let Err(e) = parse_start_time(&s.start_time) {
                    errors.push(format!("{ctx} schedules[{j}]: {e}"));
                }
                if s.duration_sec <= 0 {
                    errors.push(format!(
                        "{ctx} schedules[{j}]: duration_sec must be positive, got {}",
                        s.duration_sec
                    ));
                }
                if let Err(e) = parse_days(&s.days.join(",")) {
                    errors.push(format!("{ctx} schedules[{j}]: {e}"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn ui_interval(&self) -> Duration {
        Duration::from_secs_f64(self.intervals.ui_secs)
    }

    pub fn db_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.db_secs)
    }

    pub fn csv_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.csv_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.scheduler_secs)
    }

    /// Built-in ranges overlaid with the configured ones.
    pub fn validation_ranges(&self) -> BTreeMap<Metric, ValueRange> {
        let mut ranges: BTreeMap<Metric, ValueRange> = Metric::ALL
            .iter()
            .map(|m| (*m, ValueRange::default_for(*m)))
            .collect();
        for (name, r) in &self.validation {
            if let Ok(m) = name.parse::<Metric>() {
                ranges.insert(m, *r);
            }
        }
        ranges
    }

    fn sensor_entry(&self, metric: Metric) -> Option<&SensorEntry> {
        self.sensors.get(metric.as_str())
    }

    /// One slot per metric. With `simulation` on, or no entry for a metric,
    /// that metric is simulated.
    pub fn sensor_registry(&self) -> SensorRegistry {
        let mut registry = SensorRegistry::new();
        for metric in Metric::ALL {
            let entry = self.sensor_entry(metric);
            let slot = match entry {
                Some(e) if !self.simulation && e.driver != Driver::Simulated => {
                    let mut slot = SensorSlot::new(metric, hardware_port(metric, e))
                        .with_interval(
                            e.interval_ms
                                .map(Duration::from_millis)
                                .unwrap_or(HARDWARE_INTERVAL),
                        )
                        .with_timeout(Duration::from_millis(e.timeout_ms));
                    if e.fallback {
                        slot = slot.with_fallback();
                    }
                    slot
                }
                _ => SensorSlot::simulated(metric).with_interval(
                    entry
                        .and_then(|e| e.interval_ms)
                        .map(Duration::from_millis)
                        .unwrap_or(SIMULATED_INTERVAL),
                ),
            };
            registry.register(slot);
        }
        registry
    }

    /// Apply environment overrides. `get` abstracts `std::env::var` so tests
    /// need not touch the process environment.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("DB_URL") {
            self.database_url = v;
        }
        if let Some(v) = get("UI_UPDATE_INTERVAL") {
            self.intervals.ui_secs = v
                .trim()
                .parse()
                .with_context(|| format!("UI_UPDATE_INTERVAL: invalid number '{v}'"))?;
        }
        if let Some(v) = get("DB_UPDATE_INTERVAL") {
            self.intervals.db_secs = v
                .trim()
                .parse()
                .with_context(|| format!("DB_UPDATE_INTERVAL: invalid number '{v}'"))?;
        }
        if let Some(v) = get("CSV_LOG_INTERVAL") {
            self.intervals.csv_secs = v
                .trim()
                .parse()
                .with_context(|| format!("CSV_LOG_INTERVAL: invalid number '{v}'"))?;
        }
        if let Some(v) = get("SIMULATION") {
            self.simulation = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Presets from the file in storage form. Only valid after `validate`.
    fn new_presets(&self) -> Result<Vec<NewPreset>> {
        self.presets
            .iter()
            .map(|p| {
                let schedules = p
                    .schedules
                    .iter()
                    .map(|s| {
                        Ok(NewSchedule {
                            start_time: parse_start_time(&s.start_time)?,
                            duration_sec: u64::try_from(s.duration_sec)
                                .context("duration_sec must be positive")?,
                            days: parse_days(&s.days.join(","))?,
                            active: s.active,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(NewPreset {
                    name: p.name.clone(),
                    active: p.active,
                    schedules,
                })
            })
            .collect()
    }
}

#[cfg(feature = "gpio")]
fn hardware_port(metric: Metric, e: &SensorEntry) -> Box<dyn SensorPort> {
    use crate::sensor::mcp3008::Mcp3008Channel;
    use crate::sensor::UnavailableSensor;

    match e.driver {
        Driver::Iio => Box::new(IioSensor::new(e.path.clone().unwrap_or_default(), e.scale)),
        Driver::Mcp3008 => {
            match Mcp3008Channel::new(e.channel.unwrap_or_default(), e.raw_low, e.raw_high) {
                Ok(ch) => Box::new(ch),
                Err(err) => {
                    tracing::warn!(metric = %metric, "mcp3008 unavailable: {err:#}");
                    Box::new(UnavailableSensor::new(format!("mcp3008: {err}")))
                }
            }
        }
        Driver::Simulated => Box::new(crate::sensor::sim::SimulatedSensor::new(metric)),
    }
}

#[cfg(not(feature = "gpio"))]
fn hardware_port(metric: Metric, e: &SensorEntry) -> Box<dyn SensorPort> {
    use crate::sensor::UnavailableSensor;

    match e.driver {
        Driver::Iio => Box::new(IioSensor::new(e.path.clone().unwrap_or_default(), e.scale)),
        Driver::Mcp3008 => {
            tracing::warn!(metric = %metric, "mcp3008 driver needs the `gpio` feature");
            Box::new(UnavailableSensor::new("built without gpio support"))
        }
        Driver::Simulated => Box::new(crate::sensor::sim::SimulatedSensor::new(metric)),
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, override and validate a TOML config file. A missing file
/// yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_overrides(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed presets from the config into an empty database. Presets already in
/// the database are the source of truth and are never overwritten.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let existing = db.preset_count().await?;
    if existing > 0 {
        tracing::info!(existing, "presets already present, skipping seed");
        return Ok(());
    }

    for p in config.new_presets()? {
        db.insert_preset(&p)
            .await
            .with_context(|| format!("failed to seed preset '{}'", p.name))?;
    }

    tracing::info!(presets = config.presets.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
