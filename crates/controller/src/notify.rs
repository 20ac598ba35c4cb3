//! Outbound notifications for UI/telemetry observers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::pump::PumpStatus;
use crate::readings::{Metric, SensorStatus, Snapshot, SnapshotRecord};
use crate::store::{IrrigationLogEntry, Preset};

/// Capacity of the in-process broadcast channel. Slow subscribers lag and
/// skip messages rather than blocking publishers.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Notification {
    SensorUpdate(Snapshot),
    SensorStatusUpdate(BTreeMap<Metric, SensorStatus>),
    /// A snapshot row was durably stored.
    WeatherUpdate(SnapshotRecord),
    PumpStatus(PumpStatus),
    ScheduleUpdated(ScheduleUpdate),
    PresetActivated { id: i64, name: String },
    /// The preset driving the pump; both fields are null once its run ends.
    RunningPreset { id: Option<i64>, name: Option<String> },
    /// Reply to a preset list query.
    PresetList(Vec<Preset>),
    /// Reply to a history query, newest first.
    IrrigationHistory(Vec<IrrigationLogEntry>),
}

impl Notification {
    /// Event name, also used as the MQTT topic suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SensorUpdate(_) => "sensor_update",
            Notification::SensorStatusUpdate(_) => "sensor_status_update",
            Notification::WeatherUpdate(_) => "weather_update",
            Notification::PumpStatus(_) => "pump_status",
            Notification::ScheduleUpdated(_) => "schedule_updated",
            Notification::PresetActivated { .. } => "preset_activated",
            Notification::RunningPreset { .. } => "running_preset",
            Notification::PresetList(_) => "preset_list",
            Notification::IrrigationHistory(_) => "irrigation_history",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleUpdate {
    pub schedule_id: i64,
    pub preset_id: i64,
    pub running: bool,
}

/// Sink for notifications. `notify` must not block: callers include the
/// pump controller and the broadcast loop.
pub trait Notifier: Send + Sync {
    fn notify(&self, note: Notification);
}

pub type SharedNotifier = Arc<dyn Notifier>;

// ---------------------------------------------------------------------------
// In-process broadcast channel
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, note: Notification) {
        // Err only means nobody is subscribed right now.
        let _ = self.tx.send(note);
    }
}

/// Trace every event on the in-process channel at debug level. Returns the
/// number of events seen once the channel closes.
pub async fn log_events(mut rx: broadcast::Receiver<Notification>) -> u64 {
    let mut seen = 0;
    loop {
        match rx.recv().await {
            Ok(note) => {
                seen += 1;
                debug!(event = note.kind(), "notification");
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "notification log lagging"),
            Err(RecvError::Closed) => return seen,
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

pub struct Fanout {
    sinks: Vec<SharedNotifier>,
}

impl Fanout {
    pub fn new(sinks: Vec<SharedNotifier>) -> Self {
        Self { sinks }
    }
}

impl Notifier for Fanout {
    fn notify(&self, note: Notification) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.notify(note.clone());
            }
            last.notify(note);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
