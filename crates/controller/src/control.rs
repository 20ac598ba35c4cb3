//! Operator control surface: manual pump commands, preset selection and
//! read-only queries. Consumed by the MQTT command topics and by any
//! external API layer. Query replies go out as notifications.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::notify::{Notification, SharedNotifier};
use crate::pump::{Owner, PumpConflict, PumpController, PumpStatus, StoppedRun};
use crate::store::{IrrigationLogEntry, Persistence, Preset, PresetStore};

/// History entries returned when a query names no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// A parsed operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the pump, optionally for a fixed number of seconds.
    PumpOn(Option<u64>),
    PumpOff,
    ActivatePreset(i64),
    RunPreset(i64),
    QueryPump,
    ListPresets,
    /// Latest irrigation log entries, at most this many.
    RecentLogs(usize),
}

pub struct Controller {
    pump: Arc<PumpController>,
    presets: Arc<dyn PresetStore>,
    history: Arc<dyn Persistence>,
    notifier: SharedNotifier,
}

impl Controller {
    pub fn new(
        pump: Arc<PumpController>,
        presets: Arc<dyn PresetStore>,
        history: Arc<dyn Persistence>,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            pump,
            presets,
            history,
            notifier,
        }
    }

    pub async fn start_pump(&self, duration_sec: Option<u64>) -> Result<PumpStatus, PumpConflict> {
        self.pump
            .start(Owner::Manual, duration_sec.map(Duration::from_secs))
            .await
    }

    pub async fn stop_pump(&self) -> Result<StoppedRun, PumpConflict> {
        self.pump.stop().await
    }

    pub async fn pump_status(&self) -> PumpStatus {
        self.pump.status().await
    }

    pub async fn list_presets(&self) -> Result<Vec<Preset>> {
        self.presets.list_presets().await
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<IrrigationLogEntry>> {
        self.history.recent_logs(limit).await
    }

    /// Make `id` the only active preset.
    pub async fn activate_preset(&self, id: i64) -> Result<Preset> {
        let preset = self
            .presets
            .activate_preset(id)
            .await?
            .ok_or_else(|| anyhow!("preset {id} not found"))?;

        info!(preset_id = id, name = %preset.name, "preset activated");
        self.notifier.notify(Notification::PresetActivated {
            id: preset.id,
            name: preset.name.clone(),
        });
        Ok(preset)
    }

    /// Run the preset's earliest active schedule now, as that schedule.
    /// Does not preempt a run already in progress.
    pub async fn run_preset(&self, id: i64) -> Result<PumpStatus> {
        let preset = self
            .presets
            .get_preset(id)
            .await?
            .ok_or_else(|| anyhow!("preset {id} not found"))?;
        let schedule = preset
            .first_active_schedule()
            .ok_or_else(|| anyhow!("preset '{}' has no active schedules", preset.name))?;

        let owner = Owner::Schedule {
            schedule_id: schedule.id,
            preset_id: preset.id,
        };
        info!(preset_id = id, schedule_id = schedule.id, "running preset now");
        let status = self
            .pump
            .start_preset(
                owner,
                Some(Duration::from_secs(schedule.duration_sec)),
                preset.name.clone(),
            )
            .await?;
        Ok(status)
    }

    /// Execute `cmd`, logging the outcome. Query results are published
    /// through the notifier. Never fails.
    pub async fn execute(&self, cmd: Command) {
        match cmd {
            Command::PumpOn(secs) => match self.start_pump(secs).await {
                Ok(_) => {}
                Err(e) => warn!("pump on: {e}"),
            },
            Command::PumpOff => match self.stop_pump().await {
                Ok(_) => {}
                Err(e) => warn!("pump off: {e}"),
            },
            Command::ActivatePreset(id) => {
                if let Err(e) = self.activate_preset(id).await {
                    error!(preset_id = id, "activate preset failed: {e:#}");
                }
            }
            Command::RunPreset(id) => {
                if let Err(e) = self.run_preset(id).await {
                    warn!(preset_id = id, "run preset failed: {e:#}");
                }
            }
            Command::QueryPump => {
                let status = self.pump_status().await;
                self.notifier.notify(Notification::PumpStatus(status));
            }
            Command::ListPresets => match self.list_presets().await {
                Ok(presets) => self.notifier.notify(Notification::PresetList(presets)),
                Err(e) => error!("list presets failed: {e:#}"),
            },
            Command::RecentLogs(limit) => match self.recent_logs(limit).await {
                Ok(logs) => self.notifier.notify(Notification::IrrigationHistory(logs)),
                Err(e) => error!(limit, "irrigation history query failed: {e:#}"),
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
