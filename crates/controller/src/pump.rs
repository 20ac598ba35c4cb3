//! Exclusive ownership of the single water pump.
//!
//! ```text
//! Idle ──start(owner)──▶ Running(owner) ──stop / auto-stop──▶ Idle
//! ```
//!
//! All state changes happen under one lock. The relay is switched under
//! the lock; log writes and notifications happen after it is released.
//! A second lock, taken before the state lock is dropped, hands out log
//! turns in transition order, so a stop entry is never stored ahead of the
//! start it ends.
//! A run started with a duration gets a deferred stop bound to that run's
//! id, so a timer left over from an earlier run can never stop a later one.

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::notify::{Notification, ScheduleUpdate, SharedNotifier};
use crate::relay::PumpRelay;
use crate::store::{IrrigationLogEntry, LogAction, Persistence};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Manual,
    Schedule { schedule_id: i64, preset_id: i64 },
}

impl Owner {
    fn preset_id(&self) -> Option<i64> {
        match self {
            Owner::Manual => None,
            Owner::Schedule { preset_id, .. } => Some(*preset_id),
        }
    }

    fn schedule_id(&self) -> Option<i64> {
        match self {
            Owner::Manual => None,
            Owner::Schedule { schedule_id, .. } => Some(*schedule_id),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Manual => f.write_str("manual"),
            Owner::Schedule { schedule_id, .. } => write!(f, "schedule:{schedule_id}"),
        }
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Non-fatal outcome of a rejected `start`/`stop`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PumpConflict {
    #[error("pump already running (owner: {owner})")]
    AlreadyRunning { owner: Owner },
    #[error("pump is not running")]
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpStatus {
    pub running: bool,
    pub owner: Option<Owner>,
    pub start_time: Option<DateTime<Local>>,
    pub elapsed_sec: Option<f64>,
    /// Nominal run length requested at start, if any.
    pub duration_sec: Option<u64>,
}

impl PumpStatus {
    fn idle() -> Self {
        Self {
            running: false,
            owner: None,
            start_time: None,
            elapsed_sec: None,
            duration_sec: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoppedRun {
    pub owner: Owner,
    /// Measured run time.
    pub duration_sec: f64,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ActiveRun {
    id: u64,
    owner: Owner,
    started_at: DateTime<Local>,
    started: Instant,
    duration: Option<Duration>,
    auto_stop: Option<AbortHandle>,
    /// Started on behalf of a named preset; its end clears `running_preset`.
    announced: bool,
}

impl ActiveRun {
    fn status(&self) -> PumpStatus {
        PumpStatus {
            running: true,
            owner: Some(self.owner),
            start_time: Some(self.started_at),
            elapsed_sec: Some(self.started.elapsed().as_secs_f64()),
            duration_sec: self.duration.map(|d| d.as_secs()),
        }
    }
}

struct PumpState {
    relay: PumpRelay,
    active: Option<ActiveRun>,
    next_run_id: u64,
}

pub struct PumpController {
    state: Mutex<PumpState>,
    /// Serializes log writes in transition order.
    log_order: Mutex<()>,
    store: Arc<dyn Persistence>,
    notifier: SharedNotifier,
}

impl PumpController {
    pub fn new(relay: PumpRelay, store: Arc<dyn Persistence>, notifier: SharedNotifier) -> Self {
        Self {
            state: Mutex::new(PumpState {
                relay,
                active: None,
                next_run_id: 1,
            }),
            log_order: Mutex::new(()),
            store,
            notifier,
        }
    }

    /// Acquire the pump for `owner`. A zero duration is treated as "run
    /// until stopped".
    pub async fn start(
        self: &Arc<Self>,
        owner: Owner,
        duration: Option<Duration>,
    ) -> Result<PumpStatus, PumpConflict> {
        self.start_run(owner, duration, None).await
    }

    /// Like [`start`](Self::start) for a preset-driven run, additionally
    /// announcing `running_preset` at start and end.
    pub async fn start_preset(
        self: &Arc<Self>,
        owner: Owner,
        duration: Option<Duration>,
        preset_name: impl Into<String>,
    ) -> Result<PumpStatus, PumpConflict> {
        self.start_run(owner, duration, Some(preset_name.into())).await
    }

    async fn start_run(
        self: &Arc<Self>,
        owner: Owner,
        duration: Option<Duration>,
        preset_name: Option<String>,
    ) -> Result<PumpStatus, PumpConflict> {
        let announce = preset_name.zip(owner.preset_id());
        let duration = duration.filter(|d| !d.is_zero());

        let (run_id, status, log_turn) = {
            let mut st = self.state.lock().await;
            if let Some(run) = &st.active {
                warn!(
                    requested_by = %owner,
                    owner = %run.owner,
                    "pump start rejected: already running"
                );
                return Err(PumpConflict::AlreadyRunning { owner: run.owner });
            }

            st.relay.set(true);
            let run = ActiveRun {
                id: st.next_run_id,
                owner,
                started_at: Local::now(),
                started: Instant::now(),
                duration,
                auto_stop: None,
                announced: announce.is_some(),
            };
            st.next_run_id += 1;
            let (id, status) = (run.id, run.status());
            st.active = Some(run);
            (id, status, self.log_order.lock().await)
        };

        info!(
            owner = %owner,
            duration_sec = ?duration.map(|d| d.as_secs()),
            "pump started"
        );

        self.record(LogAction::Start, owner, None, status.start_time)
            .await;
        drop(log_turn);
        self.notifier.notify(Notification::PumpStatus(status.clone()));
        self.notify_schedule(owner, true);
        if let Some((name, id)) = announce {
            self.notifier.notify(Notification::RunningPreset {
                id: Some(id),
                name: Some(name),
            });
        }

        if let Some(d) = duration {
            let this = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(d).await;
                // Err here means the run already ended some other way.
                let _ = this.finish(Some(run_id), true).await;
            });

            let mut st = self.state.lock().await;
            match st.active.as_mut() {
                Some(run) if run.id == run_id => run.auto_stop = Some(timer.abort_handle()),
                _ => timer.abort(),
            }
        }

        Ok(status)
    }

    /// Release the pump regardless of owner.
    pub async fn stop(&self) -> Result<StoppedRun, PumpConflict> {
        self.finish(None, false).await
    }

    pub async fn status(&self) -> PumpStatus {
        let st = self.state.lock().await;
        st.active
            .as_ref()
            .map(ActiveRun::status)
            .unwrap_or_else(PumpStatus::idle)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// End the current run. With `expected` set, only the run with that id
    /// is stopped. `from_timer` marks the auto-stop task calling itself,
    /// which must not abort its own handle mid-flight.
    async fn finish(&self, expected: Option<u64>, from_timer: bool) -> Result<StoppedRun, PumpConflict> {
        let (run, log_turn) = {
            let mut st = self.state.lock().await;
            let run = match st.active.take() {
                Some(run) if expected.map_or(true, |id| id == run.id) => run,
                other => {
                    st.active = other;
                    return Err(PumpConflict::NotRunning);
                }
            };
            st.relay.set(false);
            (run, self.log_order.lock().await)
        };

        if !from_timer {
            if let Some(handle) = &run.auto_stop {
                handle.abort();
            }
        }

        let duration_sec = run.started.elapsed().as_secs_f64();
        info!(
            owner = %run.owner,
            duration_sec = format!("{duration_sec:.1}"),
            auto = from_timer,
            "pump stopped"
        );

        self.record(LogAction::Stop, run.owner, Some(duration_sec), None)
            .await;
        drop(log_turn);
        self.notifier
            .notify(Notification::PumpStatus(PumpStatus::idle()));
        self.notify_schedule(run.owner, false);
        if run.announced {
            self.notifier
                .notify(Notification::RunningPreset { id: None, name: None });
        }

        Ok(StoppedRun {
            owner: run.owner,
            duration_sec,
        })
    }

    async fn record(
        &self,
        action: LogAction,
        owner: Owner,
        duration_sec: Option<f64>,
        at: Option<DateTime<Local>>,
    ) {
        let entry = IrrigationLogEntry {
            action,
            preset_id: owner.preset_id(),
            schedule_id: owner.schedule_id(),
            duration_sec,
            timestamp: at.unwrap_or_else(Local::now),
        };
        if let Err(e) = self.store.insert_irrigation_log(&entry).await {
            error!(%action, owner = %owner, "failed to write irrigation log: {e:#}");
        }
    }

    fn notify_schedule(&self, owner: Owner, running: bool) {
        if let Owner::Schedule {
            schedule_id,
            preset_id,
        } = owner
        {
            self.notifier
                .notify(Notification::ScheduleUpdated(ScheduleUpdate {
                    schedule_id,
                    preset_id,
                    running,
                }));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
