//! Time-of-day scheduler: starts the pump when a schedule of the active
//! preset reaches its start minute.
//!
//! Each (schedule, date, minute) fires at most once, however often the
//! scheduler ticks within that minute. The fired set is cleared when the
//! date changes and is held in memory only, so a restart inside a start
//! minute can fire that schedule again.
//!
//! The scheduler never preempts: if the pump is running for any owner when
//! a schedule matches, the tick is skipped.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::pump::{Owner, PumpController};
use crate::store::PresetStore;

/// What a single tick did. Returned for tests and debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    PumpBusy,
    NoActivePreset,
    StoreUnavailable,
    NothingDue,
    Fired { schedule_id: i64 },
    /// A schedule was due but the pump was taken between the busy check
    /// and the start.
    Rejected { schedule_id: i64 },
}

pub struct Scheduler {
    pump: Arc<PumpController>,
    presets: Arc<dyn PresetStore>,
    /// (schedule id, date, minute of day)
    fired: HashSet<(i64, NaiveDate, u32)>,
    fired_on: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(pump: Arc<PumpController>, presets: Arc<dyn PresetStore>) -> Self {
        Self {
            pump,
            presets,
            fired: HashSet::new(),
            fired_on: None,
        }
    }

    /// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, interval: Duration, running: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(tick_sec = interval.as_secs(), "scheduler started");

        loop {
            ticker.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let outcome = self.tick(Local::now().naive_local()).await;
            debug!(?outcome, "scheduler tick");
        }

        info!("scheduler stopped");
    }

    pub async fn tick(&mut self, now: NaiveDateTime) -> TickOutcome {
        let today = now.date();
        if self.fired_on != Some(today) {
            self.fired.clear();
            self.fired_on = Some(today);
        }

        if self.pump.is_running().await {
            return TickOutcome::PumpBusy;
        }

        let preset = match self.presets.active_preset().await {
            Ok(Some(p)) => p,
            Ok(None) => return TickOutcome::NoActivePreset,
            Err(e) => {
                error!("scheduler: active_preset failed: {e:#}");
                return TickOutcome::StoreUnavailable;
            }
        };

        let minute = now.hour() * 60 + now.minute();

        for schedule in preset.schedules.iter().filter(|s| s.matches(now)) {
            if !self.fired.insert((schedule.id, today, minute)) {
                continue;
            }

            info!(
                preset = %preset.name,
                schedule_id = schedule.id,
                duration_sec = schedule.duration_sec,
                "scheduler: schedule due, starting pump"
            );

            let owner = Owner::Schedule {
                schedule_id: schedule.id,
                preset_id: preset.id,
            };
            let duration = Duration::from_secs(schedule.duration_sec);

            // First due schedule wins this tick.
            return match self
                .pump
                .start_preset(owner, Some(duration), preset.name.clone())
                .await
            {
                Ok(_) => TickOutcome::Fired {
                    schedule_id: schedule.id,
                },
                Err(e) => {
                    warn!(schedule_id = schedule.id, "scheduler: {e}");
                    TickOutcome::Rejected {
                        schedule_id: schedule.id,
                    }
                }
            };
        }

        TickOutcome::NothingDue
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use crate::relay::PumpRelay;
    use crate::store::testing::{preset, schedule, MemoryStore};
    use crate::store::{LogAction, Preset};
    use chrono::{Datelike, Weekday};
    use tokio::time::sleep;

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        // June 2024; the 3rd is a Monday.
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn setup(presets: Vec<Preset>) -> (Scheduler, Arc<PumpController>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_presets(presets));
        let pump = Arc::new(PumpController::new(
            PumpRelay::new(21, true).unwrap(),
            store.clone(),
            Arc::new(ChannelNotifier::new()),
        ));
        let scheduler = Scheduler::new(pump.clone(), store.clone());
        (scheduler, pump, store)
    }

    fn morning_preset() -> Preset {
        preset(1, "Morning", true, vec![schedule(10, 1, "08:00", 120)])
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_minute_however_often_it_ticks() {
        let (mut sched, pump, store) = setup(vec![morning_preset()]);

        let mut fired = 0;
        for s in 0..60 {
            if let TickOutcome::Fired { .. } = sched.tick(at(3, 8, 0, s)).await {
                fired += 1;
                // Release the pump so the busy check cannot mask a re-fire.
                pump.stop().await.unwrap();
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(store.logs_with(LogAction::Start).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_again_the_next_day() {
        let (mut sched, pump, _store) = setup(vec![morning_preset()]);

        assert_eq!(
            sched.tick(at(3, 8, 0, 5)).await,
            TickOutcome::Fired { schedule_id: 10 }
        );
        pump.stop().await.unwrap();
        assert_eq!(sched.tick(at(3, 8, 0, 40)).await, TickOutcome::NothingDue);

        assert_eq!(
            sched.tick(at(4, 8, 0, 5)).await,
            TickOutcome::Fired { schedule_id: 10 }
        );
        // Rollover dropped the previous day's keys.
        assert!(sched.fired.iter().all(|(_, d, _)| d.day() == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn yields_to_manual_run() {
        let (mut sched, pump, store) = setup(vec![morning_preset()]);
        pump.start(Owner::Manual, None).await.unwrap();

        assert_eq!(sched.tick(at(3, 8, 0, 0)).await, TickOutcome::PumpBusy);

        let status = pump.status().await;
        assert_eq!(status.owner, Some(Owner::Manual));
        assert_eq!(store.logs_with(LogAction::Start).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_active_preset_skips() {
        let mut p = morning_preset();
        p.active = false;
        let (mut sched, pump, _store) = setup(vec![p]);
        assert_eq!(sched.tick(at(3, 8, 0, 0)).await, TickOutcome::NoActivePreset);
        assert!(!pump.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_minute_or_day_does_not_fire() {
        let mut s = schedule(10, 1, "08:00", 120);
        s.days = vec![Weekday::Tue];
        let (mut sched, _pump, _store) = setup(vec![preset(1, "Tue", true, vec![s])]);

        // Monday
        assert_eq!(sched.tick(at(3, 8, 0, 0)).await, TickOutcome::NothingDue);
        // Tuesday, a minute late
        assert_eq!(sched.tick(at(4, 8, 1, 0)).await, TickOutcome::NothingDue);
        assert_eq!(
            sched.tick(at(4, 8, 0, 30)).await,
            TickOutcome::Fired { schedule_id: 10 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_schedule_wins() {
        let p = preset(
            1,
            "Double",
            true,
            vec![schedule(21, 1, "06:00", 30), schedule(22, 1, "06:00", 45)],
        );
        let (mut sched, pump, _store) = setup(vec![p]);

        assert_eq!(
            sched.tick(at(3, 6, 0, 0)).await,
            TickOutcome::Fired { schedule_id: 21 }
        );
        assert_eq!(
            pump.status().await.owner,
            Some(Owner::Schedule {
                schedule_id: 21,
                preset_id: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_schedule_is_ignored() {
        let mut off = schedule(31, 1, "07:00", 60);
        off.active = false;
        let (mut sched, _pump, _store) = setup(vec![preset(1, "P", true, vec![off])]);
        assert_eq!(sched.tick(at(3, 7, 0, 0)).await, TickOutcome::NothingDue);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_run_auto_stops_with_one_stop_entry() {
        let now = Local::now().naive_local();
        let start = format!("{:02}:{:02}", now.hour(), now.minute());
        let mut s = schedule(40, 7, &start, 5);
        s.days = vec![now.weekday()];
        let (mut sched, pump, store) = setup(vec![preset(7, "A", true, vec![s])]);

        assert_eq!(
            sched.tick(now).await,
            TickOutcome::Fired { schedule_id: 40 }
        );
        let status = pump.status().await;
        assert!(status.running);
        assert_eq!(status.owner.map(|o| o.to_string()), Some("schedule:40".into()));

        sleep(Duration::from_secs(6)).await;
        assert!(!pump.status().await.running);

        let stops = store.logs_with(LogAction::Stop);
        assert_eq!(stops.len(), 1);
        let d = stops[0].duration_sec.unwrap();
        assert!((d - 5.0).abs() < 0.5, "got {d}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_exits_when_flag_cleared() {
        let (sched, _pump, _store) = setup(vec![]);
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(sched.run(Duration::from_secs(60), running.clone()));

        sleep(Duration::from_secs(90)).await;
        running.store(false, Ordering::Relaxed);
        sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn no_run_starts_after_shutdown() {
        let now = Local::now().naive_local();
        let start = format!("{:02}:{:02}", now.hour(), now.minute());
        let (sched, pump, store) = setup(vec![preset(7, "A", true, vec![schedule(40, 7, &start, 300)])]);

        // The first tick is immediate and finds the pump busy.
        pump.start(Owner::Manual, None).await.unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(sched.run(Duration::from_secs(60), running.clone()));
        sleep(Duration::from_secs(1)).await;

        running.store(false, Ordering::Relaxed);
        pump.stop().await.unwrap();
        sleep(Duration::from_secs(61)).await;

        assert!(handle.is_finished());
        assert!(!pump.is_running().await);
        assert_eq!(store.logs_with(LogAction::Start).len(), 1);
    }
}
