//! Persistence and preset collaborators consumed by the controller core.
//! The SQLite implementation lives in `db`; tests use
//! [`testing::MemoryStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::Serialize;
use std::fmt;

use crate::readings::SnapshotRecord;

// ---------------------------------------------------------------------------
// Presets & schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preset {
    pub id: i64,
    pub name: String,
    pub active: bool,
    /// Ordered by start time, then id.
    pub schedules: Vec<Schedule>,
}

impl Preset {
    /// The schedule a manual "run this preset now" should use.
    pub fn first_active_schedule(&self) -> Option<&Schedule> {
        self.schedules
            .iter()
            .filter(|s| s.active)
            .min_by_key(|s| (s.start_time, s.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    pub id: i64,
    pub preset_id: i64,
    /// Wall-clock time of day; only hour and minute are significant.
    pub start_time: NaiveTime,
    pub duration_sec: u64,
    /// Empty means every day.
    pub days: Vec<Weekday>,
    pub active: bool,
}

impl Schedule {
    pub fn runs_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    /// True when `now` falls in this schedule's start minute on one of its
    /// days.
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        self.active
            && self.runs_on(now.weekday())
            && now.hour() == self.start_time.hour()
            && now.minute() == self.start_time.minute()
    }
}

/// A preset as supplied by configuration, before it has ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPreset {
    pub name: String,
    pub active: bool,
    pub schedules: Vec<NewSchedule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub start_time: NaiveTime,
    pub duration_sec: u64,
    pub days: Vec<Weekday>,
    pub active: bool,
}

/// Parse `"HH:MM"`.
pub fn parse_start_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("invalid start time '{s}' (expected HH:MM)"))
}

/// Parse a comma-separated weekday list (`"Mon,Wed,Fri"`, case-insensitive,
/// full names accepted). An empty string yields an empty list.
pub fn parse_days(s: &str) -> Result<Vec<Weekday>> {
    s.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<Weekday>()
                .map_err(|_| anyhow::anyhow!("invalid weekday '{d}'"))
        })
        .collect()
}

pub fn format_days(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Irrigation log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Start,
    Stop,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Start => "start",
            LogAction::Stop => "stop",
        }
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationLogEntry {
    pub action: LogAction,
    pub preset_id: Option<i64>,
    pub schedule_id: Option<i64>,
    /// Measured run time; only set on `stop`.
    pub duration_sec: Option<f64>,
    pub timestamp: DateTime<Local>,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Durable sink for snapshots and pump transitions.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    async fn insert_irrigation_log(&self, entry: &IrrigationLogEntry) -> Result<()>;

    /// Irrigation history, newest first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<IrrigationLogEntry>>;
}

/// Read access to presets plus the single mutation the core performs.
#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn list_presets(&self) -> Result<Vec<Preset>>;

    async fn get_preset(&self, id: i64) -> Result<Option<Preset>>;

    async fn active_preset(&self) -> Result<Option<Preset>>;

    /// Deactivate every preset, then activate `id`. Returns `None` (and
    /// changes nothing) if `id` does not exist.
    async fn activate_preset(&self, id: i64) -> Result<Option<Preset>>;
}

// ---------------------------------------------------------------------------
// In-memory store for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        snapshots: Mutex<Vec<SnapshotRecord>>,
        logs: Mutex<Vec<IrrigationLogEntry>>,
        presets: Mutex<Vec<Preset>>,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_presets(presets: Vec<Preset>) -> Self {
            let store = Self::default();
            *store.presets.lock().unwrap() = presets;
            store
        }

        pub fn snapshots(&self) -> Vec<SnapshotRecord> {
            self.snapshots.lock().unwrap().clone()
        }

        pub fn logs(&self) -> Vec<IrrigationLogEntry> {
            self.logs.lock().unwrap().clone()
        }

        pub fn logs_with(&self, action: LogAction) -> Vec<IrrigationLogEntry> {
            self.logs()
                .into_iter()
                .filter(|l| l.action == action)
                .collect()
        }

        /// Make every subsequent write fail until reset.
        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        fn check_writable(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("store unavailable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Persistence for MemoryStore {
        async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
            self.check_writable()?;
            self.snapshots.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn insert_irrigation_log(&self, entry: &IrrigationLogEntry) -> Result<()> {
            self.check_writable()?;
            self.logs.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn recent_logs(&self, limit: usize) -> Result<Vec<IrrigationLogEntry>> {
            Ok(self.logs().into_iter().rev().take(limit).collect())
        }
    }

    #[async_trait]
    impl PresetStore for MemoryStore {
        async fn list_presets(&self) -> Result<Vec<Preset>> {
            Ok(self.presets.lock().unwrap().clone())
        }

        async fn get_preset(&self, id: i64) -> Result<Option<Preset>> {
            Ok(self
                .presets
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .cloned())
        }

        async fn active_preset(&self) -> Result<Option<Preset>> {
            Ok(self
                .presets
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.active)
                .cloned())
        }

        async fn activate_preset(&self, id: i64) -> Result<Option<Preset>> {
            let mut presets = self.presets.lock().unwrap();
            if !presets.iter().any(|p| p.id == id) {
                return Ok(None);
            }
            for p in presets.iter_mut() {
                p.active = p.id == id;
            }
            Ok(presets.iter().find(|p| p.id == id).cloned())
        }
    }

    pub fn schedule(id: i64, preset_id: i64, start: &str, duration_sec: u64) -> Schedule {
        Schedule {
            id,
            preset_id,
            start_time: parse_start_time(start).unwrap(),
            duration_sec,
            days: Vec::new(),
            active: true,
        }
    }

    pub fn preset(id: i64, name: &str, active: bool, schedules: Vec<Schedule>) -> Preset {
        Preset {
            id,
            name: name.into(),
            active,
            schedules,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    // -- Schedule matching ------------------------------------------------

    #[test]
    fn matches_whole_start_minute() {
        let s = schedule(1, 1, "08:00", 120);
        assert!(s.matches(at(2024, 6, 3, 8, 0, 0)));
        assert!(s.matches(at(2024, 6, 3, 8, 0, 59)));
        assert!(!s.matches(at(2024, 6, 3, 8, 1, 0)));
        assert!(!s.matches(at(2024, 6, 3, 7, 59, 59)));
    }

    #[test]
    fn matches_respects_days() {
        let mut s = schedule(1, 1, "06:30", 60);
        s.days = vec![Weekday::Mon, Weekday::Thu];
        // 2024-06-03 is a Monday.
        assert!(s.matches(at(2024, 6, 3, 6, 30, 0)));
        assert!(!s.matches(at(2024, 6, 4, 6, 30, 0)));
        assert!(s.matches(at(2024, 6, 6, 6, 30, 0)));
    }

    #[test]
    fn inactive_schedule_never_matches() {
        let mut s = schedule(1, 1, "08:00", 120);
        s.active = false;
        assert!(!s.matches(at(2024, 6, 3, 8, 0, 0)));
    }

    #[test]
    fn first_active_schedule_orders_by_start_time() {
        let mut early = schedule(7, 1, "05:45", 30);
        early.active = false;
        let p = preset(
            1,
            "Summer",
            true,
            vec![
                schedule(3, 1, "19:00", 300),
                early,
                schedule(5, 1, "06:00", 600),
            ],
        );
        assert_eq!(p.first_active_schedule().map(|s| s.id), Some(5));
    }

    #[test]
    fn first_active_schedule_none_when_all_inactive() {
        let mut s = schedule(1, 1, "08:00", 60);
        s.active = false;
        assert!(preset(1, "Off", false, vec![s])
            .first_active_schedule()
            .is_none());
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_start_time_hh_mm() {
        let t = parse_start_time("07:05").unwrap();
        assert_eq!((t.hour(), t.minute()), (7, 5));
        assert!(parse_start_time("7am").is_err());
        assert!(parse_start_time("25:00").is_err());
    }

    #[test]
    fn parse_days_accepts_short_and_long_names() {
        assert_eq!(
            parse_days("Mon, wednesday,FRI").unwrap(),
            vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]
        );
        assert!(parse_days("").unwrap().is_empty());
        assert!(parse_days("Mon,Funday").is_err());
    }

    #[test]
    fn format_days_round_trips_through_parse() {
        let days = vec![Weekday::Tue, Weekday::Sat];
        assert_eq!(format_days(&days), "Tue,Sat");
        assert_eq!(parse_days(&format_days(&days)).unwrap(), days);
    }

    // -- MemoryStore ------------------------------------------------------

    #[tokio::test]
    async fn memory_store_activate_is_exclusive() {
        let store = MemoryStore::with_presets(vec![
            preset(1, "A", true, vec![]),
            preset(2, "B", false, vec![]),
        ]);
        let activated = store.activate_preset(2).await.unwrap().unwrap();
        assert_eq!(activated.name, "B");
        let presets = store.list_presets().await.unwrap();
        assert_eq!(presets.iter().filter(|p| p.active).count(), 1);
        assert_eq!(store.active_preset().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn memory_store_activate_unknown_changes_nothing() {
        let store = MemoryStore::with_presets(vec![preset(1, "A", true, vec![])]);
        assert!(store.activate_preset(99).await.unwrap().is_none());
        assert_eq!(store.active_preset().await.unwrap().unwrap().id, 1);
    }
}
