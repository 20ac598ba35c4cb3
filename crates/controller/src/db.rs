use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::readings::SnapshotRecord;
use crate::store::{
    format_days, parse_days, parse_start_time, IrrigationLogEntry, LogAction, NewPreset,
    Persistence, Preset, PresetStore, Schedule,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

type PresetRow = (i64, String, bool);
type ScheduleRow = (i64, i64, String, i64, String, bool);
type LogRow = (i64, String, Option<i64>, Option<i64>, Option<f64>);

fn local_from_unix(ts: i64) -> Result<DateTime<Local>> {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .ok_or_else(|| anyhow!("timestamp {ts} out of range"))
}

fn schedule_from_row(r: ScheduleRow) -> Result<Schedule> {
    let (id, preset_id, start_time, duration_sec, days, active) = r;
    Ok(Schedule {
        id,
        preset_id,
        start_time: parse_start_time(&start_time)
            .with_context(|| format!("schedule {id}: bad start_time"))?,
        duration_sec: u64::try_from(duration_sec)
            .with_context(|| format!("schedule {id}: negative duration"))?,
        days: parse_days(&days).with_context(|| format!("schedule {id}: bad days"))?,
        active,
    })
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" opens its own empty database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Presets
    // ----------------------------

    pub async fn preset_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM presets")
            .fetch_one(&self.pool)
            .await
            .context("preset_count failed")?;
        Ok(n)
    }

    /// Insert a preset and its schedules atomically; returns the new id.
    pub async fn insert_preset(&self, p: &NewPreset) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("insert_preset: begin failed")?;

        let id = sqlx::query("INSERT INTO presets (name, active) VALUES (?, ?)")
            .bind(&p.name)
            .bind(p.active)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert_preset '{}' failed", p.name))?
            .last_insert_rowid();

        for s in &p.schedules {
            sqlx::query(
                r#"
                INSERT INTO schedules (preset_id, start_time, duration_sec, days, active)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(s.start_time.format("%H:%M").to_string())
            .bind(s.duration_sec as i64)
            .bind(format_days(&s.days))
            .bind(s.active)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert schedule for preset '{}' failed", p.name))?;
        }

        tx.commit().await.context("insert_preset: commit failed")?;
        Ok(id)
    }

    async fn schedules_for(&self, preset_id: i64) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, preset_id, start_time, duration_sec, days, active
            FROM schedules
            WHERE preset_id = ?
            ORDER BY start_time, id
            "#,
        )
        .bind(preset_id)
        .fetch_all(&self.pool)
        .await
        .context("schedules_for failed")?;

        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn with_schedules(&self, row: PresetRow) -> Result<Preset> {
        let (id, name, active) = row;
        Ok(Preset {
            id,
            name,
            active,
            schedules: self.schedules_for(id).await?,
        })
    }
}

// ----------------------------
// Collaborator impls
// ----------------------------

#[async_trait]
impl Persistence for Db {
    async fn insert_snapshot(&self, r: &SnapshotRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_snapshots
              (ts, temperature, humidity, soil_moisture, pressure, light, rain)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp.timestamp())
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.soil_moisture)
        .bind(r.pressure)
        .bind(r.light)
        .bind(r.rain)
        .execute(&self.pool)
        .await
        .context("insert_snapshot failed")?;
        Ok(())
    }

    async fn insert_irrigation_log(&self, e: &IrrigationLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_logs (ts, action, preset_id, schedule_id, duration_sec)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.timestamp.timestamp())
        .bind(e.action.as_str())
        .bind(e.preset_id)
        .bind(e.schedule_id)
        .bind(e.duration_sec)
        .execute(&self.pool)
        .await
        .context("insert_irrigation_log failed")?;
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<IrrigationLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT ts, action, preset_id, schedule_id, duration_sec
            FROM irrigation_logs
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("recent_logs failed")?;

        rows.into_iter()
            .map(|(ts, action, preset_id, schedule_id, duration_sec)| {
                let action = match action.as_str() {
                    "start" => LogAction::Start,
                    "stop" => LogAction::Stop,
                    other => return Err(anyhow!("unknown log action '{other}'")),
                };
                Ok(IrrigationLogEntry {
                    action,
                    preset_id,
                    schedule_id,
                    duration_sec,
                    timestamp: local_from_unix(ts)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PresetStore for Db {
    async fn list_presets(&self) -> Result<Vec<Preset>> {
        let rows: Vec<PresetRow> = sqlx::query_as("SELECT id, name, active FROM presets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("list_presets failed")?;

        let mut presets = Vec::with_capacity(rows.len());
        for row in rows {
            presets.push(self.with_schedules(row).await?);
        }
        Ok(presets)
    }

    async fn get_preset(&self, id: i64) -> Result<Option<Preset>> {
        let row: Option<PresetRow> =
            sqlx::query_as("SELECT id, name, active FROM presets WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("get_preset failed")?;

        match row {
            Some(row) => Ok(Some(self.with_schedules(row).await?)),
            None => Ok(None),
        }
    }

    async fn active_preset(&self) -> Result<Option<Preset>> {
        let row: Option<PresetRow> =
            sqlx::query_as("SELECT id, name, active FROM presets WHERE active = 1")
                .fetch_optional(&self.pool)
                .await
                .context("active_preset failed")?;

        match row {
            Some(row) => Ok(Some(self.with_schedules(row).await?)),
            None => Ok(None),
        }
    }

    async fn activate_preset(&self, id: i64) -> Result<Option<Preset>> {
        let mut tx = self.pool.begin().await.context("activate_preset: begin failed")?;

        sqlx::query("UPDATE presets SET active = 0 WHERE active = 1")
            .execute(&mut *tx)
            .await
            .context("activate_preset: deactivate failed")?;

        let updated = sqlx::query("UPDATE presets SET active = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("activate_preset: activate failed")?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await.context("activate_preset: rollback failed")?;
            return Ok(None);
        }
        tx.commit().await.context("activate_preset: commit failed")?;

        self.get_preset(id).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewSchedule;
    use chrono::Weekday;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn new_preset(name: &str, active: bool) -> NewPreset {
        NewPreset {
            name: name.into(),
            active,
            schedules: vec![
                NewSchedule {
                    start_time: parse_start_time("18:30").unwrap(),
                    duration_sec: 300,
                    days: vec![Weekday::Mon, Weekday::Fri],
                    active: true,
                },
                NewSchedule {
                    start_time: parse_start_time("06:00").unwrap(),
                    duration_sec: 120,
                    days: vec![],
                    active: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn insert_and_load_preset_with_ordered_schedules() {
        let db = test_db().await;
        let id = db.insert_preset(&new_preset("Summer", true)).await.unwrap();

        let p = db.get_preset(id).await.unwrap().unwrap();
        assert_eq!(p.name, "Summer");
        assert!(p.active);
        assert_eq!(p.schedules.len(), 2);
        assert_eq!(p.schedules[0].start_time, parse_start_time("06:00").unwrap());
        assert!(p.schedules[0].days.is_empty());
        assert_eq!(p.schedules[1].days, vec![Weekday::Mon, Weekday::Fri]);
        assert_eq!(p.schedules[1].duration_sec, 300);
        assert!(p.schedules.iter().all(|s| s.preset_id == id));
    }

    #[tokio::test]
    async fn get_unknown_preset_is_none() {
        let db = test_db().await;
        assert!(db.get_preset(42).await.unwrap().is_none());
        assert!(db.active_preset().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activate_is_exclusive() {
        let db = test_db().await;
        let a = db.insert_preset(&new_preset("A", true)).await.unwrap();
        let b = db.insert_preset(&new_preset("B", false)).await.unwrap();

        let activated = db.activate_preset(b).await.unwrap().unwrap();
        assert_eq!(activated.id, b);
        assert!(activated.active);

        let presets = db.list_presets().await.unwrap();
        assert_eq!(presets.len(), 2);
        assert_eq!(presets.iter().filter(|p| p.active).count(), 1);
        assert!(!presets.iter().find(|p| p.id == a).unwrap().active);
        assert_eq!(db.active_preset().await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn activate_unknown_rolls_back() {
        let db = test_db().await;
        let a = db.insert_preset(&new_preset("A", true)).await.unwrap();
        assert!(db.activate_preset(999).await.unwrap().is_none());
        assert_eq!(db.active_preset().await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn second_active_preset_violates_index() {
        let db = test_db().await;
        db.insert_preset(&new_preset("A", true)).await.unwrap();
        assert!(db.insert_preset(&new_preset("B", true)).await.is_err());
        // The failed insert left nothing behind.
        assert_eq!(db.preset_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_duration_schedule_rejected() {
        let db = test_db().await;
        let mut p = new_preset("Bad", false);
        p.schedules[0].duration_sec = 0;
        assert!(db.insert_preset(&p).await.is_err());
        assert_eq!(db.preset_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn irrigation_logs_newest_first() {
        let db = test_db().await;
        let t0 = local_from_unix(1_717_400_000).unwrap();
        let t1 = local_from_unix(1_717_400_005).unwrap();

        db.insert_irrigation_log(&IrrigationLogEntry {
            action: LogAction::Start,
            preset_id: Some(1),
            schedule_id: Some(2),
            duration_sec: None,
            timestamp: t0,
        })
        .await
        .unwrap();
        db.insert_irrigation_log(&IrrigationLogEntry {
            action: LogAction::Stop,
            preset_id: Some(1),
            schedule_id: Some(2),
            duration_sec: Some(5.0),
            timestamp: t1,
        })
        .await
        .unwrap();

        let logs = db.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, LogAction::Stop);
        assert_eq!(logs[0].duration_sec, Some(5.0));
        assert_eq!(logs[0].timestamp, t1);
        assert_eq!(logs[1].action, LogAction::Start);
        assert_eq!(logs[1].duration_sec, None);

        assert_eq!(db.recent_logs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_round_trip_keeps_missing_metrics_null() {
        let db = test_db().await;
        let rec = SnapshotRecord {
            temperature: Some(22.5),
            humidity: Some(41.0),
            soil_moisture: None,
            pressure: Some(1009.8),
            light: None,
            rain: Some(0.0),
            timestamp: local_from_unix(1_717_400_000).unwrap(),
        };
        db.insert_snapshot(&rec).await.unwrap();

        let row: (i64, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
            sqlx::query_as(
                "SELECT ts, temperature, soil_moisture, pressure, light, rain FROM sensor_snapshots",
            )
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(
            row,
            (1_717_400_000, Some(22.5), None, Some(1009.8), None, Some(0.0))
        );
    }
}
