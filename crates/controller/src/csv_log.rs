//! Daily CSV sensor log: one file per calendar day under the configured
//! folder, `<YYYY-MM-DD>.csv`, header written once when the file is new.
//!
//! Values outside a metric's configured range are logged as warnings and
//! still written.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::readings::{Metric, SharedCache, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        (self.min..=self.max).contains(&v)
    }

    /// Plausible physical bounds for each metric.
    pub fn default_for(metric: Metric) -> Self {
        match metric {
            Metric::Temperature => Self::new(-10.0, 50.0),
            Metric::Pressure => Self::new(900.0, 1100.0),
            Metric::Humidity | Metric::SoilMoisture | Metric::Light | Metric::Rain => {
                Self::new(0.0, 100.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeWarning {
    pub metric: Metric,
    pub value: f64,
    pub range: ValueRange,
}

struct DailyFile {
    date: NaiveDate,
    writer: csv::Writer<File>,
}

pub struct CsvLogger {
    folder: PathBuf,
    timestamp_format: String,
    ranges: BTreeMap<Metric, ValueRange>,
    current: Option<DailyFile>,
}

impl CsvLogger {
    pub fn new(
        folder: impl Into<PathBuf>,
        timestamp_format: impl Into<String>,
        ranges: BTreeMap<Metric, ValueRange>,
    ) -> Self {
        Self {
            folder: folder.into(),
            timestamp_format: timestamp_format.into(),
            ranges,
            current: None,
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.folder.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    /// Append one row for `snapshot`, rotating to a new file when `now` is on
    /// a different date than the open one.
    pub fn write(&mut self, snapshot: &Snapshot, now: NaiveDateTime) -> Result<Vec<RangeWarning>> {
        let warnings = self.validate(snapshot);

        let mut ts = String::new();
        write!(ts, "{}", now.format(&self.timestamp_format))
            .map_err(|_| anyhow!("invalid timestamp format '{}'", self.timestamp_format))?;

        let mut row = Vec::with_capacity(Metric::ALL.len() + 1);
        row.push(ts);
        row.extend(
            Metric::ALL
                .iter()
                .map(|m| snapshot.value(*m).map(format_value).unwrap_or_default()),
        );

        let file = self.file_for(now.date())?;
        file.writer
            .write_record(&row)
            .context("failed to write csv row")?;
        file.writer.flush().context("failed to flush csv file")?;

        Ok(warnings)
    }

    fn validate(&self, snapshot: &Snapshot) -> Vec<RangeWarning> {
        let mut warnings = Vec::new();
        for metric in Metric::ALL {
            let (Some(value), Some(range)) = (snapshot.value(metric), self.ranges.get(&metric))
            else {
                continue;
            };
            if !range.contains(value) {
                warn!(
                    metric = %metric,
                    value,
                    min = range.min,
                    max = range.max,
                    "reading outside configured range"
                );
                warnings.push(RangeWarning {
                    metric,
                    value,
                    range: *range,
                });
            }
        }
        warnings
    }

    fn file_for(&mut self, date: NaiveDate) -> Result<&mut DailyFile> {
        let stale = self.current.as_ref().map_or(true, |f| f.date != date);
        if stale {
            let path = self.path_for(date);
            let writer = open_daily(&self.folder, &path)?;
            info!(path = %path.display(), "csv log opened");
            self.current = Some(DailyFile { date, writer });
        }
        self.current
            .as_mut()
            .ok_or_else(|| anyhow!("csv file not open"))
    }
}

fn open_daily(folder: &Path, path: &Path) -> Result<csv::Writer<File>> {
    fs::create_dir_all(folder)
        .with_context(|| format!("failed to create csv folder: {}", folder.display()))?;

    let has_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open csv file: {}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if !has_content {
        let mut header = vec!["Timestamp"];
        header.extend(Metric::ALL.iter().map(|m| m.csv_label()));
        writer
            .write_record(&header)
            .context("failed to write csv header")?;
        writer.flush().context("failed to flush csv header")?;
    }
    Ok(writer)
}

/// Two decimals, without trailing zeros (`200.0` → `"200"`).
fn format_value(v: f64) -> String {
    let rounded = (v * 100.0).round() / 100.0;
    format!("{rounded}")
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Write one row per `interval` until `running` is cleared. File I/O runs on
/// the blocking pool.
pub async fn run(mut logger: CsvLogger, cache: SharedCache, interval: Duration, running: Arc<AtomicBool>) {
    info!(
        folder = %logger.folder.display(),
        interval_sec = interval.as_secs(),
        "csv logger started"
    );
    while running.load(Ordering::Relaxed) {
        let snapshot = cache.snapshot().await;
        let now = Local::now().naive_local();

        let job = tokio::task::spawn_blocking(move || {
            let result = logger.write(&snapshot, now);
            (logger, result)
        });
        logger = match job.await {
            Ok((logger, Ok(_warnings))) => logger,
            Ok((logger, Err(e))) => {
                error!("csv log write failed: {e:#}");
                logger
            }
            Err(e) => {
                error!("csv log task failed: {e}");
                return;
            }
        };

        tokio::time::sleep(interval).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
