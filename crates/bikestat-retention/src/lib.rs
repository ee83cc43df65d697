//! Background garbage collection of records older than the retention horizon.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bikestat_storage::{Store, StoreError};
use chrono::{DateTime, Months, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetentionError {
    #[error("invalid retention horizon `{0}`, expected e.g. `1 month` or `12h`")]
    InvalidHorizon(String),
    #[error("invalid value for {name}: `{value}`")]
    InvalidSetting { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionHorizon {
    pub amount: u32,
    pub unit: HorizonUnit,
}

impl RetentionHorizon {
    pub fn new(amount: u32, unit: HorizonUnit) -> Self {
        Self { amount, unit }
    }

    /// Oldest instant still retained at `now`. Months are calendar months,
    /// clamped to the end of shorter months.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let amount = i64::from(self.amount);
        let shifted = match self.unit {
            HorizonUnit::Minutes => now.checked_sub_signed(chrono::Duration::minutes(amount)),
            HorizonUnit::Hours => now.checked_sub_signed(chrono::Duration::hours(amount)),
            HorizonUnit::Days => now.checked_sub_signed(chrono::Duration::days(amount)),
            HorizonUnit::Weeks => now.checked_sub_signed(chrono::Duration::weeks(amount)),
            HorizonUnit::Months => now.checked_sub_months(Months::new(self.amount)),
        };
        shifted.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl FromStr for RetentionHorizon {
    type Err = RetentionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || RetentionError::InvalidHorizon(raw.to_string());
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = trimmed.split_at(split);
        let amount = digits.parse::<u32>().map_err(|_| invalid())?;
        let unit = match unit.trim().to_ascii_lowercase().as_str() {
            "m" | "min" | "mins" | "minute" | "minutes" => HorizonUnit::Minutes,
            "h" | "hour" | "hours" => HorizonUnit::Hours,
            "d" | "day" | "days" => HorizonUnit::Days,
            "w" | "week" | "weeks" => HorizonUnit::Weeks,
            "month" | "months" => HorizonUnit::Months,
            _ => return Err(invalid()),
        };
        Ok(Self { amount, unit })
    }
}

impl fmt::Display for RetentionHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            HorizonUnit::Minutes => "minute",
            HorizonUnit::Hours => "hour",
            HorizonUnit::Days => "day",
            HorizonUnit::Weeks => "week",
            HorizonUnit::Months => "month",
        };
        let plural = if self.amount == 1 { "" } else { "s" };
        write!(f, "{} {unit}{plural}", self.amount)
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub retention: RetentionHorizon,
    pub interval: Duration,
    pub batch_size: u32,
    pub batch_interval: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: RetentionHorizon::new(1, HorizonUnit::Months),
            interval: Duration::from_secs(3600),
            batch_size: 1000,
            batch_interval: None,
        }
    }
}

impl RetentionConfig {
    pub fn from_env() -> Result<Self, RetentionError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: std::env::var("GC_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(defaults.enabled),
            retention: match std::env::var("GC_RETENTION") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.retention,
            },
            interval: env_parsed("GC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            batch_size: env_parsed::<u32>("GC_BATCH_SIZE")?
                .map(|n| n.max(1))
                .unwrap_or(defaults.batch_size),
            batch_interval: env_parsed("GC_BATCH_INTERVAL_MS")?.map(Duration::from_millis),
        })
    }
}

fn env_parsed<T: FromStr>(name: &'static str) -> Result<Option<T>, RetentionError> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RetentionError::InvalidSetting { name, value }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub cutoff: DateTime<Utc>,
    pub backlog: u64,
    pub deleted: u64,
    pub cancelled: bool,
}

pub struct RetentionCollector {
    store: Store,
    config: RetentionConfig,
}

impl RetentionCollector {
    /// `store` should be a handle of its own: the collector closes it when
    /// it stops. A batch size of zero is raised to one.
    pub fn new(store: Store, mut config: RetentionConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        Self { store, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<CycleReport, StoreError> {
        let cutoff = self.config.retention.cutoff(now);
        let backlog = self.store.count_older_than(cutoff).await?;
        let mut report = CycleReport {
            cutoff,
            backlog,
            deleted: 0,
            cancelled: false,
        };
        if backlog == 0 {
            debug!(%cutoff, "nothing to collect");
            return Ok(report);
        }
        info!(%cutoff, backlog, retention = %self.config.retention, "collecting expired records");

        loop {
            if *stop.borrow() {
                report.cancelled = true;
                break;
            }

            let deleted = self
                .store
                .delete_oldest_before(cutoff, self.config.batch_size)
                .await?;
            if deleted == 0 {
                break;
            }
            report.deleted += deleted;
            let progress = report.deleted as f64 * 100.0 / backlog.max(1) as f64;
            info!(
                deleted = report.deleted,
                backlog,
                "collected {:.1}% of expired records",
                progress.min(100.0)
            );

            if let Some(pause) = self.config.batch_interval {
                if !wait_or_stop(pause, stop).await {
                    report.cancelled = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            retention = %self.config.retention,
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "retention collector started"
        );
        loop {
            if *stop.borrow() {
                break;
            }
            match self.run_cycle_at(Utc::now(), &mut stop).await {
                Ok(report) if report.cancelled => break,
                Ok(report) if report.deleted > 0 => {
                    info!(
                        deleted = report.deleted,
                        cutoff = %report.cutoff,
                        "collection cycle finished"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "collection cycle abandoned"),
            }
            if !wait_or_stop(self.config.interval, &mut stop).await {
                break;
            }
        }
        self.store.close().await;
        info!("retention collector stopped");
    }

    pub fn spawn(self) -> CollectorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        CollectorHandle { stop_tx, task }
    }
}

async fn wait_or_stop(pause: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        changed = stop.changed() => {
            if changed.is_err() {
                return false;
            }
        }
    }
    !*stop.borrow()
}

pub struct CollectorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.task.await {
            warn!(error = %err, "retention collector task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
