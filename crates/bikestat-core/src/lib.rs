//! Core domain model for bikestat: network updates, station identity, stored
//! records and the read-side reductions over a station's history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, NaiveDate, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Fixed-width UTC layout used for the `timestamp` column; lexicographic
/// order is chronological order.
pub const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("unsupported aggregation `{0}`")]
    UnsupportedAggregation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkUpdate {
    pub tag: String,
    #[serde(default, deserialize_with = "object_or_null")]
    pub meta: JsonMap,
    #[serde(default)]
    pub stations: Vec<StationSnapshot>,
}

impl NetworkUpdate {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            tag: self.tag.clone(),
            name: self
                .meta
                .get("name")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
            latitude: self.meta.get("latitude").and_then(JsonValue::as_f64),
            longitude: self.meta.get("longitude").and_then(JsonValue::as_f64),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "optional_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub nuid: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub bikes: i64,
    pub free: i64,
    #[serde(default, deserialize_with = "object_or_null")]
    pub extra: JsonMap,
}

impl StationSnapshot {
    pub fn reading(&self) -> Reading {
        Reading {
            bikes: self.bikes,
            free: self.free,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub tag: String,
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub meta: JsonMap,
}

/// Identity of a station across id namespaces: the station id alone can
/// collide between feeds of the same network, `nuid` disambiguates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationKey {
    pub station_id: String,
    pub nuid: Option<String>,
    pub network_tag: String,
}

impl StationKey {
    pub fn new(
        network_tag: impl Into<String>,
        station_id: impl Into<String>,
        nuid: Option<String>,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            nuid: nuid.filter(|n| !n.is_empty()),
            network_tag: network_tag.into(),
        }
    }

    pub fn of(network_tag: &str, station: &StationSnapshot) -> Self {
        Self::new(network_tag, station.id.clone(), station.nuid.clone())
    }
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            Some(self.station_id.as_str()),
            self.nuid.as_deref(),
            Some(self.network_tag.as_str()),
        ];
        let joined = parts
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&joined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    pub bikes: i64,
    pub free: i64,
}

impl Reading {
    pub fn new(bikes: i64, free: i64) -> Self {
        Self { bikes, free }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    pub network_tag: String,
    pub station: StationSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl StatRecord {
    pub fn new(
        network_tag: impl Into<String>,
        station: StationSnapshot,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            network_tag: network_tag.into(),
            station,
            timestamp,
        }
    }

    pub fn key(&self) -> StationKey {
        StationKey::of(&self.network_tag, &self.station)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownStation {
    pub key: StationKey,
    pub station: StationSnapshot,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatPoint {
    pub bikes: i64,
    pub free: i64,
    pub timestamp: DateTime<Utc>,
    pub extra: JsonMap,
}

impl StatPoint {
    pub fn reading(&self) -> Reading {
        Reading::new(self.bikes, self.free)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationHistory {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub stats: Vec<StatPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub avg: f64,
    pub max: i64,
    pub min: i64,
}

impl Summary {
    pub fn from_values(values: impl IntoIterator<Item = i64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0i64;
        let mut max = i64::MIN;
        let mut min = i64::MAX;
        for v in values {
            count += 1;
            sum += v;
            max = max.max(v);
            min = min.min(v);
        }
        if count == 0 {
            return None;
        }
        Some(Self {
            avg: sum as f64 / count as f64,
            max,
            min,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyStat {
    pub timestamp: DateTime<Utc>,
    pub bikes: Summary,
    pub free: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyStats {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub stats: Vec<HourlyStat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Hourly,
}

impl FromStr for Aggregation {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            other => Err(ModelError::UnsupportedAggregation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ModelError> {
        if from >= to {
            return Err(ModelError::InvalidRange(format!(
                "`from` ({from}) must be before `to` ({to})"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn parse(from: Option<&str>, to: Option<&str>) -> Result<Self, ModelError> {
        let from = parse_bound("from", from)?;
        let to = parse_bound("to", to)?;
        Self::new(from, to)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

fn parse_bound(name: &str, raw: Option<&str>) -> Result<DateTime<Utc>, ModelError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ModelError::InvalidRange(format!("missing `{name}`")))?;
    parse_query_timestamp(raw)
        .map_err(|_| ModelError::InvalidRange(format!("unparsable `{name}`: {raw}")))
}

pub fn format_store_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(STORE_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_store_timestamp(raw: &str) -> Result<DateTime<Utc>, ModelError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ModelError::InvalidTimestamp(raw.to_string()))
}

pub fn parse_query_timestamp(raw: &str) -> Result<DateTime<Utc>, ModelError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ModelError::InvalidTimestamp(raw.to_string()))
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::hours(1)).unwrap_or(ts)
}

/// Collapse runs of identical `(bikes, free)` into the first point of each
/// run. The first point is always kept: nothing before the window is known.
pub fn collapse_change_points(points: impl IntoIterator<Item = StatPoint>) -> Vec<StatPoint> {
    let mut out = Vec::new();
    let mut previous: Option<Reading> = None;
    for point in points {
        let reading = point.reading();
        if previous != Some(reading) {
            out.push(point);
        }
        previous = Some(reading);
    }
    out
}

/// Hour buckets, each represented by its last reading. Empty hours are omitted.
pub fn resample_hourly(points: &[StatPoint]) -> Vec<HourlyStat> {
    let mut buckets: BTreeMap<DateTime<Utc>, (DateTime<Utc>, Reading)> = BTreeMap::new();
    for point in points {
        let hour = truncate_to_hour(point.timestamp);
        let candidate = (point.timestamp, point.reading());
        buckets
            .entry(hour)
            .and_modify(|last| {
                if candidate.0 >= last.0 {
                    *last = candidate;
                }
            })
            .or_insert(candidate);
    }

    buckets
        .into_iter()
        .filter_map(|(hour, (_, last))| {
            Some(HourlyStat {
                timestamp: hour,
                bikes: Summary::from_values([last.bikes])?,
                free: Summary::from_values([last.free])?,
            })
        })
        .collect()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) if s.is_empty() => Ok(None),
        JsonValue::String(s) => Ok(Some(s)),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected a string, number or null, found {other}"
        ))),
    }
}

fn object_or_null<'de, D>(deserializer: D) -> Result<JsonMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<JsonMap>::deserialize(deserializer)?.unwrap_or_default())
}
