//! Ingestion: change-detection cache in front of the event store, and the
//! consumer loop that feeds it from a subscriber.

use std::collections::HashMap;

use bikestat_core::{NetworkUpdate, Reading, StatRecord, StationKey};
use bikestat_storage::{Store, StoreError};
use bikestat_transport::{Message, Subscriber};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Write(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct DedupCache {
    entries: Mutex<HashMap<StationKey, Reading>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn warm_up(&self, store: &Store) -> Result<usize, StoreError> {
        let readings = store.last_readings().await?;
        let mut entries = self.entries.lock().await;
        entries.extend(readings);
        Ok(entries.len())
    }

    pub async fn check(&self, key: &StationKey, reading: Reading) -> bool {
        let mut entries = self.entries.lock().await;
        record(&mut entries, key, reading).is_some()
    }

    pub async fn get(&self, key: &StationKey) -> Option<Reading> {
        self.entries.lock().await.get(key).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

// `Some(prior)` when the reading changed, `None` when it was already current.
fn record(
    entries: &mut HashMap<StationKey, Reading>,
    key: &StationKey,
    reading: Reading,
) -> Option<Option<Reading>> {
    match entries.insert(key.clone(), reading) {
        Some(prior) if prior == reading => None,
        prior => Some(prior),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub changed: usize,
    pub total: usize,
}

pub struct IngestPipeline {
    store: Store,
    cache: DedupCache,
}

impl IngestPipeline {
    pub async fn start(store: Store) -> Result<Self, StoreError> {
        let cache = DedupCache::new();
        let loaded = cache.warm_up(&store).await?;
        info!(stations = loaded, "dedup cache warmed up");
        Ok(Self { store, cache })
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub async fn handle(&self, update: &NetworkUpdate) -> Result<IngestOutcome, IngestError> {
        self.handle_at(update, Utc::now()).await
    }

    /// Append the snapshots of `update` whose reading changed, stamped `now`.
    /// On a failed write the cache is put back as it was, so the same
    /// readings are accepted again next time.
    pub async fn handle_at(
        &self,
        update: &NetworkUpdate,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let total = update.stations.len();
        let mut entries = self.cache.entries.lock().await;

        let mut records = Vec::new();
        let mut previous = Vec::new();
        for station in &update.stations {
            let key = StationKey::of(&update.tag, station);
            if let Some(prior) = record(&mut entries, &key, station.reading()) {
                records.push(StatRecord::new(update.tag.clone(), station.clone(), now));
                previous.push((key, prior));
            }
        }

        if let Err(err) = self.store.append(&update.network_info(), &records).await {
            for (key, prior) in previous.into_iter().rev() {
                match prior {
                    Some(reading) => entries.insert(key, reading),
                    None => entries.remove(&key),
                };
            }
            return Err(err.into());
        }
        drop(entries);

        let outcome = IngestOutcome {
            changed: records.len(),
            total,
        };
        info!(
            network = %update.tag,
            changed = outcome.changed,
            total = outcome.total,
            "processed network update"
        );
        Ok(outcome)
    }

    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let update = NetworkUpdate::from_slice(payload)?;
        let span = info_span!(
            "ingest",
            message_id = %Uuid::new_v4(),
            network = %update.tag,
            topic = %topic
        );
        self.handle(&update).instrument(span).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub messages: usize,
    pub changed: usize,
    pub failed: usize,
}

/// Pull messages until the feed ends or `shutdown` turns true (or its sender
/// goes away). A message being written when shutdown fires is finished first.
pub async fn run_consumer<S>(
    pipeline: &IngestPipeline,
    subscriber: &mut S,
    mut shutdown: watch::Receiver<bool>,
) -> ConsumerReport
where
    S: Subscriber + ?Sized,
{
    let mut report = ConsumerReport::default();
    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            received = subscriber.recv() => received,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match received {
            Ok(Some(Message { topic, payload })) => {
                report.messages += 1;
                match pipeline.handle_message(&topic, &payload).await {
                    Ok(outcome) => report.changed += outcome.changed,
                    Err(IngestError::Decode(err)) => {
                        report.failed += 1;
                        warn!(topic = %topic, error = %err, "dropping undecodable message");
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(topic = %topic, error = %err, "abandoning message");
                    }
                }
            }
            Ok(None) => {
                info!("feed closed");
                break;
            }
            Err(err) => warn!(error = %err, "transport error"),
        }
    }
    report
}
