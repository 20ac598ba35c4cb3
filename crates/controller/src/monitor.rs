//! Cache readers on their own cadences: the fast UI broadcast and the slow
//! durable snapshot persistence. Neither ever writes the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::notify::{Notification, Notifier, SharedNotifier};
use crate::readings::{ReadingsCache, SharedCache};
use crate::store::Persistence;

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

pub async fn broadcast_tick(cache: &ReadingsCache, notifier: &dyn Notifier) {
    let snapshot = cache.snapshot().await;
    let status = snapshot.status();
    notifier.notify(Notification::SensorUpdate(snapshot));
    notifier.notify(Notification::SensorStatusUpdate(status));
}

pub async fn broadcast_loop(
    cache: SharedCache,
    notifier: SharedNotifier,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "broadcast loop started");
    while running.load(Ordering::Relaxed) {
        broadcast_tick(&cache, notifier.as_ref()).await;
        tokio::time::sleep(interval).await;
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored,
    /// A required metric had no value.
    Skipped,
    /// The store rejected the write; the snapshot is dropped.
    Failed,
}

pub async fn persist_tick(
    cache: &ReadingsCache,
    store: &dyn Persistence,
    notifier: &dyn Notifier,
) -> PersistOutcome {
    let snapshot = cache.snapshot().await;
    if !snapshot.has_required() {
        debug!("persistence: required metrics missing, skipping tick");
        return PersistOutcome::Skipped;
    }

    let record = snapshot.to_record();
    match store.insert_snapshot(&record).await {
        Ok(()) => {
            notifier.notify(Notification::WeatherUpdate(record));
            PersistOutcome::Stored
        }
        Err(e) => {
            error!("persistence: insert_snapshot failed: {e:#}");
            PersistOutcome::Failed
        }
    }
}

pub async fn persistence_loop(
    cache: SharedCache,
    store: Arc<dyn Persistence>,
    notifier: SharedNotifier,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    info!(interval_sec = interval.as_secs(), "persistence loop started");
    while running.load(Ordering::Relaxed) {
        persist_tick(&cache, store.as_ref(), notifier.as_ref()).await;
        tokio::time::sleep(interval).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use crate::readings::{Metric, Reading, SensorStatus};
    use crate::store::testing::MemoryStore;

    async fn cache_with(values: &[(Metric, f64)]) -> ReadingsCache {
        let cache = ReadingsCache::new();
        for (m, v) in values {
            cache.update(*m, Reading::measured(*v)).await;
        }
        cache
    }

    #[tokio::test]
    async fn broadcast_sends_snapshot_then_status() {
        let cache = cache_with(&[(Metric::Light, 64.0)]).await;
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.subscribe();

        broadcast_tick(&cache, &notifier).await;

        match rx.recv().await.unwrap() {
            Notification::SensorUpdate(snap) => assert_eq!(snap.value(Metric::Light), Some(64.0)),
            other => panic!("unexpected {}", other.kind()),
        }
        match rx.recv().await.unwrap() {
            Notification::SensorStatusUpdate(status) => {
                assert_eq!(status[&Metric::Light], SensorStatus::Connected);
                assert_eq!(status[&Metric::Rain], SensorStatus::Disconnected);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn persist_skips_without_required_metrics() {
        let cache = cache_with(&[(Metric::Temperature, 21.0), (Metric::Rain, 3.0)]).await;
        let store = MemoryStore::new();
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.subscribe();

        let outcome = persist_tick(&cache, &store, &notifier).await;
        assert_eq!(outcome, PersistOutcome::Skipped);
        assert!(store.snapshots().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn persist_stores_and_notifies() {
        let cache = cache_with(&[(Metric::Temperature, 21.0), (Metric::Humidity, 45.0)]).await;
        let store = MemoryStore::new();
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.subscribe();

        let outcome = persist_tick(&cache, &store, &notifier).await;
        assert_eq!(outcome, PersistOutcome::Stored);

        let stored = store.snapshots();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].temperature, Some(21.0));
        assert_eq!(stored[0].soil_moisture, None);

        match rx.try_recv().unwrap() {
            Notification::WeatherUpdate(rec) => assert_eq!(rec, stored[0]),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn persist_failure_drops_tick_and_recovers() {
        let cache = cache_with(&[(Metric::Temperature, 21.0), (Metric::Humidity, 45.0)]).await;
        let store = MemoryStore::new();
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.subscribe();

        store.fail_writes(true);
        assert_eq!(
            persist_tick(&cache, &store, &notifier).await,
            PersistOutcome::Failed
        );
        assert!(rx.try_recv().is_err());

        store.fail_writes(false);
        assert_eq!(
            persist_tick(&cache, &store, &notifier).await,
            PersistOutcome::Stored
        );
        assert_eq!(store.snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_loop_ticks_at_interval() {
        let cache = Arc::new(cache_with(&[(Metric::Humidity, 50.0)]).await);
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.subscribe();
        let running = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(broadcast_loop(
            cache,
            Arc::new(notifier.clone()),
            Duration::from_secs(1),
            running.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        running.store(false, Ordering::Relaxed);
        task.await.unwrap();

        let mut updates = 0;
        while let Ok(note) = rx.try_recv() {
            if let Notification::SensorUpdate(_) = note {
                updates += 1;
            }
        }
        // Ticks at 0s, 1s and 2s.
        assert_eq!(updates, 3);
    }
}
