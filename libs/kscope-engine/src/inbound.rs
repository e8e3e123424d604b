use std::collections::HashMap;
use std::time::Duration;

use kscope_api::{now_ms, Broker, PartitionOffsets, TopicPartition};
use serde::Serialize;

use crate::error::Result;

/// Последний замер партиции. Заменяется целиком при каждом poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundSnapshot {
    pub start_offset: i64,
    pub end_offset: i64,
    pub last_check_ms: i64,
}

/// Прирост сообщений в партиции с прошлого замера.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub topic: String,
    pub partition: i32,
    pub start_offset: i64,
    pub end_offset: i64,
    pub change: i64,
    /// msgs/sec, округлено вверх до 0.1.
    pub rate: f64,
    pub checked_at_ms: i64,
}

/// Кэш замеров high-water mark по (topic, partition).
#[derive(Debug, Default)]
pub struct InboundTracker {
    snapshots: HashMap<TopicPartition, InboundSnapshot>,
}

impl InboundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Есть ли в кэше хоть одна партиция topic'ов с префиксом `prefix`.
    pub fn tracks(&self, prefix: Option<&str>) -> bool {
        self.snapshots
            .keys()
            .any(|tp| prefix.is_none_or(|p| tp.topic.starts_with(p)))
    }

    pub fn snapshot(&self, tp: &TopicPartition) -> Option<&InboundSnapshot> {
        self.snapshots.get(tp)
    }

    /// Учесть один замер партиции и вернуть прирост.
    pub fn observe(&mut self, tp: TopicPartition, offsets: PartitionOffsets, now_ms: i64) -> Inbound {
        let (change, elapsed) = match self.snapshots.get(&tp) {
            Some(prev) => (
                offsets.end - prev.end_offset,
                ((now_ms - prev.last_check_ms) / 1000).max(1),
            ),
            None => (0, 1),
        };
        self.snapshots.insert(
            tp.clone(),
            InboundSnapshot {
                start_offset: offsets.start,
                end_offset: offsets.end,
                last_check_ms: now_ms,
            },
        );
        Inbound {
            topic: tp.topic,
            partition: tp.partition,
            start_offset: offsets.start,
            end_offset: offsets.end,
            change,
            rate: round_up_tenth(change as f64 / elapsed as f64),
            checked_at_ms: now_ms,
        }
    }

    /// Замерить все партиции topic'ов с префиксом `prefix`.
    ///
    /// Offset'ы запрашиваются до обновления кэша: при ошибке брокера
    /// ни один снимок не меняется.
    pub async fn poll(
        &mut self,
        broker: &dyn Broker,
        prefix: Option<&str>,
        now_ms: i64,
    ) -> Result<Vec<Inbound>> {
        let mut measured = Vec::new();
        for topic in broker.topics().await? {
            if prefix.is_some_and(|p| !topic.starts_with(p)) {
                continue;
            }
            for partition in broker.partitions(&topic).await? {
                let offsets = broker.offsets(&topic, partition).await?;
                measured.push((TopicPartition::new(topic.clone(), partition), offsets));
            }
        }

        let mut result: Vec<Inbound> = measured
            .into_iter()
            .map(|(tp, offsets)| self.observe(tp, offsets, now_ms))
            .filter(|i| i.change != 0)
            .collect();
        result.sort_by(|a, b| {
            b.change
                .cmp(&a.change)
                .then_with(|| a.topic.cmp(&b.topic))
                .then_with(|| a.partition.cmp(&b.partition))
        });
        tracing::debug!(prefix = ?prefix, changed = result.len(), "inbound poll");
        Ok(result)
    }

    /// Poll с предварительным базовым замером: если для префикса ещё нет
    /// замеров или задан явный `wait`, сначала холостой poll, пауза,
    /// затем настоящий poll.
    pub async fn poll_with_baseline(
        &mut self,
        broker: &dyn Broker,
        prefix: Option<&str>,
        wait: Option<Duration>,
        default_wait: Duration,
    ) -> Result<Vec<Inbound>> {
        if wait.is_some() || !self.tracks(prefix) {
            self.poll(broker, prefix, now_ms()).await?;
            let pause = wait.unwrap_or(default_wait);
            tracing::debug!(wait_ms = pause.as_millis() as u64, "inbound baseline taken");
            tokio::time::sleep(pause).await;
        }
        self.poll(broker, prefix, now_ms()).await
    }
}

fn round_up_tenth(x: f64) -> f64 {
    (x * 10.0).ceil() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::broker_with;

    #[test]
    fn test_observe_rate() {
        let mut tracker = InboundTracker::new();
        let tp = TopicPartition::new("orders", 0);

        let first = tracker.observe(tp.clone(), PartitionOffsets::new(0, 10), 0);
        assert_eq!(first.change, 0);
        assert_eq!(first.rate, 0.0);

        // 10 messages over 3 seconds -> 3.33.. rounds up to 3.4
        let second = tracker.observe(tp.clone(), PartitionOffsets::new(0, 20), 3_000);
        assert_eq!(second.change, 10);
        assert_eq!(second.rate, 3.4);

        // sub-second interval counts as one second
        let third = tracker.observe(tp.clone(), PartitionOffsets::new(0, 25), 3_400);
        assert_eq!(third.rate, 5.0);
        assert_eq!(
            tracker.snapshot(&tp),
            Some(&InboundSnapshot { start_offset: 0, end_offset: 25, last_check_ms: 3_400 })
        );
    }

    #[tokio::test]
    async fn test_poll_idempotent() {
        let broker = broker_with("orders", &[3, 4]).await;
        let mut tracker = InboundTracker::new();

        assert!(tracker.poll(broker.as_ref(), None, 1_000).await.unwrap().is_empty());
        assert!(tracker.poll(broker.as_ref(), None, 1_000).await.unwrap().is_empty());
        assert!(tracker.tracks(None));
    }

    #[tokio::test]
    async fn test_poll_sorted_by_change() {
        let broker = broker_with("orders", &[1, 1]).await;
        broker.create_topic("payments", 1, 100).await;
        let mut tracker = InboundTracker::new();
        tracker.poll(broker.as_ref(), None, 0).await.unwrap();

        for _ in 0..3 {
            broker.append_at("orders", 1, b"k", b"v", 0).await.unwrap();
            broker.append_at("payments", 0, b"k", b"v", 0).await.unwrap();
        }
        broker.append_at("orders", 0, b"k", b"v", 0).await.unwrap();

        let inbound = tracker.poll(broker.as_ref(), None, 2_000).await.unwrap();
        let order: Vec<(&str, i32, i64)> =
            inbound.iter().map(|i| (i.topic.as_str(), i.partition, i.change)).collect();
        assert_eq!(order, vec![("orders", 1, 3), ("payments", 0, 3), ("orders", 0, 1)]);
        assert!(inbound.iter().all(|i| i.rate >= 0.0));
        assert_eq!(inbound[0].rate, 1.5);
    }

    #[tokio::test]
    async fn test_poll_prefix() {
        let broker = broker_with("orders", &[1]).await;
        broker.create_topic("payments", 1, 100).await;
        let mut tracker = InboundTracker::new();
        tracker.poll(broker.as_ref(), Some("pay"), 0).await.unwrap();
        assert!(tracker.snapshot(&TopicPartition::new("orders", 0)).is_none());
        assert!(tracker.snapshot(&TopicPartition::new("payments", 0)).is_some());
        assert!(tracker.tracks(Some("pay")));
        assert!(tracker.tracks(None));
        assert!(!tracker.tracks(Some("ord")));
    }

    #[tokio::test]
    async fn test_baseline_then_poll() {
        let broker = broker_with("orders", &[2]).await;
        let mut tracker = InboundTracker::new();
        let inbound = tracker
            .poll_with_baseline(broker.as_ref(), None, None, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(inbound.is_empty());
        assert!(tracker.tracks(None));
    }

    #[tokio::test]
    async fn test_cached_prefix_skips_baseline() {
        let broker = broker_with("orders", &[2]).await;
        let mut tracker = InboundTracker::new();
        tracker.poll(broker.as_ref(), None, 0).await.unwrap();
        broker.append_at("orders", 0, b"k", b"v", 0).await.unwrap();

        // the growth since the cached snapshot is reported right away
        let inbound = tracker
            .poll_with_baseline(broker.as_ref(), None, None, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].change, 1);
    }

    #[tokio::test]
    async fn test_explicit_wait_retakes_baseline() {
        let broker = broker_with("orders", &[2]).await;
        let mut tracker = InboundTracker::new();
        tracker.poll(broker.as_ref(), None, 0).await.unwrap();
        broker.append_at("orders", 0, b"k", b"v", 0).await.unwrap();

        // the baseline absorbs the earlier growth; nothing arrives during the wait
        let inbound = tracker
            .poll_with_baseline(broker.as_ref(), None, Some(Duration::from_millis(5)), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(inbound.is_empty());
        assert_eq!(tracker.snapshot(&TopicPartition::new("orders", 0)).map(|s| s.end_offset), Some(3));
    }

    #[tokio::test]
    async fn test_new_prefix_takes_baseline() {
        let broker = broker_with("orders", &[1]).await;
        broker.create_topic("payments", 1, 100).await;
        let mut tracker = InboundTracker::new();
        tracker.poll(broker.as_ref(), Some("ord"), 0).await.unwrap();

        // messages land on payments while the baseline pause is running
        let writer = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                for _ in 0..3 {
                    broker.append_at("payments", 0, b"k", b"v", 0).await.unwrap();
                }
            })
        };
        let inbound = tracker
            .poll_with_baseline(broker.as_ref(), Some("pay"), None, Duration::from_millis(300))
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(inbound.len(), 1);
        assert_eq!((inbound[0].topic.as_str(), inbound[0].change), ("payments", 3));
    }
}
