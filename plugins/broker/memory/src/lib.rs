use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use kscope_api::{
    now_ms, parse_bytes_arg, Broker, BrokerError, BrokerFactory, BrokerFuture, Connection,
    MessageRecord, OffsetStore, PartitionOffsets, ProduceAck, TopicPartition,
};

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

fn default_partitions() -> i32 {
    1
}

fn default_retention() -> usize {
    100_000
}

/// Описание topic'а in-memory брокера.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryTopicConfig {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// Максимум сообщений на партицию; старые вытесняются,
    /// start offset партиции сдвигается вперёд.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Сообщения, которые публикуются при старте.
    #[serde(default)]
    pub messages: Vec<SeedMessage>,
}

/// Начальное сообщение. `key`/`value` — dotted-hex или UTF-8 текст.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SeedMessage {
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MemoryBrokerConfig {
    #[serde(default)]
    pub topics: Vec<MemoryTopicConfig>,
    /// Создавать topic (1 партиция) при первой публикации в него.
    #[serde(default)]
    pub auto_create_topics: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

/// Ring-buffer одной партиции. Offset'ы непрерывны от `start` до `end`.
struct Partition {
    records: VecDeque<MessageRecord>,
    start: i64,
    end: i64,
    retention: usize,
}

impl Partition {
    fn new(retention: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(retention.min(65536)),
            start: 0,
            end: 0,
            retention: retention.max(1),
        }
    }

    fn append(&mut self, key: Vec<u8>, payload: Vec<u8>, timestamp_ms: i64) -> i64 {
        let offset = self.end;
        if self.records.len() >= self.retention {
            self.records.pop_front();
            self.start += 1;
        }
        self.records.push_back(MessageRecord {
            offset,
            next_offset: offset + 1,
            timestamp_ms,
            key,
            payload,
        });
        self.end = offset + 1;
        offset
    }

    fn offsets(&self) -> PartitionOffsets {
        PartitionOffsets::new(self.start, self.end)
    }

    fn fetch(&self, offset: i64, max_bytes: usize) -> Vec<MessageRecord> {
        let from = (offset.max(self.start) - self.start) as usize;
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for record in self.records.iter().skip(from) {
            if !batch.is_empty() && bytes + record.size() > max_bytes {
                break;
            }
            bytes += record.size();
            batch.push(record.clone());
        }
        batch
    }

    fn offset_for_time(&self, ts_ms: i64) -> Option<i64> {
        self.records
            .iter()
            .find(|r| r.timestamp_ms >= ts_ms)
            .map(|r| r.offset)
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-memory кластер: topic'и с партициями-ring-buffer'ами и
/// хранилище committed offset'ов consumer group.
///
/// Используется kscope без внешнего кластера и в тестах движка.
pub struct MemoryBroker {
    topics: RwLock<BTreeMap<String, Vec<Partition>>>,
    committed: RwLock<HashMap<(String, TopicPartition), i64>>,
    auto_create: bool,
    round_robin: AtomicU32,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            topics: RwLock::new(BTreeMap::new()),
            committed: RwLock::new(HashMap::new()),
            auto_create: false,
            round_robin: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Построить брокер по конфигу, опубликовав seed-сообщения.
    pub fn from_config(config: &MemoryBrokerConfig) -> Result<Self, BrokerError> {
        let mut topics = BTreeMap::new();
        for topic_cfg in &config.topics {
            if topic_cfg.partitions < 1 {
                return Err(BrokerError::config(format!(
                    "topic '{}': partitions must be >= 1",
                    topic_cfg.name
                )));
            }
            let mut partitions: Vec<Partition> = (0..topic_cfg.partitions)
                .map(|_| Partition::new(topic_cfg.retention))
                .collect();
            for (i, msg) in topic_cfg.messages.iter().enumerate() {
                let key = parse_bytes_arg(&msg.key);
                let p = match msg.partition {
                    Some(p) => p,
                    None => pick_partition(&key, topic_cfg.partitions, i as u32),
                };
                let partition = partitions.get_mut(p as usize).ok_or_else(|| {
                    BrokerError::config(format!(
                        "topic '{}': seed message partition {p} out of range",
                        topic_cfg.name
                    ))
                })?;
                partition.append(
                    key,
                    parse_bytes_arg(&msg.value),
                    msg.timestamp_ms.unwrap_or_else(now_ms),
                );
            }
            tracing::debug!(
                topic = %topic_cfg.name,
                partitions = topic_cfg.partitions,
                seeded = topic_cfg.messages.len(),
                "created memory topic"
            );
            topics.insert(topic_cfg.name.clone(), partitions);
        }

        Ok(Self {
            topics: RwLock::new(topics),
            auto_create: config.auto_create_topics,
            ..Self::default()
        })
    }

    /// Создать topic. Существующий topic не трогается.
    pub async fn create_topic(&self, name: &str, partitions: i32, retention: usize) {
        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| (0..partitions.max(1)).map(|_| Partition::new(retention)).collect());
    }

    /// Записать сообщение с явным timestamp (для seed и тестов).
    pub async fn append_at(
        &self,
        topic: &str,
        partition: i32,
        key: &[u8],
        payload: &[u8],
        timestamp_ms: i64,
    ) -> Result<i64, BrokerError> {
        let mut topics = self.topics.write().await;
        let partitions = topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::not_found(format!("topic '{topic}' not found")))?;
        let p = partitions
            .get_mut(partition as usize)
            .ok_or_else(|| partition_not_found(topic, partition))?;
        Ok(p.append(key.to_vec(), payload.to_vec(), timestamp_ms))
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::io("broker connection closed"));
        }
        Ok(())
    }
}

fn partition_not_found(topic: &str, partition: i32) -> BrokerError {
    BrokerError::not_found(format!("partition {topic}:{partition} not found"))
}

/// Партиция по ключу: hash(key) mod N; пустой ключ — round-robin.
fn pick_partition(key: &[u8], partitions: i32, counter: u32) -> i32 {
    if key.is_empty() {
        return (counter % partitions as u32) as i32;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as i32
}

impl Broker for MemoryBroker {
    fn topics(&self) -> BrokerFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.ensure_open()?;
            let topics = self.topics.read().await;
            Ok(topics.keys().cloned().collect())
        })
    }

    fn partitions(&self, topic: &str) -> BrokerFuture<'_, Vec<i32>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let topics = self.topics.read().await;
            let partitions = topics
                .get(&topic)
                .ok_or_else(|| BrokerError::not_found(format!("topic '{topic}' not found")))?;
            Ok((0..partitions.len() as i32).collect())
        })
    }

    fn offsets(&self, topic: &str, partition: i32) -> BrokerFuture<'_, PartitionOffsets> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .and_then(|ps| ps.get(partition as usize))
                .map(Partition::offsets)
                .ok_or_else(|| partition_not_found(&topic, partition))
        })
    }

    fn offset_for_time(
        &self,
        topic: &str,
        partition: i32,
        ts_ms: i64,
    ) -> BrokerFuture<'_, Option<i64>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .and_then(|ps| ps.get(partition as usize))
                .map(|p| p.offset_for_time(ts_ms))
                .ok_or_else(|| partition_not_found(&topic, partition))
        })
    }

    fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: usize,
    ) -> BrokerFuture<'_, Vec<MessageRecord>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .and_then(|ps| ps.get(partition as usize))
                .map(|p| p.fetch(offset, max_bytes))
                .ok_or_else(|| partition_not_found(&topic, partition))
        })
    }

    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Vec<u8>,
        payload: Vec<u8>,
    ) -> BrokerFuture<'_, ProduceAck> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let mut topics = self.topics.write().await;
            if !topics.contains_key(&topic) {
                if !self.auto_create {
                    return Err(BrokerError::not_found(format!("topic '{topic}' not found")));
                }
                tracing::info!(topic = %topic, "auto-created topic");
                topics.insert(topic.clone(), vec![Partition::new(default_retention())]);
            }
            let partitions = topics
                .get_mut(&topic)
                .ok_or_else(|| BrokerError::not_found(format!("topic '{topic}' not found")))?;

            let count = partitions.len() as i32;
            let p = match partition {
                Some(p) => p,
                None => {
                    let counter = self.round_robin.fetch_add(1, Ordering::Relaxed);
                    pick_partition(&key, count, counter)
                }
            };
            let target = partitions
                .get_mut(p as usize)
                .filter(|_| p >= 0)
                .ok_or_else(|| partition_not_found(&topic, p))?;
            let offset = target.append(key, payload, now_ms());
            Ok(ProduceAck { partition: p, offset })
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            tracing::debug!("memory broker closed");
            Ok(())
        })
    }
}

impl OffsetStore for MemoryBroker {
    fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) -> BrokerFuture<'_, ()> {
        let key = (group.to_string(), tp.clone());
        Box::pin(async move {
            self.ensure_open()?;
            self.committed.write().await.insert(key, offset);
            Ok(())
        })
    }

    fn committed(&self, group: &str, tp: &TopicPartition) -> BrokerFuture<'_, Option<i64>> {
        let key = (group.to_string(), tp.clone());
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.committed.read().await.get(&key).copied())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBrokerFactory
// ═══════════════════════════════════════════════════════════════

/// Отдаёт один и тот же брокер на каждый `connect`.
pub struct MemoryBrokerFactory {
    broker: Arc<MemoryBroker>,
}

impl MemoryBrokerFactory {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn from_config(config: &MemoryBrokerConfig) -> Result<Self, BrokerError> {
        Ok(Self::new(Arc::new(MemoryBroker::from_config(config)?)))
    }
}

impl BrokerFactory for MemoryBrokerFactory {
    fn connect(&self) -> BrokerFuture<'_, Connection> {
        Box::pin(async move {
            self.broker.ensure_open()?;
            tracing::debug!("connected to memory broker");
            Ok(Connection {
                broker: self.broker.clone(),
                offsets: self.broker.clone(),
            })
        })
    }
}
