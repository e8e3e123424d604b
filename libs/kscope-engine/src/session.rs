//! Сессия kscope: ленивое соединение с кластером, курсоры, кэши и
//! по одной async-операции на команду.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kscope_api::{
    parse_bytes_arg, Broker, BrokerFactory, Connection, MessageRecord, PartitionOffsets,
    ProduceAck, TopicPartition,
};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};

use crate::condition;
use crate::cursor::{Cursor, CursorRegistry};
use crate::decoder::{DecodedMessage, Decoder, DecoderCache};
use crate::error::{EngineError, Result};
use crate::inbound::{Inbound, InboundTracker};
use crate::navigation::{self, Position};
use crate::search::{self, Hit, Matcher, ScanSummary, Scope};
use crate::sink;

pub const DEFAULT_FETCH_SIZE: usize = 1024 * 1024;
pub const DEFAULT_INBOUND_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub fetch_size: usize,
    pub inbound_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            inbound_wait: DEFAULT_INBOUND_WAIT,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Views
// ═══════════════════════════════════════════════════════════════

/// Полученное сообщение вместе с результатом декодирования.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub topic: String,
    pub partition: i32,
    pub record: MessageRecord,
    /// None — декодер не привязан, сообщение бинарное.
    pub decoded: Option<DecodedMessage>,
}

#[derive(Debug, Clone)]
pub struct CursorView {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub next_offset: i64,
    pub decoder: Option<String>,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    /// Заполняются только в подробном списке (`kls -l`).
    pub partitions: Option<usize>,
    pub messages: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub partition: i32,
    pub start: i64,
    pub end: i64,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct FindView {
    pub message: Option<MessageView>,
    pub summary: ScanSummary,
}

/// Адрес сообщения в команде: всё опционально, недостающее берётся
/// из текущего курсора.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Locator {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub schema: Option<String>,
}

/// Аргументы поисковых команд (`kcount`, `kfindone`, `kfindnext`, `kfind`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchArgs {
    pub tokens: Vec<String>,
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub schema: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════

pub struct Session {
    factory: Arc<dyn BrokerFactory>,
    connection: OnceCell<Connection>,
    cursors: Mutex<CursorRegistry>,
    inbound: Mutex<InboundTracker>,
    decoders: DecoderCache,
    fetch_size: AtomicUsize,
    inbound_wait: Duration,
    correlation: AtomicU64,
}

impl Session {
    pub fn new(factory: Arc<dyn BrokerFactory>, config: SessionConfig) -> Self {
        Self {
            factory,
            connection: OnceCell::new(),
            cursors: Mutex::new(CursorRegistry::new()),
            inbound: Mutex::new(InboundTracker::new()),
            decoders: DecoderCache::new(),
            fetch_size: AtomicUsize::new(config.fetch_size.max(1)),
            inbound_wait: config.inbound_wait,
            correlation: AtomicU64::new(0),
        }
    }

    /// Span команды с новым correlation id.
    pub fn command_span(&self, name: &str) -> tracing::Span {
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info_span!("command", correlation_id, name = %name)
    }

    async fn connection(&self) -> Result<&Connection> {
        self.connection
            .get_or_try_init(|| async {
                tracing::info!("connecting to cluster");
                self.factory.connect().await
            })
            .await
            .map_err(EngineError::from)
    }

    async fn broker(&self) -> Result<Arc<dyn Broker>> {
        Ok(self.connection().await?.broker.clone())
    }

    /// Закрыть соединение, если оно было установлено.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(connection) = self.connection.get() {
            connection.broker.close().await?;
            tracing::info!("session closed");
        }
        Ok(())
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size.load(Ordering::Relaxed)
    }

    pub fn set_fetch_size(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Err(EngineError::syntax("fetch size must be greater than zero"));
        }
        self.fetch_size.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    // ── Context resolution ────────────────────────────────────────

    /// Явный topic или topic текущего курсора.
    async fn resolve_topic(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(topic) = explicit {
            return Ok(topic.to_string());
        }
        let cursors = self.cursors.lock().await;
        cursors
            .current_topic()
            .map(str::to_string)
            .ok_or(EngineError::NoCursor)
    }

    async fn cursor_for(&self, topic: &str) -> Option<Cursor> {
        self.cursors.lock().await.get(topic).cloned()
    }

    async fn current_cursor(&self) -> Result<Cursor> {
        self.cursors.lock().await.current().cloned().ok_or(EngineError::NoCursor)
    }

    /// topic, партиция и декодер для команды. Партиция по умолчанию —
    /// партиция курсора topic'а, иначе младшая партиция.
    async fn locate(&self, locator: &Locator) -> Result<(String, i32, Option<Arc<Decoder>>)> {
        let topic = self.resolve_topic(locator.topic.as_deref()).await?;
        let cursor = self.cursor_for(&topic).await;
        let decoder = self
            .decoders
            .resolve(locator.schema.as_deref(), cursor.as_ref().and_then(|c| c.decoder.as_ref()))?;
        let partition = match (locator.partition, cursor) {
            (Some(p), _) => p,
            (None, Some(c)) => c.partition,
            (None, None) => {
                let broker = self.broker().await?;
                navigation::partition_range(broker.as_ref(), &topic).await?.0
            }
        };
        Ok((topic, partition, decoder))
    }

    async fn scope(&self, topic: &str, partition: Option<i32>) -> Result<Scope> {
        let partitions = match partition {
            Some(p) => vec![p],
            None => self.broker().await?.partitions(topic).await?,
        };
        Ok(Scope {
            topic: topic.to_string(),
            partitions,
        })
    }

    /// Прочитать сообщение по offset'у и поставить на него курсор.
    async fn retrieve(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        decoder: Option<Arc<Decoder>>,
    ) -> Result<Option<MessageView>> {
        let broker = self.broker().await?;
        let batch = broker.fetch(topic, partition, offset, self.fetch_size()).await?;
        let Some(record) = batch.into_iter().find(|r| r.offset == offset) else {
            return Ok(None);
        };
        Ok(Some(self.land(topic, partition, record, decoder).await))
    }

    async fn land(
        &self,
        topic: &str,
        partition: i32,
        record: MessageRecord,
        decoder: Option<Arc<Decoder>>,
    ) -> MessageView {
        let decoded = DecodedMessage::attempt(&record.payload, decoder.as_deref());
        self.cursors
            .lock()
            .await
            .set_current(topic, partition, &record, decoder);
        MessageView {
            topic: topic.to_string(),
            partition,
            record,
            decoded,
        }
    }

    fn hit_view(&self, topic: &str, hit: Hit) -> (MessageView, MessageRecord) {
        let record = hit.record.clone();
        let view = MessageView {
            topic: topic.to_string(),
            partition: hit.partition,
            record: hit.record,
            decoded: hit.decoded.map(DecodedMessage::Record),
        };
        (view, record)
    }

    // ── Topics & cursors ──────────────────────────────────────────

    /// `kls [prefix] [-l]`
    pub async fn list_topics(&self, prefix: Option<&str>, detailed: bool) -> Result<Vec<TopicInfo>> {
        let broker = self.broker().await?;
        let mut topics = broker.topics().await?;
        topics.retain(|t| prefix.is_none_or(|p| t.starts_with(p)));
        topics.sort();

        let mut result = Vec::with_capacity(topics.len());
        for name in topics {
            let (partitions, messages) = if detailed {
                let stats = self.partition_stats(broker.as_ref(), &name, None).await?;
                (Some(stats.len()), Some(stats.iter().map(|s| s.count).sum()))
            } else {
                (None, None)
            };
            result.push(TopicInfo { name, partitions, messages });
        }
        Ok(result)
    }

    /// `kcursor [prefix]`
    pub async fn cursors(&self, prefix: Option<&str>) -> Vec<CursorView> {
        let cursors = self.cursors.lock().await;
        let current = cursors.current_topic();
        cursors
            .list(prefix)
            .into_iter()
            .map(|c| CursorView {
                topic: c.topic.clone(),
                partition: c.partition,
                offset: c.offset,
                next_offset: c.next_offset,
                decoder: c.decoder_ref().map(str::to_string),
                current: current == Some(c.topic.as_str()),
            })
            .collect()
    }

    /// `kswitch <topic>`
    pub async fn switch(&self, topic: &str) -> Result<()> {
        if self.cursors.lock().await.switch_current(topic) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("no cursor for topic '{topic}'")))
        }
    }

    // ── Retrieval ─────────────────────────────────────────────────

    /// `kfirst [topic] [partition]`
    pub async fn first(&self, locator: &Locator) -> Result<Option<MessageView>> {
        let (topic, partition, decoder) = self.locate(locator).await?;
        let offsets = self.broker().await?.offsets(&topic, partition).await?;
        match offsets.first() {
            Some(offset) => self.retrieve(&topic, partition, offset, decoder).await,
            None => Ok(None),
        }
    }

    /// `klast [topic] [partition]`
    pub async fn last(&self, locator: &Locator) -> Result<Option<MessageView>> {
        let (topic, partition, decoder) = self.locate(locator).await?;
        let offsets = self.broker().await?.offsets(&topic, partition).await?;
        match offsets.last() {
            Some(offset) => self.retrieve(&topic, partition, offset, decoder).await,
            None => Ok(None),
        }
    }

    /// `kget [topic] [partition] [offset]`. Без offset'а — позиция
    /// курсора в этой партиции, иначе первый offset.
    pub async fn get(&self, locator: &Locator, offset: Option<i64>) -> Result<MessageView> {
        let (topic, partition, decoder) = self.locate(locator).await?;
        let offset = match offset {
            Some(o) => o,
            None => match self.cursor_for(&topic).await {
                Some(c) if c.partition == partition => c.offset,
                _ => {
                    let offsets = self.broker().await?.offsets(&topic, partition).await?;
                    offsets.first().ok_or_else(|| {
                        EngineError::NotFound(format!("partition {topic}:{partition} is empty"))
                    })?
                }
            },
        };
        self.retrieve(&topic, partition, offset, decoder)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no message at {topic}:{partition}@{offset}")))
    }

    /// `kget [topic] [partition] -t <instant>`: первое сообщение с
    /// timestamp >= `ts_ms`.
    pub async fn get_at_time(&self, locator: &Locator, ts_ms: i64) -> Result<Option<MessageView>> {
        let (topic, partition, decoder) = self.locate(locator).await?;
        let broker = self.broker().await?;
        match broker.offset_for_time(&topic, partition, ts_ms).await? {
            Some(offset) => self.retrieve(&topic, partition, offset, decoder).await,
            None => Ok(None),
        }
    }

    /// `knext [delta]`
    pub async fn next(&self, delta: Option<i64>) -> Result<Option<MessageView>> {
        let cursor = self.current_cursor().await?;
        let broker = self.broker().await?;
        let target =
            navigation::advance(broker.as_ref(), &cursor, delta.unwrap_or(navigation::DEFAULT_ADVANCE))
                .await?;
        self.goto(target, cursor.decoder).await
    }

    /// `kprev [delta]`
    pub async fn prev(&self, delta: Option<i64>) -> Result<Option<MessageView>> {
        let cursor = self.current_cursor().await?;
        let broker = self.broker().await?;
        let target =
            navigation::retreat(broker.as_ref(), &cursor, delta.unwrap_or(navigation::DEFAULT_RETREAT))
                .await?;
        self.goto(target, cursor.decoder).await
    }

    async fn goto(
        &self,
        target: Option<Position>,
        decoder: Option<Arc<Decoder>>,
    ) -> Result<Option<MessageView>> {
        match target {
            Some(pos) => self.retrieve(&pos.topic, pos.partition, pos.offset, decoder).await,
            None => Ok(None),
        }
    }

    // ── Search ────────────────────────────────────────────────────

    async fn matcher(&self, topic: &str, args: &SearchArgs) -> Result<(Arc<Matcher>, Option<Arc<Decoder>>)> {
        let cursor = self.cursor_for(topic).await;
        let decoder = self
            .decoders
            .resolve(args.schema.as_deref(), cursor.as_ref().and_then(|c| c.decoder.as_ref()))?;
        let condition = condition::compile(args.tokens.as_slice(), decoder.as_deref())?;
        tracing::debug!(topic = %topic, condition = %condition, "compiled condition");
        Ok((Arc::new(Matcher::new(condition, decoder.clone())), decoder))
    }

    /// `kcount ...`
    pub async fn count(&self, args: &SearchArgs) -> Result<ScanSummary> {
        let topic = self.resolve_topic(args.topic.as_deref()).await?;
        let (matcher, _) = self.matcher(&topic, args).await?;
        let scope = self.scope(&topic, args.partition).await?;
        search::count(self.broker().await?, &scope, matcher, self.fetch_size()).await
    }

    /// `kfindone ...`: первое совпадение, курсор переходит на него.
    pub async fn find_one(&self, args: &SearchArgs) -> Result<FindView> {
        let topic = self.resolve_topic(args.topic.as_deref()).await?;
        let (matcher, decoder) = self.matcher(&topic, args).await?;
        let scope = self.scope(&topic, args.partition).await?;
        let found = search::find_first(self.broker().await?, &scope, matcher, self.fetch_size()).await?;
        self.land_hit(&topic, found.hit, found.summary, decoder).await
    }

    /// `kfindnext ...`: следующее совпадение после курсора в его партиции.
    pub async fn find_next(&self, args: &SearchArgs) -> Result<FindView> {
        let topic = self.resolve_topic(args.topic.as_deref()).await?;
        let cursor = self.cursor_for(&topic).await.ok_or(EngineError::NoCursor)?;
        let (matcher, decoder) = self.matcher(&topic, args).await?;
        let (partition, from) = match args.partition {
            Some(p) if p != cursor.partition => (p, 0),
            _ => (cursor.partition, cursor.next_offset),
        };
        let found = search::find_next(
            self.broker().await?,
            &topic,
            partition,
            from,
            matcher,
            self.fetch_size(),
        )
        .await?;
        self.land_hit(&topic, found.hit, found.summary, decoder).await
    }

    async fn land_hit(
        &self,
        topic: &str,
        hit: Option<Hit>,
        summary: ScanSummary,
        decoder: Option<Arc<Decoder>>,
    ) -> Result<FindView> {
        let message = match hit {
            Some(hit) => {
                let partition = hit.partition;
                let (view, record) = self.hit_view(topic, hit);
                self.cursors
                    .lock()
                    .await
                    .set_current(topic, partition, &record, decoder);
                Some(view)
            }
            None => None,
        };
        Ok(FindView { message, summary })
    }

    /// `kfind ... -o <sink>`
    pub async fn export(&self, args: &SearchArgs, sink_target: &str) -> Result<ScanSummary> {
        let topic = self.resolve_topic(args.topic.as_deref()).await?;
        let (matcher, _) = self.matcher(&topic, args).await?;
        let scope = self.scope(&topic, args.partition).await?;
        let broker = self.broker().await?;
        let mut sink = sink::open_sink(sink_target, broker.clone()).await?;
        search::find_and_export(broker, &scope, matcher, self.fetch_size(), sink.as_mut()).await
    }

    // ── Produce ───────────────────────────────────────────────────

    /// `kput [topic] key message [-p partition] [-s schema]`.
    /// Со схемой `message` — JSON, кодируется декодером.
    pub async fn put(
        &self,
        topic: Option<&str>,
        key: &str,
        message: &str,
        partition: Option<i32>,
        schema: Option<&str>,
    ) -> Result<ProduceAck> {
        let topic = self.resolve_topic(topic).await?;
        let payload = match schema {
            Some(reference) => {
                let decoder = self.decoders.lookup(reference)?;
                let value: serde_json::Value = serde_json::from_str(message)
                    .map_err(|e| EngineError::syntax(format!("message is not valid JSON: {e}")))?;
                decoder.encode(&value)?
            }
            None => parse_bytes_arg(message),
        };
        let broker = self.broker().await?;
        let ack = broker
            .produce(&topic, partition, parse_bytes_arg(key), payload)
            .await
            .map_err(|e| EngineError::from(e).with_context(format!("put to '{topic}'")))?;
        tracing::info!(topic = %topic, partition = ack.partition, offset = ack.offset, "message published");
        Ok(ack)
    }

    // ── Consumer group offsets ────────────────────────────────────

    async fn group_target(&self, topic: Option<&str>, partition: Option<i32>) -> Result<TopicPartition> {
        let locator = Locator {
            topic: topic.map(str::to_string),
            partition,
            schema: None,
        };
        let (topic, partition, _) = self.locate(&locator).await?;
        Ok(TopicPartition::new(topic, partition))
    }

    /// `kcommit [topic] [partition] group [offset]`. Offset по умолчанию —
    /// next offset курсора.
    pub async fn commit(
        &self,
        topic: Option<&str>,
        partition: Option<i32>,
        group: &str,
        offset: Option<i64>,
    ) -> Result<(TopicPartition, i64)> {
        let tp = self.group_target(topic, partition).await?;
        let offset = match offset {
            Some(o) => o,
            None => {
                let cursor = self.cursor_for(&tp.topic).await.ok_or(EngineError::NoCursor)?;
                cursor.next_offset
            }
        };
        self.connection().await?.offsets.commit(group, &tp, offset).await?;
        tracing::info!(group = %group, tp = %tp, offset, "offset committed");
        Ok((tp, offset))
    }

    /// `kfetch [topic] [partition] group`
    pub async fn committed(
        &self,
        topic: Option<&str>,
        partition: Option<i32>,
        group: &str,
    ) -> Result<(TopicPartition, Option<i64>)> {
        let tp = self.group_target(topic, partition).await?;
        let offset = self.connection().await?.offsets.committed(group, &tp).await?;
        Ok((tp, offset))
    }

    /// `kreset [topic] [partition] group [offset]`. Offset по умолчанию —
    /// первый доступный.
    pub async fn reset(
        &self,
        topic: Option<&str>,
        partition: Option<i32>,
        group: &str,
        offset: Option<i64>,
    ) -> Result<(TopicPartition, i64)> {
        let tp = self.group_target(topic, partition).await?;
        let offset = match offset {
            Some(o) => o,
            None => self.broker().await?.offsets(&tp.topic, tp.partition).await?.start,
        };
        self.connection().await?.offsets.commit(group, &tp, offset).await?;
        tracing::info!(group = %group, tp = %tp, offset, "offset reset");
        Ok((tp, offset))
    }

    // ── Monitoring ────────────────────────────────────────────────

    /// `kinbound [prefix] [-w seconds]`
    pub async fn inbound(&self, prefix: Option<&str>, wait: Option<Duration>) -> Result<Vec<Inbound>> {
        let broker = self.broker().await?;
        let mut tracker = self.inbound.lock().await;
        tracker
            .poll_with_baseline(broker.as_ref(), prefix, wait, self.inbound_wait)
            .await
    }

    /// `kstats [topic] [p0] [p1]`
    pub async fn stats(
        &self,
        topic: Option<&str>,
        range: Option<(i32, Option<i32>)>,
    ) -> Result<(String, Vec<PartitionStats>)> {
        let topic = self.resolve_topic(topic).await?;
        let broker = self.broker().await?;
        let range = range.map(|(p0, p1)| (p0, p1.unwrap_or(p0)));
        let stats = self.partition_stats(broker.as_ref(), &topic, range).await?;
        Ok((topic, stats))
    }

    async fn partition_stats(
        &self,
        broker: &dyn Broker,
        topic: &str,
        range: Option<(i32, i32)>,
    ) -> Result<Vec<PartitionStats>> {
        let mut stats = Vec::new();
        for partition in broker.partitions(topic).await? {
            if range.is_some_and(|(lo, hi)| partition < lo || partition > hi) {
                continue;
            }
            let offsets: PartitionOffsets = broker.offsets(topic, partition).await?;
            stats.push(PartitionStats {
                partition,
                start: offsets.start,
                end: offsets.end,
                count: offsets.count(),
            });
        }
        Ok(stats)
    }
}
