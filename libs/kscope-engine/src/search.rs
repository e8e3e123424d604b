//! Поиск по партициям topic'а скомпилированным условием.
//!
//! Партиции сканируются параллельно (JoinSet), но результат всегда
//! упорядочен по возрастанию partition/offset.

use std::sync::Arc;

use kscope_api::{Broker, MessageRecord};
use tokio::task::JoinSet;

use crate::condition::{Condition, Target};
use crate::decoder::Decoder;
use crate::error::{EngineError, Result};
use crate::sink::{Exported, MessageSink};

// ═══════════════════════════════════════════════════════════════
//  Matcher
// ═══════════════════════════════════════════════════════════════

/// Условие + декодер: компилируется один раз на операцию и
/// применяется к каждому сообщению.
#[derive(Debug)]
pub struct Matcher {
    condition: Condition,
    decoder: Option<Arc<Decoder>>,
}

enum Outcome {
    Matched(Option<serde_json::Value>),
    Rejected,
    DecodeFailed,
}

impl Matcher {
    pub fn new(condition: Condition, decoder: Option<Arc<Decoder>>) -> Self {
        Self { condition, decoder }
    }

    fn check(&self, record: &MessageRecord) -> Outcome {
        match &self.decoder {
            None => {
                if self.condition.evaluate(Target::Raw(record)) {
                    Outcome::Matched(None)
                } else {
                    Outcome::Rejected
                }
            }
            Some(decoder) => match decoder.decode(&record.payload) {
                Ok(value) if self.condition.evaluate(Target::Decoded(&value)) => {
                    Outcome::Matched(Some(value))
                }
                Ok(_) => Outcome::Rejected,
                Err(e) => {
                    tracing::trace!(offset = record.offset, error = %e, "skipping undecodable message");
                    Outcome::DecodeFailed
                }
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Results
// ═══════════════════════════════════════════════════════════════

/// Итог сканирования: сколько совпало, просмотрено, не декодировалось.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub matched: u64,
    pub scanned: u64,
    pub decode_failures: u64,
}

impl ScanSummary {
    fn merge(&mut self, other: ScanSummary) {
        self.matched += other.matched;
        self.scanned += other.scanned;
        self.decode_failures += other.decode_failures;
    }

    /// Скан, в котором не декодировалось ни одно сообщение, — ошибка,
    /// а не "ноль совпадений".
    pub fn ensure_decoded(self) -> Result<Self> {
        if self.scanned > 0 && self.decode_failures == self.scanned {
            return Err(EngineError::Decode(format!(
                "none of {} scanned messages could be decoded",
                self.scanned
            )));
        }
        Ok(self)
    }
}

/// Найденное сообщение.
#[derive(Debug, Clone)]
pub struct Hit {
    pub partition: i32,
    pub record: MessageRecord,
    pub decoded: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct FindResult {
    pub hit: Option<Hit>,
    pub summary: ScanSummary,
}

// ═══════════════════════════════════════════════════════════════
//  PartitionScanner
// ═══════════════════════════════════════════════════════════════

/// Читает партицию пачками до high-water mark, зафиксированного
/// на старте сканирования.
pub struct PartitionScanner {
    broker: Arc<dyn Broker>,
    topic: String,
    partition: i32,
    next: i64,
    end: i64,
    fetch_size: usize,
}

impl PartitionScanner {
    /// `from = None` — с первого доступного offset'а.
    pub async fn open(
        broker: Arc<dyn Broker>,
        topic: &str,
        partition: i32,
        from: Option<i64>,
        fetch_size: usize,
    ) -> Result<Self> {
        let offsets = broker.offsets(topic, partition).await?;
        let next = from.map_or(offsets.start, |f| f.max(offsets.start));
        Ok(Self {
            broker,
            topic: topic.to_string(),
            partition,
            next,
            end: offsets.end,
            fetch_size,
        })
    }

    /// Следующая пачка; None — партиция дочитана.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<MessageRecord>>> {
        if self.next >= self.end {
            return Ok(None);
        }
        let mut batch = self
            .broker
            .fetch(&self.topic, self.partition, self.next, self.fetch_size)
            .await?;
        batch.retain(|r| r.offset < self.end);
        match batch.last() {
            Some(last) => self.next = last.next_offset,
            None => return Ok(None),
        }
        Ok(Some(batch))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Operations
// ═══════════════════════════════════════════════════════════════

/// Область сканирования: topic и его партиции.
#[derive(Debug, Clone)]
pub struct Scope {
    pub topic: String,
    pub partitions: Vec<i32>,
}

struct PartitionScan {
    partition: i32,
    summary: ScanSummary,
    first: Option<Hit>,
}

async fn scan_partition(
    broker: Arc<dyn Broker>,
    topic: String,
    partition: i32,
    from: Option<i64>,
    matcher: Arc<Matcher>,
    fetch_size: usize,
    first_only: bool,
) -> Result<PartitionScan> {
    let mut scanner = PartitionScanner::open(broker, &topic, partition, from, fetch_size).await?;
    let mut summary = ScanSummary::default();
    let mut first = None;

    'scan: while let Some(batch) = scanner.next_batch().await? {
        for record in batch {
            summary.scanned += 1;
            match matcher.check(&record) {
                Outcome::Matched(decoded) => {
                    summary.matched += 1;
                    if first.is_none() {
                        first = Some(Hit { partition, record, decoded });
                    }
                    if first_only {
                        break 'scan;
                    }
                }
                Outcome::Rejected => {}
                Outcome::DecodeFailed => summary.decode_failures += 1,
            }
        }
    }

    tracing::debug!(
        topic = %topic,
        partition,
        scanned = summary.scanned,
        matched = summary.matched,
        "partition scanned"
    );
    Ok(PartitionScan { partition, summary, first })
}

async fn scan_all(
    broker: Arc<dyn Broker>,
    scope: &Scope,
    matcher: Arc<Matcher>,
    fetch_size: usize,
    first_only: bool,
) -> Result<Vec<PartitionScan>> {
    let mut tasks = JoinSet::new();
    for &partition in &scope.partitions {
        tasks.spawn(scan_partition(
            broker.clone(),
            scope.topic.clone(),
            partition,
            None,
            matcher.clone(),
            fetch_size,
            first_only,
        ));
    }

    let mut scans = Vec::with_capacity(scope.partitions.len());
    while let Some(joined) = tasks.join_next().await {
        let scan = joined.map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        scans.push(scan);
    }
    scans.sort_by_key(|s| s.partition);
    Ok(scans)
}

/// Количество совпадений во всех партициях области.
pub async fn count(
    broker: Arc<dyn Broker>,
    scope: &Scope,
    matcher: Arc<Matcher>,
    fetch_size: usize,
) -> Result<ScanSummary> {
    let mut total = ScanSummary::default();
    for scan in scan_all(broker, scope, matcher, fetch_size, false).await? {
        total.merge(scan.summary);
    }
    total.ensure_decoded()
}

/// Первое совпадение в порядке возрастания partition/offset.
pub async fn find_first(
    broker: Arc<dyn Broker>,
    scope: &Scope,
    matcher: Arc<Matcher>,
    fetch_size: usize,
) -> Result<FindResult> {
    let mut summary = ScanSummary::default();
    let mut hit = None;
    for scan in scan_all(broker, scope, matcher, fetch_size, true).await? {
        summary.merge(scan.summary);
        if hit.is_none() {
            hit = scan.first;
        }
    }
    if hit.is_none() {
        summary.ensure_decoded()?;
    }
    Ok(FindResult { hit, summary })
}

/// Следующее совпадение в одной партиции, начиная с `from`.
pub async fn find_next(
    broker: Arc<dyn Broker>,
    topic: &str,
    partition: i32,
    from: i64,
    matcher: Arc<Matcher>,
    fetch_size: usize,
) -> Result<FindResult> {
    let scan = scan_partition(
        broker,
        topic.to_string(),
        partition,
        Some(from),
        matcher,
        fetch_size,
        true,
    )
    .await?;
    if scan.first.is_none() {
        scan.summary.ensure_decoded()?;
    }
    Ok(FindResult { hit: scan.first, summary: scan.summary })
}

/// Выгрузить все совпадения в sink. `matched` — число записанных.
///
/// Партиции идут последовательно, чтобы порядок в sink совпадал
/// с порядком partition/offset.
pub async fn find_and_export(
    broker: Arc<dyn Broker>,
    scope: &Scope,
    matcher: Arc<Matcher>,
    fetch_size: usize,
    sink: &mut dyn MessageSink,
) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    for &partition in &scope.partitions {
        let mut scanner =
            PartitionScanner::open(broker.clone(), &scope.topic, partition, None, fetch_size).await?;
        while let Some(batch) = scanner.next_batch().await? {
            for record in &batch {
                summary.scanned += 1;
                match matcher.check(record) {
                    Outcome::Matched(decoded) => {
                        sink.write(Exported {
                            topic: &scope.topic,
                            partition,
                            record,
                            decoded: decoded.as_ref(),
                        })
                        .await?;
                        summary.matched += 1;
                    }
                    Outcome::Rejected => {}
                    Outcome::DecodeFailed => summary.decode_failures += 1,
                }
            }
        }
    }
    sink.flush().await?;
    tracing::info!(
        topic = %scope.topic,
        sink = %sink.describe(),
        exported = summary.matched,
        "export finished"
    );
    summary.ensure_decoded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::compile;
    use crate::test_support::{broker_with, order_payload, ORDER_SCHEMA};
    use broker_memory::MemoryBroker;

    fn raw_matcher(tokens: &[&str]) -> Arc<Matcher> {
        Arc::new(Matcher::new(compile(tokens, None).unwrap(), None))
    }

    fn scope(topic: &str, partitions: &[i32]) -> Scope {
        Scope { topic: topic.into(), partitions: partitions.to_vec() }
    }

    async fn orders_broker() -> (Arc<MemoryBroker>, Arc<Decoder>) {
        let decoder = Arc::new(Decoder::from_schema_str("orders.avsc", ORDER_SCHEMA).unwrap());
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 2, 1000).await;
        let rows = [(0, "a", 50, 1), (0, "b", 150, 2), (1, "c", 250, 9), (1, "d", 120, 1)];
        for (i, (p, id, price, qty)) in rows.into_iter().enumerate() {
            let payload = order_payload(&decoder, id, price, qty);
            broker.append_at("orders", p, id.as_bytes(), &payload, i as i64).await.unwrap();
        }
        (broker, decoder)
    }

    #[tokio::test]
    async fn test_count_raw_across_partitions() {
        // payloads are "0".."9" in p0 and "0".."4" in p1
        let broker = broker_with("orders", &[10, 5]).await;
        let summary = count(broker, &scope("orders", &[0, 1]), raw_matcher(&["value", ">=", "3"]), 4)
            .await
            .unwrap();
        assert_eq!(summary, ScanSummary { matched: 9, scanned: 15, decode_failures: 0 });
    }

    #[tokio::test]
    async fn test_count_decoded() {
        let (broker, decoder) = orders_broker().await;
        let condition = compile(&["price", ">", "100", "and", "qty", "<", "5"], Some(&decoder)).unwrap();
        let matcher = Arc::new(Matcher::new(condition, Some(decoder)));
        let summary = count(broker, &scope("orders", &[0, 1]), matcher, 1 << 20).await.unwrap();
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.scanned, 4);
    }

    #[tokio::test]
    async fn test_find_first_orders_by_partition() {
        let (broker, decoder) = orders_broker().await;
        let condition = compile(&["price", ">", "100"], Some(&decoder)).unwrap();
        let matcher = Arc::new(Matcher::new(condition, Some(decoder)));

        let found = find_first(broker, &scope("orders", &[0, 1]), matcher, 64).await.unwrap();
        let hit = found.hit.unwrap();
        assert_eq!((hit.partition, hit.record.offset), (0, 1));
        assert_eq!(hit.decoded.unwrap()["id"], "b");
    }

    #[tokio::test]
    async fn test_find_next_from_offset() {
        let broker = broker_with("orders", &[10]).await;
        let matcher = raw_matcher(&["value", ">", "2"]);

        let found = find_next(broker.clone(), "orders", 0, 5, matcher.clone(), 16).await.unwrap();
        assert_eq!(found.hit.map(|h| h.record.offset), Some(5));

        let none = find_next(broker, "orders", 0, 10, matcher, 16).await.unwrap();
        assert!(none.hit.is_none());
        assert_eq!(none.summary.scanned, 0);
    }

    #[tokio::test]
    async fn test_all_undecodable_is_error() {
        // raw text payloads do not parse as Order records
        let broker = broker_with("orders", &[3]).await;
        let decoder = Arc::new(Decoder::from_schema_str("orders.avsc", ORDER_SCHEMA).unwrap());
        let condition = compile(&["price", ">", "100"], Some(&decoder)).unwrap();
        let matcher = Arc::new(Matcher::new(condition, Some(decoder)));

        let err = count(broker, &scope("orders", &[0]), matcher, 1024).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_partial_decode_failures_are_reported() {
        let (broker, decoder) = orders_broker().await;
        broker.append_at("orders", 0, b"junk", b"\xff", 99).await.unwrap();
        let condition = compile(&["price", ">", "100"], Some(&decoder)).unwrap();
        let matcher = Arc::new(Matcher::new(condition, Some(decoder)));

        let summary = count(broker, &scope("orders", &[0, 1]), matcher, 1024).await.unwrap();
        assert_eq!(summary.matched, 3);
        assert_eq!(summary.scanned, 5);
        assert_eq!(summary.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_export_to_topic() {
        let broker = broker_with("orders", &[6, 6]).await;
        broker.create_topic("big", 1, 100).await;
        let mut sink = crate::sink::TopicSink::new(broker.clone(), "big");

        let summary = find_and_export(
            broker.clone(),
            &scope("orders", &[0, 1]),
            raw_matcher(&["value", ">=", "4"]),
            8,
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(summary.matched, 4);

        let copied = broker.fetch("big", 0, 0, 1 << 20).await.unwrap();
        let payloads: Vec<&[u8]> = copied.iter().map(|r| r.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"4".as_slice(), b"5", b"4", b"5"]);
    }
}
