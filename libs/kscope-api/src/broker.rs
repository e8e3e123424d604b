use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{BrokerError, MessageRecord, PartitionOffsets, ProduceAck, TopicPartition};

/// Future, возвращаемый всеми методами broker access layer.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

// ════════════════════════════════════════════════════════════════
//  Broker access traits
// ════════════════════════════════════════════════════════════════

/// Доступ к кластеру: метаданные, offset'ы, fetch и produce.
///
/// Сессия не знает о wire-протоколе — для неё брокер это только этот
/// трейт. Реализации: in-memory broker (built-in), сетевые клиенты.
pub trait Broker: Send + Sync {
    /// Список всех topic'ов кластера.
    fn topics(&self) -> BrokerFuture<'_, Vec<String>>;

    /// Номера партиций topic'а в порядке возрастания.
    /// Ошибка `NotFound` если topic не существует.
    fn partitions(&self, topic: &str) -> BrokerFuture<'_, Vec<i32>>;

    /// Текущие границы партиции (start, high-water mark).
    fn offsets(&self, topic: &str, partition: i32) -> BrokerFuture<'_, PartitionOffsets>;

    /// Первый offset, чей timestamp >= `ts_ms`. None если таких нет.
    fn offset_for_time(
        &self,
        topic: &str,
        partition: i32,
        ts_ms: i64,
    ) -> BrokerFuture<'_, Option<i64>>;

    /// Прочитать пачку сообщений начиная с `offset` (или ближайшего
    /// следующего доступного). Суммарный размер ограничен `max_bytes`,
    /// но первое доступное сообщение возвращается всегда.
    /// Пустой Vec = за `offset` данных нет.
    fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: usize,
    ) -> BrokerFuture<'_, Vec<MessageRecord>>;

    /// Опубликовать сообщение. `partition = None` — брокер выбирает
    /// партицию по ключу.
    fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Vec<u8>,
        payload: Vec<u8>,
    ) -> BrokerFuture<'_, ProduceAck>;

    /// Закрыть соединения. Вызывается один раз при завершении сессии.
    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Хранилище committed offset'ов consumer group
/// (coordination service в терминах кластера).
pub trait OffsetStore: Send + Sync {
    /// Записать offset группы для партиции.
    fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) -> BrokerFuture<'_, ()>;

    /// Прочитать committed offset. None если группа ещё не коммитила.
    fn committed(&self, group: &str, tp: &TopicPartition) -> BrokerFuture<'_, Option<i64>>;
}

/// Установленное соединение с кластером.
#[derive(Clone)]
pub struct Connection {
    pub broker: Arc<dyn Broker>,
    pub offsets: Arc<dyn OffsetStore>,
}

/// Фабрика соединений. Сессия вызывает `connect` лениво —
/// при первой команде, которой нужен брокер.
pub trait BrokerFactory: Send + Sync {
    fn connect(&self) -> BrokerFuture<'_, Connection>;
}
