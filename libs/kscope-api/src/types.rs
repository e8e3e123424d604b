use base64::Engine;
use serde::Serialize;

// ════════════════════════════════════════════════════════════════
//  TopicPartition
// ════════════════════════════════════════════════════════════════

/// Адрес партиции: имя topic'а + номер партиции.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

// ════════════════════════════════════════════════════════════════
//  PartitionOffsets
// ════════════════════════════════════════════════════════════════

/// Границы партиции на момент запроса.
///
/// `start` — первый доступный offset (после retention),
/// `end` — high-water mark, т.е. offset следующей записи.
/// Партиция пуста когда `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PartitionOffsets {
    pub start: i64,
    pub end: i64,
}

impl PartitionOffsets {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Первый доступный offset. None для пустой партиции.
    pub fn first(&self) -> Option<i64> {
        (self.end > self.start).then_some(self.start)
    }

    /// Последний доступный offset. None для пустой партиции.
    pub fn last(&self) -> Option<i64> {
        (self.end > self.start).then(|| self.end - 1)
    }

    /// Количество сообщений, доступных для чтения.
    pub fn count(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

// ════════════════════════════════════════════════════════════════
//  MessageRecord
// ════════════════════════════════════════════════════════════════

/// Сырой результат fetch: одно сообщение партиции.
///
/// Broker access layer отдаёт байты как есть, интерпретация
/// payload'а — задача декодера на стороне сессии.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub offset: i64,
    /// Offset, с которого продолжать чтение (обычно `offset + 1`).
    pub next_offset: i64,
    /// Время append'а в брокер, Unix ms.
    pub timestamp_ms: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl MessageRecord {
    /// Размер сообщения для учёта fetch size.
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.len()
    }
}

impl Serialize for MessageRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("MessageRecord", 5)?;
        s.serialize_field("offset", &self.offset)?;
        s.serialize_field("next_offset", &self.next_offset)?;
        s.serialize_field("timestamp_ms", &self.timestamp_ms)?;
        s.serialize_field("key", &BytesField(&self.key))?;
        s.serialize_field("payload", &BytesField(&self.payload))?;
        s.end()
    }
}

/// UTF-8 текст как есть, бинарные данные — base64.
struct BytesField<'a>(&'a [u8]);

impl Serialize for BytesField<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(self.0);
                serializer.serialize_str(&format!("base64:{encoded}"))
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Produce
// ════════════════════════════════════════════════════════════════

/// Подтверждение публикации: куда легла запись.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProduceAck {
    pub partition: i32,
    pub offset: i64,
}
