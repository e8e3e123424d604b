use std::collections::BTreeMap;
use std::sync::Arc;

use kscope_api::MessageRecord;

use crate::decoder::Decoder;

/// Позиция сессии в topic'е: последнее полученное сообщение.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub next_offset: i64,
    pub decoder: Option<Arc<Decoder>>,
}

impl Cursor {
    pub fn decoder_ref(&self) -> Option<&str> {
        self.decoder.as_deref().map(Decoder::reference)
    }
}

/// Курсоры по topic'ам и текущий topic — "рабочая директория" сессии.
///
/// Курсор создаётся/заменяется при каждом успешном получении сообщения
/// и не удаляется до конца сессии.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    cursors: BTreeMap<String, Cursor>,
    current: Option<String>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str) -> Option<&Cursor> {
        self.cursors.get(topic)
    }

    pub fn current(&self) -> Option<&Cursor> {
        self.current.as_deref().and_then(|t| self.cursors.get(t))
    }

    pub fn current_topic(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Поставить курсор topic'а на `record` и сделать topic текущим.
    pub fn set_current(
        &mut self,
        topic: &str,
        partition: i32,
        record: &MessageRecord,
        decoder: Option<Arc<Decoder>>,
    ) -> &Cursor {
        tracing::debug!(topic = %topic, partition, offset = record.offset, "cursor moved");
        self.current = Some(topic.to_string());
        let cursor = Cursor {
            topic: topic.to_string(),
            partition,
            offset: record.offset,
            next_offset: record.offset + 1,
            decoder,
        };
        self.cursors.insert(topic.to_string(), cursor);
        &self.cursors[topic]
    }

    /// Сменить текущий topic. false если курсора для topic'а нет.
    pub fn switch_current(&mut self, topic: &str) -> bool {
        if self.cursors.contains_key(topic) {
            self.current = Some(topic.to_string());
            true
        } else {
            false
        }
    }

    /// Курсоры с именем topic'а по префиксу, отсортированы по topic'у.
    pub fn list(&self, prefix: Option<&str>) -> Vec<&Cursor> {
        self.cursors
            .values()
            .filter(|c| prefix.is_none_or(|p| c.topic.starts_with(p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64) -> MessageRecord {
        MessageRecord {
            offset,
            next_offset: offset + 1,
            timestamp_ms: 0,
            key: vec![],
            payload: b"x".to_vec(),
        }
    }

    #[test]
    fn test_set_current_invariant() {
        let mut registry = CursorRegistry::new();
        assert!(registry.current().is_none());

        let cursor = registry.set_current("orders", 2, &record(41), None);
        assert_eq!(cursor.partition, 2);
        assert_eq!(cursor.offset, 41);
        assert_eq!(cursor.next_offset, 42);
        assert_eq!(registry.current().map(|c| c.topic.as_str()), Some("orders"));
    }

    #[test]
    fn test_replace_keeps_one_cursor_per_topic() {
        let mut registry = CursorRegistry::new();
        registry.set_current("orders", 0, &record(0), None);
        registry.set_current("orders", 1, &record(5), None);
        assert_eq!(registry.list(None).len(), 1);
        assert_eq!(registry.get("orders").map(|c| c.offset), Some(5));
    }

    #[test]
    fn test_switch_current() {
        let mut registry = CursorRegistry::new();
        registry.set_current("orders", 0, &record(0), None);
        registry.set_current("payments", 0, &record(3), None);
        assert_eq!(registry.current_topic(), Some("payments"));

        assert!(registry.switch_current("orders"));
        assert_eq!(registry.current_topic(), Some("orders"));

        assert!(!registry.switch_current("unknown"));
        assert_eq!(registry.current_topic(), Some("orders"));
    }

    #[test]
    fn test_list_prefix_sorted() {
        let mut registry = CursorRegistry::new();
        for topic in ["payments", "orders.eu", "orders.us", "audit"] {
            registry.set_current(topic, 0, &record(0), None);
        }
        let topics: Vec<&str> = registry.list(Some("orders")).iter().map(|c| c.topic.as_str()).collect();
        assert_eq!(topics, vec!["orders.eu", "orders.us"]);

        let all: Vec<&str> = registry.list(None).iter().map(|c| c.topic.as_str()).collect();
        assert_eq!(all, vec!["audit", "orders.eu", "orders.us", "payments"]);
    }
}
