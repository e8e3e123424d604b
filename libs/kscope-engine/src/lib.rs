pub mod condition;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod inbound;
pub mod navigation;
pub mod search;
pub mod session;
pub mod sink;

pub use condition::{compile, compile_comparison, Condition, Literal, Operator, Target};
pub use cursor::{Cursor, CursorRegistry};
pub use decoder::{DecodedMessage, Decoder, DecoderCache};
pub use error::{EngineError, Result};
pub use inbound::{Inbound, InboundSnapshot, InboundTracker};
pub use navigation::{advance, retreat, Position};
pub use search::{FindResult, Hit, Matcher, ScanSummary, Scope};
pub use session::{
    CursorView, FindView, Locator, MessageView, PartitionStats, SearchArgs, Session,
    SessionConfig, TopicInfo, DEFAULT_FETCH_SIZE, DEFAULT_INBOUND_WAIT,
};
pub use sink::{open_sink, Exported, FileSink, MessageSink, TopicSink};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use broker_memory::{MemoryBroker, MemoryBrokerFactory};

    use crate::cursor::Cursor;
    use crate::decoder::Decoder;
    use crate::session::{Session, SessionConfig};

    pub(crate) const ORDER_SCHEMA: &str = r#"{
        "type": "record",
        "name": "Order",
        "fields": [
            {"name": "id", "type": "string"},
            {"name": "price", "type": "long"},
            {"name": "qty", "type": "int"},
            {"name": "note", "type": ["null", "string"], "default": null},
            {"name": "customer", "type": {
                "type": "record",
                "name": "Customer",
                "fields": [{"name": "tier", "type": "string"}]
            }}
        ]
    }"#;

    /// Topic с `counts[p]` сообщениями в партиции `p`: key `k{i}`,
    /// payload `"{i}"`, timestamp `1000 * (i + 1)`.
    pub(crate) async fn broker_with(topic: &str, counts: &[usize]) -> Arc<MemoryBroker> {
        broker_retaining(topic, counts, 100_000).await
    }

    /// Как `broker_with`, но партиция хранит только последние `retention`
    /// сообщений: start offset сдвинут на `counts[p] - retention`.
    pub(crate) async fn broker_retaining(
        topic: &str,
        counts: &[usize],
        retention: usize,
    ) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic(topic, counts.len() as i32, retention).await;
        for (p, &n) in counts.iter().enumerate() {
            for i in 0..n {
                broker
                    .append_at(
                        topic,
                        p as i32,
                        format!("k{i}").as_bytes(),
                        i.to_string().as_bytes(),
                        1000 * (i as i64 + 1),
                    )
                    .await
                    .unwrap();
            }
        }
        broker
    }

    pub(crate) fn cursor_at(topic: &str, partition: i32, offset: i64) -> Cursor {
        Cursor {
            topic: topic.to_string(),
            partition,
            offset,
            next_offset: offset + 1,
            decoder: None,
        }
    }

    pub(crate) fn order_payload(decoder: &Decoder, id: &str, price: i64, qty: i32) -> Vec<u8> {
        decoder
            .encode(&serde_json::json!({
                "id": id,
                "price": price,
                "qty": qty,
                "note": null,
                "customer": {"tier": "gold"}
            }))
            .unwrap()
    }

    pub(crate) fn session_with(broker: Arc<MemoryBroker>) -> Session {
        Session::new(
            Arc::new(MemoryBrokerFactory::new(broker)),
            SessionConfig::default(),
        )
    }
}
