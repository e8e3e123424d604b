//! Граница между сессией kscope и кластером: типы сообщений,
//! offset'ов и схем, трейты broker access layer.

pub mod broker;
pub mod error;
pub mod schema;
pub mod types;
pub mod util;

pub use broker::{Broker, BrokerFactory, BrokerFuture, Connection, OffsetStore};
pub use error::{BrokerError, ErrorKind};
pub use schema::{Field, RecordSchema, ScalarType};
pub use types::{MessageRecord, PartitionOffsets, ProduceAck, TopicPartition};
pub use util::{
    format_bytes, format_instant, now_ms, parse_bytes_arg, parse_dotted_hex, parse_instant,
    resolve_path,
};
