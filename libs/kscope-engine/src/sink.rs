use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use kscope_api::{Broker, MessageRecord};

use crate::error::{EngineError, Result};

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Сообщение, выгружаемое в sink.
#[derive(Debug, Clone, Copy)]
pub struct Exported<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub record: &'a MessageRecord,
    pub decoded: Option<&'a serde_json::Value>,
}

/// Получатель найденных сообщений (`kfind ... -o <sink>`).
pub trait MessageSink: Send {
    fn write<'a>(&'a mut self, message: Exported<'a>) -> SinkFuture<'a>;

    fn flush(&mut self) -> SinkFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    /// Человекочитаемое описание для вывода и логов.
    fn describe(&self) -> String;
}

/// Открыть sink по адресу: `file:<path>` или имя topic'а.
pub async fn open_sink(target: &str, broker: Arc<dyn Broker>) -> Result<Box<dyn MessageSink>> {
    if let Some(path) = target.strip_prefix("file:") {
        if path.is_empty() {
            return Err(EngineError::syntax("file sink requires a path: file:<path>"));
        }
        return Ok(Box::new(FileSink::create(path)?));
    }
    if target.is_empty() {
        return Err(EngineError::syntax("expected sink: topic name or file:<path>"));
    }
    // fail before the scan if the target topic does not exist
    broker
        .partitions(target)
        .await
        .map_err(|e| EngineError::from(e).with_context(format!("sink '{target}'")))?;
    Ok(Box::new(TopicSink::new(broker, target)))
}

// ═══════════════════════════════════════════════════════════════
//  TopicSink
// ═══════════════════════════════════════════════════════════════

/// Перепубликует key/payload в другой topic; партицию выбирает брокер.
pub struct TopicSink {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl TopicSink {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }
}

impl MessageSink for TopicSink {
    fn write<'a>(&'a mut self, message: Exported<'a>) -> SinkFuture<'a> {
        Box::pin(async move {
            let ack = self
                .broker
                .produce(
                    &self.topic,
                    None,
                    message.record.key.clone(),
                    message.record.payload.clone(),
                )
                .await?;
            tracing::trace!(
                from = %message.topic,
                to = %self.topic,
                partition = ack.partition,
                offset = ack.offset,
                "exported message"
            );
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("topic '{}'", self.topic)
    }
}

// ═══════════════════════════════════════════════════════════════
//  FileSink
// ═══════════════════════════════════════════════════════════════

/// JSON lines: одна строка на сообщение.
pub struct FileSink {
    path: PathBuf,
    writer: std::io::BufWriter<std::fs::File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::create(&path).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", path.display()),
            ))
        })?;
        Ok(Self {
            path,
            writer: std::io::BufWriter::new(file),
        })
    }
}

impl MessageSink for FileSink {
    fn write<'a>(&'a mut self, message: Exported<'a>) -> SinkFuture<'a> {
        Box::pin(async move {
            let mut line = serde_json::json!({
                "topic": message.topic,
                "partition": message.partition,
            });
            if let (Some(obj), Ok(serde_json::Value::Object(record))) =
                (line.as_object_mut(), serde_json::to_value(message.record))
            {
                obj.extend(record);
                if let Some(decoded) = message.decoded {
                    obj.insert("decoded".into(), decoded.clone());
                }
            }
            serde_json::to_writer(&mut self.writer, &line)
                .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
            self.writer.write_all(b"\n")?;
            Ok(())
        })
    }

    fn flush(&mut self) -> SinkFuture<'_> {
        Box::pin(async move {
            self.writer.flush()?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("file '{}'", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::broker_with;

    fn record(offset: i64, payload: &[u8]) -> MessageRecord {
        MessageRecord {
            offset,
            next_offset: offset + 1,
            timestamp_ms: 5,
            key: b"k".to_vec(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let broker = broker_with("orders", &[1]).await;

        let mut sink = open_sink(&format!("file:{}", path.display()), broker).await.unwrap();
        let decoded = serde_json::json!({"price": 150});
        let first = record(0, b"150");
        let second = record(1, &[0xff, 0x00]);
        sink.write(Exported { topic: "orders", partition: 0, record: &first, decoded: Some(&decoded) })
            .await
            .unwrap();
        sink.write(Exported { topic: "orders", partition: 1, record: &second, decoded: None })
            .await
            .unwrap();
        sink.flush().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"], "150");
        assert_eq!(lines[0]["decoded"]["price"], 150);
        assert_eq!(lines[1]["partition"], 1);
        assert_eq!(lines[1]["payload"], "base64:/wA=");
    }

    #[tokio::test]
    async fn test_topic_sink_republishes() {
        let broker = broker_with("orders", &[1]).await;
        broker.create_topic("archive", 1, 100).await;

        let mut sink = open_sink("archive", broker.clone()).await.unwrap();
        assert_eq!(sink.describe(), "topic 'archive'");
        let msg = record(3, b"hello");
        sink.write(Exported { topic: "orders", partition: 0, record: &msg, decoded: None })
            .await
            .unwrap();

        let copied = broker.fetch("archive", 0, 0, 1024).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].payload, b"hello");
        assert_eq!(copied[0].key, b"k");
    }

    #[tokio::test]
    async fn test_missing_topic_sink() {
        let broker = broker_with("orders", &[1]).await;
        assert!(open_sink("nowhere", broker.clone()).await.is_err());
        let Err(err) = open_sink("file:", broker).await else {
            panic!("empty file path accepted");
        };
        assert!(err.is_syntax(), "{err}");
    }
}
