//! Вычисление следующей/предыдущей позиции курсора с переходом
//! через границу партиции.
//!
//! Переход однократный: если соседняя партиция пуста, позиции нет.
//! Дальше пустых партиций навигация не ищет.

use kscope_api::Broker;

use crate::cursor::Cursor;
use crate::error::{EngineError, Result};

/// Целевая позиция навигации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub const DEFAULT_ADVANCE: i64 = 0;
pub const DEFAULT_RETREAT: i64 = 1;

/// Позиция `next_offset + delta`; за последним offset'ом — первая
/// позиция партиции `(p + 1) mod (max + 1)`.
pub async fn advance(broker: &dyn Broker, cursor: &Cursor, delta: i64) -> Result<Option<Position>> {
    let topic = cursor.topic.as_str();
    let candidate = cursor.next_offset.saturating_add(delta);
    let offsets = broker.offsets(topic, cursor.partition).await?;

    match offsets.last() {
        Some(last) if candidate <= last => {
            return Ok(Some(Position {
                topic: topic.to_string(),
                partition: cursor.partition,
                offset: candidate.max(offsets.start),
            }));
        }
        _ => {}
    }

    let (_, max) = partition_range(broker, topic).await?;
    let target = (cursor.partition + 1).rem_euclid(max + 1);
    tracing::debug!(topic = %topic, from = cursor.partition, to = target, "advance wraps partition");
    let offsets = broker.offsets(topic, target).await?;
    Ok(offsets.first().map(|offset| Position {
        topic: topic.to_string(),
        partition: target,
        offset,
    }))
}

/// Позиция `max(0, offset - delta)`; ниже первого доступного offset'а
/// (retention сдвинул start) — последняя позиция предыдущей партиции
/// (или `max`, если курсор на `min`).
pub async fn retreat(broker: &dyn Broker, cursor: &Cursor, delta: i64) -> Result<Option<Position>> {
    let topic = cursor.topic.as_str();
    let candidate = cursor.offset.saturating_sub(delta).max(0);
    let offsets = broker.offsets(topic, cursor.partition).await?;

    match (offsets.first(), offsets.last()) {
        (Some(first), Some(last)) if candidate >= first => {
            return Ok(Some(Position {
                topic: topic.to_string(),
                partition: cursor.partition,
                offset: candidate.min(last),
            }));
        }
        _ => {}
    }

    let (min, max) = partition_range(broker, topic).await?;
    let target = if cursor.partition <= min {
        max
    } else {
        (cursor.partition - 1).rem_euclid(max + 1)
    };
    tracing::debug!(topic = %topic, from = cursor.partition, to = target, "retreat wraps partition");
    let offsets = broker.offsets(topic, target).await?;
    Ok(offsets.last().map(|offset| Position {
        topic: topic.to_string(),
        partition: target,
        offset,
    }))
}

/// Диапазон номеров партиций topic'а `[min, max]`.
pub async fn partition_range(broker: &dyn Broker, topic: &str) -> Result<(i32, i32)> {
    let partitions = broker.partitions(topic).await?;
    match (partitions.iter().min(), partitions.iter().max()) {
        (Some(&min), Some(&max)) => Ok((min, max)),
        _ => Err(EngineError::NotFound(format!("topic '{topic}' has no partitions"))),
    }
}
