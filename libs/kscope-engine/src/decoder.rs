use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use apache_avro::types::Value;
use apache_avro::Schema;

use kscope_api::{format_bytes, Field, RecordSchema, ScalarType};

use crate::error::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════
//  Decoder
// ═══════════════════════════════════════════════════════════════

/// Декодер payload'а по Avro-схеме (structured-record scheme).
///
/// Других схем сессия не поддерживает: ссылка на схему иного вида
/// отклоняется ещё при резолвинге, до первого fetch.
pub struct Decoder {
    reference: String,
    schema: Schema,
    fields: RecordSchema,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").field("reference", &self.reference).finish()
    }
}

impl Decoder {
    /// Загрузить декодер по ссылке: `path/to/schema.avsc` или `avro:path`.
    pub fn load(reference: &str) -> Result<Self> {
        let path = avro_schema_path(reference)?;
        let schema_str = std::fs::read_to_string(path).map_err(|e| EngineError::DecoderLookup {
            reference: reference.to_string(),
            detail: format!("failed to read schema file: {e}"),
        })?;
        Self::from_schema_str(reference, &schema_str)
    }

    /// Построить декодер из текста Avro-схемы.
    pub fn from_schema_str(reference: &str, schema_str: &str) -> Result<Self> {
        let schema = Schema::parse_str(schema_str).map_err(|e| EngineError::DecoderLookup {
            reference: reference.to_string(),
            detail: format!("failed to parse schema: {e}"),
        })?;
        let fields = record_fields(&schema);
        Ok(Self {
            reference: reference.to_string(),
            schema,
            fields,
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Плоская схема полей для приведения литералов в условиях.
    pub fn fields(&self) -> &RecordSchema {
        &self.fields
    }

    pub fn decode(&self, payload: &[u8]) -> Result<serde_json::Value> {
        let mut reader = payload;
        let avro_value = apache_avro::from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| EngineError::Decode(format!("avro: {e}")))?;
        Ok(avro_to_value(&avro_value))
    }

    pub fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let avro_value = value_to_avro(value, &self.schema)?;
        apache_avro::to_avro_datum(&self.schema, avro_value)
            .map_err(|e| EngineError::Decode(format!("avro encode: {e}")))
    }
}

/// Путь к .avsc по ссылке. Любой другой вид схемы — UnsupportedDecoder.
fn avro_schema_path(reference: &str) -> Result<&str> {
    if let Some((kind, rest)) = reference.split_once(':') {
        // "C:\..." is a path, not a kind prefix
        if kind.len() > 1 && kind.chars().all(|c| c.is_ascii_alphabetic()) {
            return match kind {
                "avro" => Ok(rest),
                _ => Err(EngineError::UnsupportedDecoder(reference.to_string())),
            };
        }
    }
    match std::path::Path::new(reference).extension().and_then(|e| e.to_str()) {
        Some("avsc") => Ok(reference),
        _ => Err(EngineError::UnsupportedDecoder(reference.to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════
//  DecodedMessage
// ═══════════════════════════════════════════════════════════════

/// Результат попытки декодирования payload'а.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Record(serde_json::Value),
    Failed(String),
}

impl DecodedMessage {
    /// Декодировать, если декодер привязан. Без декодера сообщение
    /// остаётся бинарным (None).
    pub fn attempt(payload: &[u8], decoder: Option<&Decoder>) -> Option<Self> {
        let decoder = decoder?;
        Some(match decoder.decode(payload) {
            Ok(value) => DecodedMessage::Record(value),
            Err(e) => DecodedMessage::Failed(e.to_string()),
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  DecoderCache
// ═══════════════════════════════════════════════════════════════

/// Кэш загруженных декодеров сессии, ключ — ссылка на схему.
///
/// Схема читается с диска один раз, дальше декодер разделяется
/// между курсорами через Arc.
#[derive(Debug, Default)]
pub struct DecoderCache {
    decoders: Mutex<HashMap<String, Arc<Decoder>>>,
}

impl DecoderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, reference: &str) -> Result<Arc<Decoder>> {
        let mut guard = match self.decoders.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("decoder cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if let Some(decoder) = guard.get(reference) {
            return Ok(decoder.clone());
        }
        let decoder = Arc::new(Decoder::load(reference)?);
        tracing::debug!(reference = %reference, fields = decoder.fields.fields.len(), "loaded decoder");
        guard.insert(reference.to_string(), decoder.clone());
        Ok(decoder)
    }

    /// Выбрать декодер для сообщения. Приоритет: явная ссылка из команды,
    /// затем декодер курсора topic'а, иначе — без декодирования.
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        cursor_decoder: Option<&Arc<Decoder>>,
    ) -> Result<Option<Arc<Decoder>>> {
        match explicit {
            Some(reference) => self.lookup(reference).map(Some),
            None => Ok(cursor_decoder.cloned()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Schema → RecordSchema
// ═══════════════════════════════════════════════════════════════

fn record_fields(schema: &Schema) -> RecordSchema {
    let mut fields = Vec::new();
    if let Schema::Record(record) = schema {
        for field in &record.fields {
            collect_field(&field.name, &field.schema, false, &mut fields);
        }
    }
    RecordSchema::new(fields)
}

/// Вложенные record'ы раскладываются в dot-пути (`customer.id`).
fn collect_field(path: &str, schema: &Schema, nullable: bool, out: &mut Vec<Field>) {
    match schema {
        // Nullable union: ["null", T] → nullable field
        Schema::Union(union_schema) => {
            let non_null: Vec<&Schema> = union_schema
                .variants()
                .iter()
                .filter(|v| !matches!(v, Schema::Null))
                .collect();
            if non_null.len() == 1 {
                collect_field(path, non_null[0], true, out);
            } else {
                out.push(Field::new(path, ScalarType::Json, true));
            }
        }
        Schema::Record(record) => {
            for field in &record.fields {
                collect_field(&format!("{path}.{}", field.name), &field.schema, nullable, out);
            }
        }
        other => {
            if let Some(scalar) = avro_schema_to_scalar(other) {
                out.push(Field::new(path, scalar, nullable));
            }
        }
    }
}

fn avro_schema_to_scalar(schema: &Schema) -> Option<ScalarType> {
    match schema {
        Schema::Boolean => Some(ScalarType::Bool),
        Schema::Int => Some(ScalarType::Int32),
        Schema::Long => Some(ScalarType::Int64),
        Schema::Float => Some(ScalarType::Float32),
        Schema::Double => Some(ScalarType::Float64),
        Schema::String | Schema::Enum(_) | Schema::Uuid => Some(ScalarType::String),
        Schema::Bytes | Schema::Fixed(_) => Some(ScalarType::Bytes),
        Schema::Date => Some(ScalarType::Date),
        Schema::TimeMillis | Schema::TimeMicros => Some(ScalarType::Int64),
        Schema::TimestampMillis
        | Schema::TimestampMicros
        | Schema::TimestampNanos
        | Schema::LocalTimestampMillis
        | Schema::LocalTimestampMicros
        | Schema::LocalTimestampNanos => Some(ScalarType::Timestamp),
        Schema::Decimal(_) | Schema::BigDecimal => Some(ScalarType::String),
        Schema::Array(_) | Schema::Map(_) => Some(ScalarType::Json),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════
//  Avro ↔ JSON conversion
// ═══════════════════════════════════════════════════════════════

fn avro_to_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Long(l) => serde_json::json!(l),
        Value::Float(f) => serde_json::json!(f),
        Value::Double(d) => serde_json::json!(d),
        Value::Bytes(b) | Value::Fixed(_, b) => serde_json::Value::String(format_bytes(b)),
        Value::String(s) | Value::Enum(_, s) => serde_json::Value::String(s.clone()),
        Value::Union(_, inner) => avro_to_value(inner),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(avro_to_value).collect()),
        Value::Map(entries) => {
            let map: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_value(v)))
                .collect();
            serde_json::Value::Object(map)
        }
        Value::Record(fields) => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_value(v)))
                .collect();
            serde_json::Value::Object(map)
        }
        Value::Date(d) => serde_json::json!(d),
        Value::TimeMillis(t) => serde_json::json!(t),
        Value::TimeMicros(t) => serde_json::json!(t),
        Value::TimestampMillis(t) => serde_json::json!(t),
        Value::TimestampMicros(t) => serde_json::json!(t),
        Value::TimestampNanos(t) => serde_json::json!(t),
        Value::Decimal(d) => {
            let bytes: Vec<u8> = d.try_into().unwrap_or_default();
            serde_json::Value::String(format_bytes(&bytes))
        }
        Value::BigDecimal(d) => serde_json::Value::String(d.to_string()),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::Duration(_) => serde_json::Value::Null,
        Value::LocalTimestampMillis(t) => serde_json::json!(t),
        Value::LocalTimestampMicros(t) => serde_json::json!(t),
        Value::LocalTimestampNanos(t) => serde_json::json!(t),
    }
}

fn value_to_avro(val: &serde_json::Value, schema: &Schema) -> Result<Value> {
    match (val, schema) {
        (val, Schema::Union(union_schema)) => {
            // first variant that accepts the value wins
            for (idx, variant) in union_schema.variants().iter().enumerate() {
                if let Ok(v) = value_to_avro(val, variant) {
                    if v.validate(variant) {
                        return Ok(Value::Union(idx as u32, Box::new(v)));
                    }
                }
            }
            Err(EngineError::Decode(format!("avro: cannot convert {val} to union")))
        }
        (serde_json::Value::Null, _) => Ok(Value::Null),
        (serde_json::Value::Bool(b), _) => Ok(Value::Boolean(*b)),
        (serde_json::Value::Number(n), Schema::Int) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int)
            .ok_or_else(|| EngineError::Decode(format!("avro: {n} is not an int"))),
        (serde_json::Value::Number(n), Schema::Long) => n
            .as_i64()
            .map(Value::Long)
            .ok_or_else(|| EngineError::Decode(format!("avro: {n} is not a long"))),
        (serde_json::Value::Number(n), Schema::Float) => {
            Ok(Value::Float(n.as_f64().unwrap_or(0.0) as f32))
        }
        (serde_json::Value::Number(n), Schema::Double) => Ok(Value::Double(n.as_f64().unwrap_or(0.0))),
        (serde_json::Value::Number(n), _) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Long(i))
            } else {
                Ok(Value::Double(n.as_f64().unwrap_or(0.0)))
            }
        }
        (serde_json::Value::String(s), Schema::Enum(enum_schema)) => enum_schema
            .symbols
            .iter()
            .position(|sym| sym == s)
            .map(|idx| Value::Enum(idx as u32, s.clone()))
            .ok_or_else(|| EngineError::Decode(format!("avro: '{s}' is not an enum symbol"))),
        (serde_json::Value::String(s), Schema::Bytes) => Ok(Value::Bytes(s.as_bytes().to_vec())),
        (serde_json::Value::String(s), _) => Ok(Value::String(s.clone())),
        (serde_json::Value::Array(items), Schema::Array(inner)) => {
            let avro_items: Result<Vec<Value>> = items
                .iter()
                .map(|item| value_to_avro(item, &inner.items))
                .collect();
            Ok(Value::Array(avro_items?))
        }
        (serde_json::Value::Object(map), Schema::Record(record_schema)) => {
            let mut fields = Vec::new();
            for field in &record_schema.fields {
                let field_val = map.get(&field.name).unwrap_or(&serde_json::Value::Null);
                let avro_val = value_to_avro(field_val, &field.schema)?;
                fields.push((field.name.clone(), avro_val));
            }
            Ok(Value::Record(fields))
        }
        (val, _) => Err(EngineError::Decode(format!("avro: cannot convert {val} to {schema:?}"))),
    }
}
