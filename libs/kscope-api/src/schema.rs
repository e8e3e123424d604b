// ════════════════════════════════════════════════════════════════
//  Scalar Type
// ════════════════════════════════════════════════════════════════

/// Скалярные типы полей декодированной записи.
///
/// Используются компилятором условий для приведения литерала
/// к типу поля (`price > 100` → Int64/Float64 сравнение).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    /// Миллисекунды/микросекунды от epoch — сравниваются как Int64.
    Timestamp,
    /// Дни от epoch.
    Date,
    /// Вложенные record/map — сравниваются как текст.
    Json,
}

impl ScalarType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ScalarType::Int32 | ScalarType::Int64 | ScalarType::Timestamp | ScalarType::Date
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::Int32 => write!(f, "int32"),
            ScalarType::Int64 => write!(f, "int64"),
            ScalarType::Float32 => write!(f, "float32"),
            ScalarType::Float64 => write!(f, "float64"),
            ScalarType::String => write!(f, "string"),
            ScalarType::Bytes => write!(f, "bytes"),
            ScalarType::Timestamp => write!(f, "timestamp"),
            ScalarType::Date => write!(f, "date"),
            ScalarType::Json => write!(f, "json"),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Field & RecordSchema
// ════════════════════════════════════════════════════════════════

/// Одно поле в схеме записи.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: std::string::String,
    pub scalar: ScalarType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<std::string::String>, scalar: ScalarType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            scalar,
            nullable,
        }
    }
}

/// Плоская схема декодированных записей topic'а.
///
/// Вложенные поля адресуются dot-путём (`customer.id`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSchema {
    pub fields: Vec<Field>,
}

impl RecordSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Тип поля по dot-пути. None если поле не описано схемой.
    pub fn field_type(&self, path: &str) -> Option<ScalarType> {
        self.fields.iter().find(|f| f.name == path).map(|f| f.scalar)
    }
}
