use chrono::{DateTime, NaiveDateTime};

/// Resolve a dot-notation path in a `serde_json::Value`.
///
/// Supports nested field access via dot separation:
/// - `"price"` → `value["price"]`
/// - `"customer.id"` → `value["customer"]["id"]`
///
/// Returns `None` if any segment is missing.
pub fn resolve_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Текущее Unix-время в миллисекундах.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ════════════════════════════════════════════════════════════════
//  Instants
// ════════════════════════════════════════════════════════════════

const INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Распарсить момент времени: epoch millis (`1700000000000`) или
/// `yyyy-MM-ddTHH:mm:ss` (UTC). None если формат не распознан
/// или дата не существует.
pub fn parse_instant(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    NaiveDateTime::parse_from_str(s, INSTANT_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Unix ms → `YYYY-MM-DDTHH:MM:SS.mmm` (UTC). Вне диапазона chrono
/// печатается исходное число.
pub fn format_instant(ms: i64) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        None => ms.to_string(),
    }
}

// ════════════════════════════════════════════════════════════════
//  Byte literals
// ════════════════════════════════════════════════════════════════

/// Dotted-hex литерал (`0a.ff.01`) → байты. Два и более hex-байта,
/// разделённых точками; всё остальное не является литералом.
pub fn parse_dotted_hex(s: &str) -> Option<Vec<u8>> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    parts
        .iter()
        .map(|p| {
            if p.len() == 2 {
                u8::from_str_radix(p, 16).ok()
            } else {
                None
            }
        })
        .collect()
}

/// Аргумент команды → байты: dotted-hex либо UTF-8 текст.
pub fn parse_bytes_arg(s: &str) -> Vec<u8> {
    parse_dotted_hex(s).unwrap_or_else(|| s.as_bytes().to_vec())
}

/// Байты → печатный вид: UTF-8 текст без управляющих символов как есть,
/// иначе dotted-hex.
pub fn format_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') => {
            text.to_string()
        }
        _ => bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_epoch_millis() {
        assert_eq!(parse_instant("1700000000000"), Some(1_700_000_000_000));
    }

    #[test]
    fn test_parse_instant_datetime() {
        assert_eq!(parse_instant("1970-01-01T00:00:00"), Some(0));
        assert_eq!(parse_instant("2023-11-14T22:13:20"), Some(1_700_000_000_000));
        assert_eq!(parse_instant("2024-02-29T12:00:00"), Some(1_709_208_000_000));
    }

    #[test]
    fn test_parse_instant_rejects_garbage() {
        assert_eq!(parse_instant("yesterday"), None);
        assert_eq!(parse_instant("2024-13-01T00:00:00"), None);
        assert_eq!(parse_instant("2024-01-01T25:00:00"), None);
        assert_eq!(parse_instant("2024-01-01"), None);
    }

    #[test]
    fn test_parse_instant_rejects_impossible_dates() {
        assert_eq!(parse_instant("2024-02-31T00:00:00"), None);
        assert_eq!(parse_instant("2023-02-29T00:00:00"), None);
        assert_eq!(parse_instant("99999999999-01-01T00:00:00"), None);
    }

    #[test]
    fn test_format_instant() {
        assert_eq!(format_instant(0), "1970-01-01T00:00:00.000");
        assert_eq!(format_instant(1_700_000_000_123), "2023-11-14T22:13:20.123");
        assert_eq!(format_instant(-1), "1969-12-31T23:59:59.999");
        assert_eq!(format_instant(i64::MAX), i64::MAX.to_string());
    }

    #[test]
    fn test_dotted_hex() {
        assert_eq!(parse_dotted_hex("0a.ff.01"), Some(vec![0x0a, 0xff, 0x01]));
        assert_eq!(parse_dotted_hex("ab"), None);
        assert_eq!(parse_dotted_hex("hello.world"), None);
        assert_eq!(parse_bytes_arg("hello"), b"hello".to_vec());
        assert_eq!(parse_bytes_arg("00.01"), vec![0, 1]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(b"order-1"), "order-1");
        assert_eq!(format_bytes(&[0x00, 0xff]), "00.ff");
    }

    #[test]
    fn test_resolve_path() {
        let v = serde_json::json!({"customer": {"id": 7}, "price": 10});
        assert_eq!(resolve_path(&v, "customer.id"), Some(&serde_json::json!(7)));
        assert_eq!(resolve_path(&v, "price"), Some(&serde_json::json!(10)));
        assert_eq!(resolve_path(&v, "customer.name"), None);
    }
}
