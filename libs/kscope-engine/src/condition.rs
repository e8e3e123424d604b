use std::borrow::Cow;
use std::cmp::Ordering;

use kscope_api::{resolve_path, MessageRecord, ScalarType};

use crate::decoder::Decoder;
use crate::error::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════
//  Operator & Literal
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    fn matches(&self, ord: Option<Ordering>) -> bool {
        match self {
            Operator::Lt => ord == Some(Ordering::Less),
            Operator::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            Operator::Gt => ord == Some(Ordering::Greater),
            Operator::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            Operator::Eq => ord == Some(Ordering::Equal),
            Operator::Ne => ord != Some(Ordering::Equal),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        })
    }
}

/// Литерал условия, уже приведённый к типу поля.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Condition
// ═══════════════════════════════════════════════════════════════

/// Скомпилированный предикат над сообщением.
///
/// Грамматика: `field op value [and field op value ...]`, только
/// конъюнкция слева направо, без скобок.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Comparison {
        field: String,
        op: Operator,
        literal: Literal,
    },
    And(Box<Condition>, Box<Condition>),
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Comparison { field, op, literal } => write!(f, "{field} {op} {literal}"),
            Condition::And(left, right) => write!(f, "{left} and {right}"),
        }
    }
}

/// Что проверяется условием: декодированная запись или сырое сообщение.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Decoded(&'a serde_json::Value),
    /// Без декодера доступны поля `key`, `value`, `offset`, `timestamp`.
    Raw(&'a MessageRecord),
}

impl Condition {
    pub fn evaluate(&self, target: Target<'_>) -> bool {
        match self {
            Condition::Comparison { field, op, literal } => {
                let ord = operand(target, field).and_then(|v| compare(&v, literal));
                match ord {
                    Some(ord) => op.matches(Some(ord)),
                    None => *op == Operator::Ne,
                }
            }
            Condition::And(left, right) => left.evaluate(target) && right.evaluate(target),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Compiler
// ═══════════════════════════════════════════════════════════════

/// Скомпилировать последовательность токенов в Condition.
///
/// Токены берутся тройками; после тройки допустим только `and`,
/// иначе — синтаксическая ошибка с указанием токена.
pub fn compile<S: AsRef<str>>(tokens: &[S], decoder: Option<&Decoder>) -> Result<Condition> {
    let tokens: Vec<&str> = tokens.iter().map(|t| t.as_ref()).collect();
    if tokens.is_empty() {
        return Err(EngineError::syntax("expected condition: field operator value"));
    }

    let mut condition: Option<Condition> = None;
    let mut i = 0;
    loop {
        if i + 3 > tokens.len() {
            return Err(match tokens.get(i) {
                Some(_) => EngineError::syntax(format!(
                    "incomplete condition at '{}'",
                    tokens[tokens.len() - 1]
                )),
                None => EngineError::syntax(format!(
                    "expected condition after '{}'",
                    tokens[tokens.len() - 1]
                )),
            });
        }
        let comparison = compile_comparison(tokens[i], tokens[i + 1], tokens[i + 2], decoder)?;
        condition = Some(match condition {
            None => comparison,
            Some(prev) => Condition::And(Box::new(prev), Box::new(comparison)),
        });
        i += 3;

        match tokens.get(i) {
            None => break,
            Some(t) if t.eq_ignore_ascii_case("and") => i += 1,
            Some(t) => return Err(EngineError::syntax(format!("unexpected token '{t}'"))),
        }
    }

    condition.ok_or_else(|| EngineError::syntax("expected condition: field operator value"))
}

/// Скомпилировать одно сравнение. Литерал приводится к типу поля из
/// схемы декодера; без схемы — по лексической форме.
pub fn compile_comparison(
    field: &str,
    op: &str,
    literal: &str,
    decoder: Option<&Decoder>,
) -> Result<Condition> {
    let op = Operator::parse(op)
        .ok_or_else(|| EngineError::syntax(format!("unknown operator '{op}'")))?;
    let field_type = decoder.and_then(|d| d.fields().field_type(field));
    let literal = match field_type {
        Some(scalar) => coerce_typed(field, literal, scalar)?,
        None => coerce_lexical(literal),
    };
    Ok(Condition::Comparison {
        field: field.to_string(),
        op,
        literal,
    })
}

fn coerce_typed(field: &str, literal: &str, scalar: ScalarType) -> Result<Literal> {
    let invalid =
        || EngineError::syntax(format!("'{literal}' is not a valid {scalar} for field '{field}'"));

    if scalar.is_integer() {
        if let Ok(i) = literal.parse::<i64>() {
            return Ok(Literal::Int(i));
        }
        return parse_float(literal).map(Literal::Float).ok_or_else(invalid);
    }
    if scalar.is_float() {
        return parse_float(literal).map(Literal::Float).ok_or_else(invalid);
    }
    match scalar {
        ScalarType::Bool => match literal {
            "true" => Ok(Literal::Bool(true)),
            "false" => Ok(Literal::Bool(false)),
            _ => Err(invalid()),
        },
        _ => Ok(Literal::Str(unquote(literal).to_string())),
    }
}

fn coerce_lexical(literal: &str) -> Literal {
    if let Ok(i) = literal.parse::<i64>() {
        return Literal::Int(i);
    }
    if let Some(x) = parse_float(literal) {
        return Literal::Float(x);
    }
    match literal {
        "true" => Literal::Bool(true),
        "false" => Literal::Bool(false),
        _ => Literal::Str(unquote(literal).to_string()),
    }
}

fn parse_float(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|x| x.is_finite())
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

// ═══════════════════════════════════════════════════════════════
//  Evaluation
// ═══════════════════════════════════════════════════════════════

enum Operand<'a> {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Cow<'a, str>),
}

fn operand<'a>(target: Target<'a>, field: &str) -> Option<Operand<'a>> {
    match target {
        Target::Decoded(value) => match resolve_path(value, field)? {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Operand::Bool(*b)),
            serde_json::Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Operand::Int(i),
                None => Operand::Float(n.as_f64()?),
            }),
            serde_json::Value::String(s) => Some(Operand::Str(Cow::Borrowed(s))),
            other => Some(Operand::Str(Cow::Owned(other.to_string()))),
        },
        Target::Raw(record) => match field {
            "key" => Some(Operand::Str(String::from_utf8_lossy(&record.key))),
            "value" | "payload" => Some(Operand::Str(String::from_utf8_lossy(&record.payload))),
            "offset" => Some(Operand::Int(record.offset)),
            "timestamp" => Some(Operand::Int(record.timestamp_ms)),
            _ => None,
        },
    }
}

/// Сравнить значение поля с литералом. None — значения несравнимы.
fn compare(value: &Operand<'_>, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (Operand::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
        (Operand::Int(a), Literal::Float(b)) => (*a as f64).partial_cmp(b),
        (Operand::Float(a), Literal::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Operand::Float(a), Literal::Float(b)) => a.partial_cmp(b),
        (Operand::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        (Operand::Str(a), Literal::Str(b)) => Some(a.as_ref().cmp(b.as_str())),
        // raw payloads carry numbers and flags as text
        (Operand::Str(a), Literal::Int(_) | Literal::Float(_) | Literal::Bool(_)) => {
            compare(&reparse(a)?, literal)
        }
        (Operand::Int(a), Literal::Str(b)) => Some(a.to_string().as_str().cmp(b.as_str())),
        (Operand::Float(a), Literal::Str(b)) => Some(a.to_string().as_str().cmp(b.as_str())),
        (Operand::Bool(a), Literal::Str(b)) => Some(a.to_string().as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn reparse(s: &str) -> Option<Operand<'static>> {
    match coerce_lexical(s.trim()) {
        Literal::Int(i) => Some(Operand::Int(i)),
        Literal::Float(x) => Some(Operand::Float(x)),
        Literal::Bool(b) => Some(Operand::Bool(b)),
        Literal::Str(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ORDER_SCHEMA;

    fn order() -> serde_json::Value {
        serde_json::json!({
            "id": "o-1", "price": 150, "qty": 2, "note": null,
            "customer": {"tier": "gold"}
        })
    }

    fn raw(key: &str, payload: &str) -> MessageRecord {
        MessageRecord {
            offset: 7,
            next_offset: 8,
            timestamp_ms: 1000,
            key: key.as_bytes().to_vec(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_compile_compound() {
        let tokens = ["price", ">", "100", "and", "qty", "<", "5"];
        let condition = compile(&tokens, None).unwrap();
        match &condition {
            Condition::And(left, right) => {
                assert_eq!(
                    **left,
                    Condition::Comparison {
                        field: "price".into(),
                        op: Operator::Gt,
                        literal: Literal::Int(100)
                    }
                );
                assert_eq!(
                    **right,
                    Condition::Comparison {
                        field: "qty".into(),
                        op: Operator::Lt,
                        literal: Literal::Int(5)
                    }
                );
            }
            other => panic!("expected And, got {other:?}"),
        }
        assert_eq!(condition.to_string(), "price > 100 and qty < 5");
    }

    #[test]
    fn test_compile_trailing_token() {
        let err = compile(&["price", ">", "100", "foo"], None).unwrap_err();
        assert!(err.is_syntax());
        assert!(err.to_string().contains("'foo'"), "{err}");
    }

    #[test]
    fn test_compile_partial_triple() {
        let err = compile(&["price", ">"], None).unwrap_err();
        assert!(err.is_syntax());
        assert!(err.to_string().contains("'>'"), "{err}");

        let err = compile(&["price", ">", "1", "and"], None).unwrap_err();
        assert!(err.to_string().contains("'and'"), "{err}");

        let err = compile(&["price", ">", "1", "and", "qty"], None).unwrap_err();
        assert!(err.to_string().contains("'qty'"), "{err}");

        assert!(compile::<&str>(&[], None).unwrap_err().is_syntax());
    }

    #[test]
    fn test_unknown_operator() {
        let err = compile(&["price", "=~", "1"], None).unwrap_err();
        assert!(err.to_string().contains("'=~'"), "{err}");
    }

    #[test]
    fn test_left_to_right_conjunction() {
        let c = compile(&["a", "==", "1", "and", "b", "==", "2", "and", "c", "==", "3"], None)
            .unwrap();
        match c {
            Condition::And(left, _) => assert!(matches!(*left, Condition::And(_, _))),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_decoded_matches_direct_comparison() {
        let record = order();
        let target = Target::Decoded(&record);
        let cases = [
            ("price", ">", "100", true),
            ("price", ">=", "150", true),
            ("price", "<", "150", false),
            ("price", "<=", "149.5", false),
            ("price", "==", "150", true),
            ("price", "!=", "150", false),
            ("id", "==", "o-1", true),
            ("id", "==", "\"o-1\"", true),
            ("id", "<", "o-2", true),
            ("customer.tier", "==", "gold", true),
            ("customer.tier", "!=", "gold", false),
            ("missing", "==", "1", false),
            ("missing", "!=", "1", true),
            ("note", "==", "x", false),
        ];
        for (field, op, literal, expected) in cases {
            let c = compile(&[field, op, literal], None).unwrap();
            assert_eq!(c.evaluate(target), expected, "{field} {op} {literal}");
            // deterministic
            assert_eq!(c.evaluate(target), expected);
        }
    }

    #[test]
    fn test_schema_coercion() {
        let decoder = Decoder::from_schema_str("orders.avsc", ORDER_SCHEMA).unwrap();

        let c = compile(&["id", "==", "100"], Some(&decoder)).unwrap();
        assert_eq!(
            c,
            Condition::Comparison {
                field: "id".into(),
                op: Operator::Eq,
                literal: Literal::Str("100".into())
            }
        );

        let err = compile(&["price", ">", "cheap"], Some(&decoder)).unwrap_err();
        assert!(err.is_syntax());
        assert!(err.to_string().contains("int64"), "{err}");

        let c = compile(&["qty", "<", "2.5"], Some(&decoder)).unwrap();
        assert!(c.evaluate(Target::Decoded(&order())));
    }

    #[test]
    fn test_evaluate_raw() {
        let msg = raw("order-1", "150");
        let target = Target::Raw(&msg);
        assert!(compile(&["value", ">", "100"], None).unwrap().evaluate(target));
        assert!(compile(&["key", "==", "order-1"], None).unwrap().evaluate(target));
        assert!(compile(&["offset", ">=", "7"], None).unwrap().evaluate(target));
        assert!(!compile(&["price", ">", "1"], None).unwrap().evaluate(target));

        let text = raw("k", "hello");
        assert!(!compile(&["value", ">", "100"], None).unwrap().evaluate(Target::Raw(&text)));
        assert!(compile(&["value", "!=", "100"], None).unwrap().evaluate(Target::Raw(&text)));
    }

    #[test]
    fn test_compound_requires_both() {
        let record = order();
        let target = Target::Decoded(&record);
        let both = compile(&["price", ">", "100", "and", "qty", "<", "5"], None).unwrap();
        assert!(both.evaluate(target));
        let one = compile(&["price", ">", "100", "and", "qty", ">", "5"], None).unwrap();
        assert!(!one.evaluate(target));
    }
}
