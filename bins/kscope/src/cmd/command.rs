use std::collections::HashMap;

use kscope_api::parse_instant;
use kscope_engine::{Locator, SearchArgs};

use crate::error::CliError;

// ═══════════════════════════════════════════════════════════════
//  Tokenizer
// ═══════════════════════════════════════════════════════════════

/// Разбить строку на токены по пробелам. Кавычки `"..."` и `'...'`
/// группируют токен и снимаются.
pub fn tokenize(line: &str) -> Result<Vec<String>, CliError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(CliError::syntax(format!("unterminated {q} quote")));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

// ═══════════════════════════════════════════════════════════════
//  Command
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Exit,
    Ls { prefix: Option<String>, long: bool },
    Cursor { prefix: Option<String> },
    Switch { topic: String },
    First(Locator),
    Last(Locator),
    Get { locator: Locator, offset: Option<i64> },
    GetAt { locator: Locator, ts_ms: i64 },
    Next(Option<i64>),
    Prev(Option<i64>),
    Count(SearchArgs),
    FindOne(SearchArgs),
    FindNext(SearchArgs),
    Export { args: SearchArgs, sink: String },
    Put {
        topic: Option<String>,
        key: String,
        message: String,
        partition: Option<i32>,
        schema: Option<String>,
    },
    Commit(GroupArgs),
    Fetch(GroupArgs),
    Reset(GroupArgs),
    Inbound { prefix: Option<String>, wait_secs: Option<u64> },
    Stats { topic: Option<String>, range: Option<(i32, Option<i32>)> },
    FetchSize(Option<usize>),
}

/// `[topic] [partition] group [offset]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupArgs {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub group: String,
    pub offset: Option<i64>,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::Exit => "exit",
            Command::Ls { .. } => "kls",
            Command::Cursor { .. } => "kcursor",
            Command::Switch { .. } => "kswitch",
            Command::First(_) => "kfirst",
            Command::Last(_) => "klast",
            Command::Get { .. } | Command::GetAt { .. } => "kget",
            Command::Next(_) => "knext",
            Command::Prev(_) => "kprev",
            Command::Count(_) => "kcount",
            Command::FindOne(_) => "kfindone",
            Command::FindNext(_) => "kfindnext",
            Command::Export { .. } => "kfind",
            Command::Put { .. } => "kput",
            Command::Commit(_) => "kcommit",
            Command::Fetch(_) => "kfetch",
            Command::Reset(_) => "kreset",
            Command::Inbound { .. } => "kinbound",
            Command::Stats { .. } => "kstats",
            Command::FetchSize(_) => "kfetchsize",
        }
    }

    /// Разобрать токены команды. Пустой ввод — None.
    pub fn parse(tokens: &[String]) -> Result<Option<Command>, CliError> {
        let Some((name, rest)) = tokens.split_first() else {
            return Ok(None);
        };
        let command = match name.as_str() {
            "help" | "?" => {
                no_flags(rest)?;
                Command::Help
            }
            "exit" | "quit" => Command::Exit,
            "kls" => {
                let args = Flags::split(rest, &[], &["-l"])?;
                let prefix = args.at_most_one()?;
                Command::Ls { prefix, long: args.has("-l") }
            }
            "kcursor" => {
                let args = Flags::split(rest, &[], &[])?;
                Command::Cursor { prefix: args.at_most_one()? }
            }
            "kswitch" => {
                let args = Flags::split(rest, &[], &[])?;
                let topic = args
                    .at_most_one()?
                    .ok_or_else(|| CliError::syntax("kswitch requires a topic"))?;
                Command::Switch { topic }
            }
            "kfirst" | "klast" => {
                let args = Flags::split(rest, &["-s"], &[])?;
                let (topic, numbers) = topic_and_numbers(&args.positional, 1)?;
                let locator = Locator {
                    topic,
                    partition: numbers.first().map(|&p| to_partition(p)).transpose()?,
                    schema: args.value("-s"),
                };
                if name == "kfirst" {
                    Command::First(locator)
                } else {
                    Command::Last(locator)
                }
            }
            "kget" => {
                let args = Flags::split(rest, &["-s", "-t"], &[])?;
                let at_time = args.value("-t");
                let max_numbers = if at_time.is_some() { 1 } else { 2 };
                let (topic, numbers) = topic_and_numbers(&args.positional, max_numbers)?;
                let locator = Locator {
                    topic,
                    partition: numbers.first().map(|&p| to_partition(p)).transpose()?,
                    schema: args.value("-s"),
                };
                match at_time {
                    Some(instant) => {
                        let ts_ms = parse_instant(&instant).ok_or_else(|| {
                            CliError::syntax(format!(
                                "invalid instant '{instant}': expected epoch millis or yyyy-MM-ddTHH:mm:ss"
                            ))
                        })?;
                        Command::GetAt { locator, ts_ms }
                    }
                    None => Command::Get { locator, offset: numbers.get(1).copied() },
                }
            }
            "knext" | "kprev" => {
                let args = Flags::split(rest, &[], &[])?;
                let delta = args.at_most_one()?.map(|d| parse_int(&d)).transpose()?;
                if delta.is_some_and(|d| d < 0) {
                    return Err(CliError::syntax("delta must not be negative"));
                }
                if name == "knext" {
                    Command::Next(delta)
                } else {
                    Command::Prev(delta)
                }
            }
            "kcount" | "kfindone" | "kfindnext" | "kfind" => {
                let mut args = Flags::split(rest, &["-t", "-p", "-s", "-o"], &[])?;
                if args.positional.is_empty() {
                    return Err(CliError::syntax(format!("{name} requires a condition: field op value")));
                }
                let search = SearchArgs {
                    tokens: std::mem::take(&mut args.positional),
                    topic: args.value("-t"),
                    partition: args.value("-p").map(|p| parse_int(&p).and_then(to_partition)).transpose()?,
                    schema: args.value("-s"),
                };
                match (name.as_str(), args.value("-o")) {
                    ("kfind", Some(sink)) => Command::Export { args: search, sink },
                    ("kfind", None) => return Err(CliError::syntax("kfind requires a sink: -o <topic|file:path>")),
                    (_, Some(_)) => return Err(CliError::syntax(format!("{name} does not accept -o"))),
                    ("kcount", None) => Command::Count(search),
                    ("kfindone", None) => Command::FindOne(search),
                    _ => Command::FindNext(search),
                }
            }
            "kput" => {
                let args = Flags::split(rest, &["-p", "-s"], &[])?;
                let (topic, key, message) = match args.positional.as_slice() {
                    [topic, key, message] => (Some(topic.clone()), key.clone(), message.clone()),
                    [key, message] => (None, key.clone(), message.clone()),
                    _ => return Err(CliError::syntax("usage: kput [topic] key message [-p partition] [-s schema]")),
                };
                Command::Put {
                    topic,
                    key,
                    message,
                    partition: args.value("-p").map(|p| parse_int(&p).and_then(to_partition)).transpose()?,
                    schema: args.value("-s"),
                }
            }
            "kcommit" | "kfetch" | "kreset" => {
                let args = Flags::split(rest, &[], &[])?;
                let group = group_args(&args.positional, name != "kfetch")?;
                match name.as_str() {
                    "kcommit" => Command::Commit(group),
                    "kfetch" => Command::Fetch(group),
                    _ => Command::Reset(group),
                }
            }
            "kinbound" => {
                let args = Flags::split(rest, &["-w"], &[])?;
                let wait_secs = args
                    .value("-w")
                    .map(|w| {
                        w.parse::<u64>()
                            .map_err(|_| CliError::syntax(format!("invalid wait '{w}': expected seconds")))
                    })
                    .transpose()?;
                Command::Inbound { prefix: args.at_most_one()?, wait_secs }
            }
            "kstats" => {
                let args = Flags::split(rest, &[], &[])?;
                let (topic, numbers) = topic_and_numbers(&args.positional, 2)?;
                let range = match numbers.as_slice() {
                    [] => None,
                    [p0] => Some((to_partition(*p0)?, None)),
                    [p0, p1, ..] => Some((to_partition(*p0)?, Some(to_partition(*p1)?))),
                };
                Command::Stats { topic, range }
            }
            "kfetchsize" => {
                let args = Flags::split(rest, &[], &[])?;
                let size = args
                    .at_most_one()?
                    .map(|s| {
                        s.parse::<usize>()
                            .map_err(|_| CliError::syntax(format!("invalid fetch size '{s}'")))
                    })
                    .transpose()?;
                Command::FetchSize(size)
            }
            other => return Err(CliError::syntax(format!("unknown command '{other}' (try help)"))),
        };
        Ok(Some(command))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Argument helpers
// ═══════════════════════════════════════════════════════════════

struct Flags {
    positional: Vec<String>,
    values: HashMap<&'static str, String>,
}

impl Flags {
    /// Отделить флаги от позиционных аргументов. Флаг — `-` и буква,
    /// поэтому отрицательные числа остаются позиционными.
    fn split(
        tokens: &[String],
        with_value: &[&'static str],
        switches: &[&'static str],
    ) -> Result<Self, CliError> {
        let mut positional = Vec::new();
        let mut values = HashMap::new();
        let mut iter = tokens.iter();
        while let Some(token) = iter.next() {
            let is_flag = token.starts_with('-')
                && token[1..].starts_with(|c: char| c.is_ascii_alphabetic());
            if !is_flag {
                positional.push(token.clone());
                continue;
            }
            if let Some(&flag) = with_value.iter().find(|f| token == *f) {
                let value = iter
                    .next()
                    .ok_or_else(|| CliError::syntax(format!("option {flag} requires a value")))?;
                values.insert(flag, value.clone());
            } else if let Some(&flag) = switches.iter().find(|f| token == *f) {
                values.insert(flag, String::new());
            } else {
                return Err(CliError::syntax(format!("unknown option '{token}'")));
            }
        }
        Ok(Self { positional, values })
    }

    fn value(&self, flag: &str) -> Option<String> {
        self.values.get(flag).cloned()
    }

    fn has(&self, flag: &str) -> bool {
        self.values.contains_key(flag)
    }

    fn at_most_one(&self) -> Result<Option<String>, CliError> {
        match self.positional.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(one.clone())),
            [_, extra, ..] => Err(CliError::syntax(format!("unexpected argument '{extra}'"))),
        }
    }
}

fn no_flags(rest: &[String]) -> Result<(), CliError> {
    match rest.first() {
        Some(extra) => Err(CliError::syntax(format!("unexpected argument '{extra}'"))),
        None => Ok(()),
    }
}

fn is_int(token: &str) -> bool {
    token.parse::<i64>().is_ok()
}

fn parse_int(token: &str) -> Result<i64, CliError> {
    token
        .parse::<i64>()
        .map_err(|_| CliError::syntax(format!("expected a number, got '{token}'")))
}

fn to_partition(n: i64) -> Result<i32, CliError> {
    i32::try_from(n)
        .ok()
        .filter(|p| *p >= 0)
        .ok_or_else(|| CliError::syntax(format!("invalid partition {n}")))
}

/// Ведущий не-числовой токен — topic, дальше до `max` чисел.
fn topic_and_numbers(tokens: &[String], max: usize) -> Result<(Option<String>, Vec<i64>), CliError> {
    let (topic, rest) = match tokens.split_first() {
        Some((first, rest)) if !is_int(first) => (Some(first.clone()), rest),
        _ => (None, tokens),
    };
    if let Some(extra) = rest.get(max) {
        return Err(CliError::syntax(format!("unexpected argument '{extra}'")));
    }
    let numbers = rest.iter().map(|t| parse_int(t)).collect::<Result<Vec<_>, _>>()?;
    Ok((topic, numbers))
}

/// Группа — последний не-числовой токен; перед ней topic/partition,
/// после неё offset.
fn group_args(tokens: &[String], allow_offset: bool) -> Result<GroupArgs, CliError> {
    let index = tokens
        .iter()
        .rposition(|t| !is_int(t))
        .ok_or_else(|| CliError::syntax("expected consumer group name"))?;
    let (topic, numbers) = topic_and_numbers(&tokens[..index], 1)?;
    let after = &tokens[index + 1..];
    let offset = match after {
        [] => None,
        [offset] if allow_offset => Some(parse_int(offset)?),
        [extra, ..] => return Err(CliError::syntax(format!("unexpected argument '{extra}'"))),
    };
    if offset.is_some_and(|o| o < 0) {
        return Err(CliError::syntax("offset must not be negative"));
    }
    Ok(GroupArgs {
        topic,
        partition: numbers.first().map(|&p| to_partition(p)).transpose()?,
        group: tokens[index].clone(),
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Option<Command>, CliError> {
        Command::parse(&tokenize(line).unwrap())
    }

    fn command(line: &str) -> Command {
        parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"kput orders k1 '{"id": "a b"}'"#).unwrap(),
            vec!["kput", "orders", "k1", r#"{"id": "a b"}"#]
        );
        assert_eq!(tokenize(r#"kcount name == "" "#).unwrap(), vec!["kcount", "name", "==", ""]);
        assert!(tokenize("kput 'open").unwrap_err().is_syntax());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn test_positional_topic_rule() {
        assert_eq!(
            command("kfirst orders 1"),
            Command::First(Locator { topic: Some("orders".into()), partition: Some(1), schema: None })
        );
        assert_eq!(command("klast 2"), Command::Last(Locator { partition: Some(2), ..Locator::default() }));
        assert_eq!(
            command("kget 0 15 -s orders.avsc"),
            Command::Get {
                locator: Locator { topic: None, partition: Some(0), schema: Some("orders.avsc".into()) },
                offset: Some(15)
            }
        );
        assert!(parse("kget orders 0 1 2").unwrap_err().is_syntax());
        assert!(parse("kfirst orders x").unwrap_err().is_syntax());
    }

    #[test]
    fn test_get_at_time() {
        match command("kget orders 0 -t 1970-01-01T00:00:02") {
            Command::GetAt { locator, ts_ms } => {
                assert_eq!(locator.topic.as_deref(), Some("orders"));
                assert_eq!(ts_ms, 2000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("kget -t yesterday").unwrap_err().is_syntax());
        assert!(parse("kget -t 2024-02-31T00:00:00").unwrap_err().is_syntax());
    }

    #[test]
    fn test_search_commands() {
        match command("kcount price > 100 and qty < 5 -t orders -p 1") {
            Command::Count(args) => {
                assert_eq!(args.tokens, vec!["price", ">", "100", "and", "qty", "<", "5"]);
                assert_eq!(args.topic.as_deref(), Some("orders"));
                assert_eq!(args.partition, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        match command("kfind price > 100 -o file:/tmp/out.jsonl") {
            Command::Export { sink, .. } => assert_eq!(sink, "file:/tmp/out.jsonl"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("kfind price > 100").unwrap_err().is_syntax());
        assert!(parse("kcount").unwrap_err().is_syntax());
        assert!(parse("kcount price > 1 -x").unwrap_err().is_syntax());
        assert!(parse("kcount price > 1 -t").unwrap_err().is_syntax());
        // negative literals are not options
        assert!(matches!(command("kfindone delta > -5"), Command::FindOne(_)));
    }

    #[test]
    fn test_put() {
        assert_eq!(
            command("kput orders 0a.ff hello -p 1"),
            Command::Put {
                topic: Some("orders".into()),
                key: "0a.ff".into(),
                message: "hello".into(),
                partition: Some(1),
                schema: None
            }
        );
        assert!(matches!(command("kput k v"), Command::Put { topic: None, .. }));
        assert!(parse("kput onlykey").unwrap_err().is_syntax());
    }

    #[test]
    fn test_group_commands() {
        assert_eq!(
            command("kcommit orders 1 audit 42"),
            Command::Commit(GroupArgs {
                topic: Some("orders".into()),
                partition: Some(1),
                group: "audit".into(),
                offset: Some(42)
            })
        );
        assert_eq!(
            command("kcommit audit"),
            Command::Commit(GroupArgs { group: "audit".into(), ..GroupArgs::default() })
        );
        assert_eq!(
            command("kreset orders audit"),
            Command::Reset(GroupArgs { topic: Some("orders".into()), group: "audit".into(), ..GroupArgs::default() })
        );
        assert!(parse("kfetch audit 3").unwrap_err().is_syntax());
        assert!(parse("kcommit 1 2").unwrap_err().is_syntax());
    }

    #[test]
    fn test_misc_commands() {
        assert_eq!(command("kls ord -l"), Command::Ls { prefix: Some("ord".into()), long: true });
        assert_eq!(command("knext"), Command::Next(None));
        assert_eq!(command("kprev 3"), Command::Prev(Some(3)));
        assert_eq!(command("kinbound ord -w 2"), Command::Inbound { prefix: Some("ord".into()), wait_secs: Some(2) });
        assert_eq!(command("kstats orders 0 2"), Command::Stats { topic: Some("orders".into()), range: Some((0, Some(2))) });
        assert_eq!(command("kfetchsize 4096"), Command::FetchSize(Some(4096)));
        assert_eq!(command("quit"), Command::Exit);
        assert!(parse("").unwrap().is_none());
        assert!(parse("kswitch").unwrap_err().is_syntax());
        assert!(parse("knext x").unwrap_err().is_syntax());
        assert!(parse("frobnicate").unwrap_err().is_syntax());
    }
}
