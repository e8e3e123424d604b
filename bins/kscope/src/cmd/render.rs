use std::fmt::Write;

use kscope_api::{format_bytes, format_instant, ProduceAck, TopicPartition};
use kscope_engine::{
    CursorView, DecodedMessage, FindView, Inbound, MessageView, PartitionStats, ScanSummary,
    TopicInfo,
};

pub const NO_MESSAGE: &str = "(no message)";

pub fn message(view: Option<&MessageView>) -> String {
    let Some(view) = view else {
        return NO_MESSAGE.to_string();
    };
    let record = &view.record;
    let mut out = format!(
        "{}:{} offset {} (next {})  {}\nkey: {}\n",
        view.topic,
        view.partition,
        record.offset,
        record.next_offset,
        format_instant(record.timestamp_ms),
        format_bytes(&record.key),
    );
    match &view.decoded {
        Some(DecodedMessage::Record(value)) => {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            let _ = write!(out, "value: {pretty}");
        }
        Some(DecodedMessage::Failed(reason)) => {
            let _ = write!(out, "value: {}\n(decode failed: {reason})", format_bytes(&record.payload));
        }
        None => {
            let _ = write!(out, "value: {}", format_bytes(&record.payload));
        }
    }
    out
}

pub fn summary(summary: &ScanSummary) -> String {
    let mut out = format!("matched {} of {} scanned", summary.matched, summary.scanned);
    if summary.decode_failures > 0 {
        let _ = write!(out, ", {} failed to decode", summary.decode_failures);
    }
    out
}

pub fn found(view: &FindView) -> String {
    match &view.message {
        Some(m) => format!("{}\n({})", message(Some(m)), summary(&view.summary)),
        None => format!("no match ({})", summary(&view.summary)),
    }
}

pub fn topics(topics: &[TopicInfo]) -> String {
    if topics.is_empty() {
        return "(no topics)".to_string();
    }
    topics
        .iter()
        .map(|t| match (t.partitions, t.messages) {
            (Some(p), Some(m)) => format!("{:<32} {p:>4} partitions {m:>10} messages", t.name),
            _ => t.name.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn cursors(cursors: &[CursorView]) -> String {
    if cursors.is_empty() {
        return "(no cursors)".to_string();
    }
    cursors
        .iter()
        .map(|c| {
            let mark = if c.current { '*' } else { ' ' };
            let mut line = format!("{mark} {} {}:{} (next {})", c.topic, c.partition, c.offset, c.next_offset);
            if let Some(decoder) = &c.decoder {
                let _ = write!(line, " [{decoder}]");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn ack(topic: &str, ack: &ProduceAck) -> String {
    format!("published to {topic}:{} offset {}", ack.partition, ack.offset)
}

pub fn group_offset(group: &str, tp: &TopicPartition, offset: Option<i64>) -> String {
    match offset {
        Some(o) => format!("group {group} {tp} offset {o}"),
        None => format!("group {group} {tp} has no committed offset"),
    }
}

pub fn inbound(entries: &[Inbound]) -> String {
    if entries.is_empty() {
        return "no inbound messages".to_string();
    }
    entries
        .iter()
        .map(|i| {
            format!(
                "{}:{}  +{}  {:.1} msg/s  [{}..{})",
                i.topic, i.partition, i.change, i.rate, i.start_offset, i.end_offset
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn stats(topic: &str, stats: &[PartitionStats]) -> String {
    let mut out = format!("{topic}\n{:>9} {:>12} {:>12} {:>12}", "partition", "start", "end", "count");
    for s in stats {
        let _ = write!(out, "\n{:>9} {:>12} {:>12} {:>12}", s.partition, s.start, s.end, s.count);
    }
    let total: i64 = stats.iter().map(|s| s.count).sum();
    let _ = write!(out, "\n{:>9} {:>12} {:>12} {:>12}", "total", "", "", total);
    out
}

pub const HELP: &str = "\
kls [prefix] [-l]                                list topics
kcursor [prefix]                                 show cursors (* = current)
kswitch <topic>                                  change current topic
kfirst|klast [topic] [partition] [-s schema]     first/last message
kget [topic] [partition] [offset] [-s schema]    message at position
kget [topic] [partition] -t <instant>            message at time (epoch ms or yyyy-MM-ddTHH:mm:ss)
knext [delta] | kprev [delta]                    navigate
kcount <cond> [-t topic] [-p partition] [-s schema]
kfindone <cond> ... | kfindnext <cond> ...       find first / next match
kfind <cond> ... -o <topic|file:path>            export matches
kput [topic] key message [-p partition] [-s schema]
kcommit|kreset [topic] [partition] group [offset]
kfetch [topic] [partition] group                 committed group offset
kinbound [prefix] [-w seconds]                   inbound message rates
kstats [topic] [p0] [p1]                         partition offsets
kfetchsize [bytes]                               get/set fetch size
exit | quit

<cond> = field op value [and field op value ...], op: < <= > >= == !=";
