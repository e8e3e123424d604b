pub mod command;
pub mod render;
pub mod shell;

use std::time::Duration;

use kscope_engine::Session;

use crate::error::CliError;
use command::Command;

/// Результат команды для shell-цикла.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Output(String),
    Exit,
}

/// Выполнить одну команду в сессии.
pub async fn execute(session: &Session, command: Command) -> Result<Outcome, CliError> {
    let text = match command {
        Command::Help => render::HELP.to_string(),
        Command::Exit => return Ok(Outcome::Exit),
        Command::Ls { prefix, long } => render::topics(&session.list_topics(prefix.as_deref(), long).await?),
        Command::Cursor { prefix } => render::cursors(&session.cursors(prefix.as_deref()).await),
        Command::Switch { topic } => {
            session.switch(&topic).await?;
            format!("current topic: {topic}")
        }
        Command::First(locator) => render::message(session.first(&locator).await?.as_ref()),
        Command::Last(locator) => render::message(session.last(&locator).await?.as_ref()),
        Command::Get { locator, offset } => render::message(Some(&session.get(&locator, offset).await?)),
        Command::GetAt { locator, ts_ms } => render::message(session.get_at_time(&locator, ts_ms).await?.as_ref()),
        Command::Next(delta) => render::message(session.next(delta).await?.as_ref()),
        Command::Prev(delta) => render::message(session.prev(delta).await?.as_ref()),
        Command::Count(args) => render::summary(&session.count(&args).await?),
        Command::FindOne(args) => render::found(&session.find_one(&args).await?),
        Command::FindNext(args) => render::found(&session.find_next(&args).await?),
        Command::Export { args, sink } => {
            let summary = session.export(&args, &sink).await?;
            format!("exported to {sink}: {}", render::summary(&summary))
        }
        Command::Put { topic, key, message, partition, schema } => {
            let ack = session
                .put(topic.as_deref(), &key, &message, partition, schema.as_deref())
                .await?;
            render::ack(topic.as_deref().unwrap_or("current topic"), &ack)
        }
        Command::Commit(g) => {
            let (tp, offset) = session.commit(g.topic.as_deref(), g.partition, &g.group, g.offset).await?;
            format!("group {} {tp} committed offset {offset}", g.group)
        }
        Command::Fetch(g) => {
            let (tp, offset) = session.committed(g.topic.as_deref(), g.partition, &g.group).await?;
            render::group_offset(&g.group, &tp, offset)
        }
        Command::Reset(g) => {
            let (tp, offset) = session.reset(g.topic.as_deref(), g.partition, &g.group, g.offset).await?;
            format!("group {} {tp} reset to offset {offset}", g.group)
        }
        Command::Inbound { prefix, wait_secs } => {
            let wait = wait_secs.map(Duration::from_secs);
            render::inbound(&session.inbound(prefix.as_deref(), wait).await?)
        }
        Command::Stats { topic, range } => {
            let (topic, stats) = session.stats(topic.as_deref(), range).await?;
            render::stats(&topic, &stats)
        }
        Command::FetchSize(None) => format!("fetch size: {} bytes", session.fetch_size()),
        Command::FetchSize(Some(bytes)) => {
            session.set_fetch_size(bytes)?;
            format!("fetch size set to {bytes} bytes")
        }
    };
    Ok(Outcome::Output(text))
}

/// Разобрать и выполнить строку команды внутри span'а с correlation id.
pub async fn run_line(session: &Session, tokens: &[String]) -> Result<Option<Outcome>, CliError> {
    use tracing::Instrument;

    let Some(command) = Command::parse(tokens)? else {
        return Ok(None);
    };
    let span = session.command_span(command.name());
    execute(session, command).instrument(span).await.map(Some)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use broker_memory::{MemoryBroker, MemoryBrokerFactory};
    use kscope_engine::SessionConfig;

    use super::*;
    use command::tokenize;

    async fn session() -> Session {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 2, 1000).await;
        for i in 0..10 {
            broker
                .append_at("orders", 0, format!("k{i}").as_bytes(), i.to_string().as_bytes(), 0)
                .await
                .unwrap();
        }
        Session::new(Arc::new(MemoryBrokerFactory::new(broker)), SessionConfig::default())
    }

    async fn run(session: &Session, line: &str) -> Result<String, CliError> {
        match run_line(session, &tokenize(line)?).await? {
            Some(Outcome::Output(text)) => Ok(text),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_count_without_cursor_is_runtime_error() {
        let session = session().await;
        let err = run(&session, "kcount price > 100").await.unwrap_err();
        assert!(!err.is_syntax());
        assert!(err.report().starts_with("Runtime error: no cursor"), "{}", err.report());
    }

    #[tokio::test]
    async fn test_condition_syntax_error() {
        let session = session().await;
        let err = run(&session, "kcount value > 1 foo -t orders").await.unwrap_err();
        assert!(err.report().starts_with("Syntax error:"), "{}", err.report());
        assert!(err.report().contains("'foo'"));
    }

    #[tokio::test]
    async fn test_navigation_session() {
        let session = session().await;
        let first = run(&session, "kfirst orders 0").await.unwrap();
        assert!(first.starts_with("orders:0 offset 0 (next 1)"), "{first}");

        let next = run(&session, "knext 2").await.unwrap();
        assert!(next.starts_with("orders:0 offset 3"), "{next}");

        let cursors = run(&session, "kcursor").await.unwrap();
        assert_eq!(cursors, "* orders 0:3 (next 4)");

        let count = run(&session, "kcount value >= 5").await.unwrap();
        assert_eq!(count, "matched 5 of 10 scanned");

        let last = run(&session, "klast orders 1").await.unwrap();
        assert_eq!(last, render::NO_MESSAGE);
    }

    #[tokio::test]
    async fn test_put_and_fetchsize() {
        let session = session().await;
        let put = run(&session, "kput orders k v -p 1").await.unwrap();
        assert_eq!(put, "published to orders:1 offset 0");
        assert_eq!(run(&session, "kfetchsize 512").await.unwrap(), "fetch size set to 512 bytes");
        assert_eq!(run(&session, "kfetchsize").await.unwrap(), "fetch size: 512 bytes");
    }

    #[tokio::test]
    async fn test_exit_and_blank() {
        let session = session().await;
        assert_eq!(run_line(&session, &tokenize("exit").unwrap()).await.unwrap(), Some(Outcome::Exit));
        assert_eq!(run_line(&session, &[]).await.unwrap(), None);
    }
}
