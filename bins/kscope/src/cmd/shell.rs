use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use rustyline::error::ReadlineError;
use rustyline::{Cmd, Config, DefaultEditor, KeyEvent};
use tokio::sync::mpsc;

use kscope_engine::Session;

use super::command::tokenize;
use super::{run_line, Outcome};
use crate::error::CliError;

const PROMPT: &str = "kscope> ";
const MAX_HISTORY: usize = 1000;

/// Событие строчного редактора.
enum Input {
    Line(String),
    /// Ctrl-C: строка сброшена, сессия продолжается.
    Interrupted,
    /// Ctrl-D.
    Eof,
    Failed(String),
}

/// rustyline в отдельном потоке: `readline` блокирует поток.
///
/// Следующий prompt выводится только после `resume`, чтобы вывод
/// команды не смешивался с вводом.
struct LineReader {
    input: mpsc::Receiver<Input>,
    resume: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl LineReader {
    fn spawn(history: Option<PathBuf>) -> Result<Self, CliError> {
        let (input_tx, input) = mpsc::channel(1);
        let (resume, resume_rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("kscope-readline".into())
            .spawn(move || read_lines(history, input_tx, resume_rx))?;
        Ok(Self { input, resume, thread })
    }

    async fn next(&mut self) -> Input {
        self.input.recv().await.unwrap_or(Input::Eof)
    }

    fn resume(&self) {
        // поток уже завершился, если получатель закрыт
        let _ = self.resume.send(());
    }

    /// Закрыть редактор и дождаться сохранения истории.
    async fn close(self) {
        let Self { input, resume, thread } = self;
        drop(resume);
        drop(input);
        if !matches!(tokio::task::spawn_blocking(move || thread.join()).await, Ok(Ok(()))) {
            tracing::warn!("readline thread did not shut down cleanly");
        }
    }
}

fn new_editor() -> rustyline::Result<DefaultEditor> {
    let config = Config::builder()
        .history_ignore_space(true)
        .max_history_size(MAX_HISTORY)?
        .build();
    let mut editor = DefaultEditor::with_config(config)?;
    editor.bind_sequence(KeyEvent::ctrl('c'), Cmd::Interrupt);
    Ok(editor)
}

fn read_lines(history: Option<PathBuf>, input: mpsc::Sender<Input>, resume: std_mpsc::Receiver<()>) {
    let mut editor = match new_editor() {
        Ok(editor) => editor,
        Err(e) => {
            let _ = input.blocking_send(Input::Failed(e.to_string()));
            return;
        }
    };
    if let Some(path) = &history {
        // при первом запуске файла ещё нет
        if let Err(e) = editor.load_history(path) {
            tracing::debug!(path = %path.display(), error = %e, "history not loaded");
        }
    }

    loop {
        let event = match editor.readline(PROMPT) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                Input::Line(line)
            }
            Err(ReadlineError::Interrupted) => Input::Interrupted,
            Err(ReadlineError::Eof) => Input::Eof,
            Err(e) => Input::Failed(e.to_string()),
        };
        let last = matches!(event, Input::Eof | Input::Failed(_));
        if input.blocking_send(event).is_err() || last || resume.recv().is_err() {
            break;
        }
    }

    if let Some(path) = &history {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = editor.save_history(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to save history");
        }
    }
}

/// Интерактивный цикл: строка редактора → команда → вывод.
///
/// Ошибки команд печатаются и не прерывают сессию; цикл завершается
/// по `exit` или Ctrl-D. Ctrl-C сбрасывает текущую строку.
pub async fn run(session: &Session, history: Option<PathBuf>) -> Result<(), CliError> {
    let mut reader = LineReader::spawn(history)?;

    let result = loop {
        let line = match reader.next().await {
            Input::Line(line) => line,
            Input::Interrupted => {
                println!("^C");
                reader.resume();
                continue;
            }
            Input::Eof => break Ok(()),
            Input::Failed(e) => break Err(CliError::Io(std::io::Error::other(e))),
        };

        match tokenize(&line) {
            Ok(tokens) => match run_line(session, &tokens).await {
                Ok(Some(Outcome::Exit)) => break Ok(()),
                Ok(Some(Outcome::Output(text))) => println!("{text}"),
                Ok(None) => {}
                Err(e) => eprintln!("{}", e.report()),
            },
            Err(e) => eprintln!("{}", e.report()),
        }
        reader.resume();
    };

    reader.close().await;
    result
}

/// Выполнить одну команду (`kscope exec ...`).
pub async fn exec(session: &Session, tokens: &[String]) -> Result<(), CliError> {
    match run_line(session, tokens).await? {
        Some(Outcome::Output(text)) => println!("{text}"),
        Some(Outcome::Exit) | None => {}
    }
    Ok(())
}
