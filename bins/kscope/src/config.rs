use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use broker_memory::{MemoryBrokerConfig, MemoryTopicConfig};
use kscope_engine::{SessionConfig, DEFAULT_FETCH_SIZE, DEFAULT_INBOUND_WAIT};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "kscope", about = "Инспектор партиционированного лога сообщений")]
pub struct Cli {
    /// Путь к TOML конфиг файлу (без него — пустой in-memory кластер)
    #[arg(long, global = true, env = "KSCOPE_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Интерактивная сессия: строчный редактор с историей команд
    Shell,
    /// Выполнить одну команду и выйти
    Exec(ExecArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ExecArgs {
    /// Команда и её аргументы, напр. `kfirst orders 0`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct KscopeConfig {
    /// Максимальный размер одного fetch, байт.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// Пауза `kinbound` между базовым и настоящим замером.
    #[serde(default = "default_inbound_wait_secs")]
    pub inbound_wait_secs: u64,
    #[serde(default)]
    pub auto_create_topics: bool,
    /// Файл истории shell'а; по умолчанию `~/.kscope_history`.
    #[serde(default)]
    pub history_file: Option<PathBuf>,
    #[serde(default)]
    pub topics: Vec<MemoryTopicConfig>,
}

fn default_fetch_size() -> usize {
    DEFAULT_FETCH_SIZE
}
fn default_inbound_wait_secs() -> u64 {
    DEFAULT_INBOUND_WAIT.as_secs()
}

impl Default for KscopeConfig {
    fn default() -> Self {
        Self {
            fetch_size: default_fetch_size(),
            inbound_wait_secs: default_inbound_wait_secs(),
            auto_create_topics: false,
            history_file: None,
            topics: Vec::new(),
        }
    }
}

impl KscopeConfig {
    pub fn load(path: Option<&str>) -> Result<Self, CliError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content)
            .map_err(|e| CliError::Config { context: "parse", detail: format!("'{path}': {e}") })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            fetch_size: self.fetch_size,
            inbound_wait: Duration::from_secs(self.inbound_wait_secs),
        }
    }

    /// Явный `history_file` или `$HOME/.kscope_history`; без HOME история
    /// не сохраняется.
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history_file.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kscope_history"))
        })
    }

    pub fn broker(&self) -> MemoryBrokerConfig {
        MemoryBrokerConfig {
            topics: self.topics.clone(),
            auto_create_topics: self.auto_create_topics,
        }
    }
}
