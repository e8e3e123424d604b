use kscope_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Syntax(String),

    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        CliError::Syntax(msg.into())
    }

    pub fn is_syntax(&self) -> bool {
        match self {
            CliError::Syntax(_) => true,
            CliError::Engine(e) => e.is_syntax(),
            _ => false,
        }
    }

    /// Строка для пользователя: "Syntax error: ..." или "Runtime error: ...".
    pub fn report(&self) -> String {
        if self.is_syntax() {
            format!("Syntax error: {self}")
        } else {
            format!("Runtime error: {self}")
        }
    }
}

impl From<kscope_api::BrokerError> for CliError {
    fn from(e: kscope_api::BrokerError) -> Self {
        CliError::Engine(EngineError::Broker(e))
    }
}
