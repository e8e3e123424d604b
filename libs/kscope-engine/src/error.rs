use kscope_api::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no cursor: select a topic first (kfirst/klast/kget) or pass a topic explicitly")]
    NoCursor,

    #[error("{0}")]
    Syntax(String),

    #[error("decoder '{reference}' not found: {detail}")]
    DecoderLookup { reference: String, detail: String },

    #[error("unsupported decoder '{0}': only avro (.avsc) schemas are supported")]
    UnsupportedDecoder(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        EngineError::Syntax(msg.into())
    }

    /// Ошибка синтаксиса команды/условия — остальные считаются runtime.
    pub fn is_syntax(&self) -> bool {
        matches!(self, EngineError::Syntax(_))
    }

    /// Add context to the error.
    ///
    /// For `Broker` variant, context is added to the inner `BrokerError`.
    /// For message-carrying variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Broker(e) => EngineError::Broker(e.with_context(ctx)),
            EngineError::Decode(msg) => EngineError::Decode(format!("{ctx}: {msg}")),
            EngineError::NotFound(msg) => EngineError::NotFound(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
