//! Error types for the remdis dialogue system.

/// Top-level error type for the incremental dialogue system.
#[derive(Debug, thiserror::Error)]
pub enum RemdisError {
    /// Configuration is missing, unreadable, or out of range.
    #[error("config error: {0}")]
    ConfigInvalid(String),

    /// The message bus could not be reached within the retry budget.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// The LLM did not produce its first token within the deadline.
    #[error("LLM first token timed out after {0:.1}s")]
    LlmTimeout(f64),

    /// LLM request or stream error.
    #[error("LLM error: {0}")]
    LlmFailed(String),

    /// Speech recognizer adapter error.
    #[error("ASR error: {0}")]
    AsrFailed(String),

    /// Speech synthesis adapter error.
    #[error("TTS error: {0}")]
    TtsFailed(String),

    /// An IU referenced an ancestor that was never observed.
    #[error("causality violation: {update} IU {id} references unknown ancestor {ancestor}")]
    CausalityViolation {
        id: uuid::Uuid,
        ancestor: uuid::Uuid,
        update: &'static str,
    },

    /// An IU arrived on a chain that is already committed or revoked.
    #[error("protocol violation: {update} IU {id} on closed chain {chain}")]
    ProtocolViolation {
        id: uuid::Uuid,
        chain: uuid::Uuid,
        update: &'static str,
    },

    /// Channel send/receive error between tasks.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemdisError {
    /// Process exit code for this error class.
    ///
    /// 64 = configuration error, 69 = bus unavailable, 70 = internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid(_) => 64,
            Self::BusUnavailable(_) => 69,
            _ => 70,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RemdisError>;
