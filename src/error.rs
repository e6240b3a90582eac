use crate::messages::problem_report::codes;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message type URI '{0}'")]
    MessageTypeParse(String),
    #[error("no handler registered for message type '{0}'")]
    NoHandler(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("failed to decrypt envelope: {0}")]
    Decryption(String),
    #[error("failed to encrypt envelope: {0}")]
    Encryption(String),
    #[error("key '{0}' not found in wallet")]
    KeyNotFound(String),
    #[error("{record_type} record '{id}' can not move from state '{from}' to '{to}'")]
    InvalidStateTransition {
        record_type: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("{record_type} record not found for {query}")]
    RecordNotFound {
        record_type: &'static str,
        query: String,
    },
    #[error("multiple {record_type} records found for {query}")]
    RecordDuplicate {
        record_type: &'static str,
        query: String,
    },
    #[error("{record_type} record '{id}' already exists")]
    RecordExists { record_type: &'static str, id: String },
    #[error("{record_type} record '{id}' was modified concurrently (expected version {expected}, stored {stored})")]
    StaleRecord {
        record_type: &'static str,
        id: String,
        expected: u64,
        stored: u64,
    },
    #[error("connection '{0}' is not ready")]
    ConnectionNotReady(String),
    #[error("message requires a connection or an inline ~service decorator")]
    MissingConnection,
    #[error("no stored credential satisfies the request: {0}")]
    NoMatchingCredential(String),
    #[error("peer reported problem '{code}': {comment}")]
    ProblemReported { code: String, comment: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("message '{0}' is undeliverable: all transport candidates failed")]
    UndeliverableMessage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("agent is shut down")]
    Shutdown,
    #[error("{0}")]
    Generic(String),
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    RegexError(#[from] regex::Error),
    #[error(transparent)]
    EdDsaError(#[from] ed25519_dalek::SignatureError),
    #[error(transparent)]
    StringConversionError(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Base64DecodeError(#[from] base64_url::base64::DecodeError),
}

impl Error {
    /// Problem-report code to send back to the peer when this error ends processing
    /// of one of its messages.
    pub fn problem_code(&self) -> &'static str {
        match self {
            Error::NoHandler(_) | Error::MessageTypeParse(_) => codes::UNSUPPORTED_MESSAGE,
            Error::InvalidStateTransition { .. } | Error::StaleRecord { .. } => codes::INVALID_STATE,
            Error::RecordNotFound { .. } | Error::RecordDuplicate { .. } => codes::THREAD_NOT_FOUND,
            Error::InvalidMessage(_) | Error::SerdeError(_) => codes::MESSAGE_PARSE_FAILURE,
            Error::ConnectionNotReady(_) | Error::MissingConnection => codes::CONNECTION_NOT_READY,
            Error::NoMatchingCredential(_) => codes::NO_MATCH,
            _ => codes::INTERNAL,
        }
    }

    /// Errors that concern only the offending message and never the agent as a whole.
    pub fn is_per_message(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Shutdown)
    }

    pub(crate) fn not_found(record_type: &'static str, query: impl Into<String>) -> Self {
        Error::RecordNotFound {
            record_type,
            query: query.into(),
        }
    }
}
