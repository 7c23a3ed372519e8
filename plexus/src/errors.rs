// Error taxonomy for the plugin runtime.
//
// Remote failures are deliberately rehydrated as `Remote` (kind + message +
// traceback text) rather than reconstructed as their original type: the
// originating type may not even exist on this side of the wire. This is a
// diagnostic boundary, not a typed-catch boundary.

use callscript::{EvalError, ParseError};
use thiserror::Error;

pub type PlexusResult<T> = Result<T, PlexusError>;

#[derive(Debug, Error)]
pub enum PlexusError {
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("multiple functions named '{0}' exist; specify a plugin name to resolve the ambiguity")]
    AmbiguousFunction(String),

    #[error("{0}")]
    QueueOverflow(String),

    #[error("{0}")]
    NoEffect(String),

    #[error("plugin '{0}' is currently unreachable")]
    RemoteOffline(String),

    #[error("{0}")]
    RemoteTimeout(String),

    /// A failure that crossed the wire. Display-only; never matched on kind.
    #[error("{kind}: {message}")]
    Remote {
        kind: String,
        message: String,
        traceback: String,
    },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("invalid call: {0}")]
    SignatureMismatch(String),

    #[error("plugin system already started; registration is a boot-time operation")]
    AlreadyStarted,

    #[error("plugin system not started")]
    NotStarted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Codec(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("worker failure: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl PlexusError {
    /// Short kind label, used as the wire `type` of an exception return.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PlexusError::FunctionNotFound(_) => "FunctionNotFound",
            PlexusError::PluginNotFound(_) => "PluginNotFound",
            PlexusError::AmbiguousFunction(_) => "AmbiguousFunction",
            PlexusError::QueueOverflow(_) => "QueueOverflow",
            PlexusError::NoEffect(_) => "NoEffect",
            PlexusError::RemoteOffline(_) => "RemoteOffline",
            PlexusError::RemoteTimeout(_) => "RemoteTimeout",
            PlexusError::Remote { .. } => "RemoteException",
            PlexusError::UnknownVariable(_) => "UnknownVariable",
            PlexusError::Parse(_) => "ParseError",
            PlexusError::SignatureMismatch(_) => "SignatureMismatch",
            PlexusError::AlreadyStarted => "AlreadyStarted",
            PlexusError::NotStarted => "NotStarted",
            PlexusError::Protocol(_) => "ProtocolError",
            PlexusError::Codec(_) => "CodecError",
            PlexusError::Handshake(_) => "HandshakeError",
            PlexusError::Worker(_) => "WorkerError",
            PlexusError::Io(_) => "IoError",
            PlexusError::Internal(_) => "InternalError",
        }
    }

    /// Formatted failure string for interactive consumers (e.g. an LLM chat
    /// layer). Never leaks a raw stack trace into the caller's process.
    pub fn user_message(&self) -> String {
        match self {
            PlexusError::QueueOverflow(_) => {
                "No available workers right now. This is temporary; try again shortly.".to_string()
            }
            PlexusError::Remote { kind, message, .. } => {
                format!("The remote call failed ({}): {}", kind, message)
            }
            PlexusError::RemoteTimeout(msg) => msg.clone(),
            PlexusError::RemoteOffline(plugin) => {
                format!("Plugin '{}' is currently offline.", plugin)
            }
            other => other.to_string(),
        }
    }

    /// Whether this failure is worth retrying from the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlexusError::QueueOverflow(_))
    }
}

impl From<EvalError<PlexusError>> for PlexusError {
    fn from(err: EvalError<PlexusError>) -> Self {
        match err {
            EvalError::UnknownVariable(name) => PlexusError::UnknownVariable(name),
            EvalError::NoCalls => PlexusError::NoEffect(
                "Did you miss a function call? Or parentheses? No calls were detected in the code."
                    .to_string(),
            ),
            EvalError::Host(inner) => inner,
        }
    }
}
