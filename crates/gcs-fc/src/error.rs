use thiserror::Error;

/// Failure of a command or protocol exchange with the vehicle.
///
/// Every variant carries an operator-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Explicit negative acknowledgment from the vehicle.
    #[error("denied: {0}")]
    Denied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Unexpected message sequence or unknown identifier.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Another operation of the same kind is in flight or cooling down.
    #[error("busy: {0}")]
    Busy(String),

    /// Local precondition not met (no GPS, vehicle not level, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    Denied,
    Timeout,
    ProtocolViolation,
    Transport,
    Busy,
    Precondition,
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::NotConnected(_) => ErrorKind::NotConnected,
            CommandError::Denied(_) => ErrorKind::Denied,
            CommandError::Timeout(_) => ErrorKind::Timeout,
            CommandError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            CommandError::Transport(_) => ErrorKind::Transport,
            CommandError::Busy(_) => ErrorKind::Busy,
            CommandError::Precondition(_) => ErrorKind::Precondition,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CommandError::NotConnected(r)
            | CommandError::Denied(r)
            | CommandError::Timeout(r)
            | CommandError::ProtocolViolation(r)
            | CommandError::Transport(r)
            | CommandError::Busy(r)
            | CommandError::Precondition(r) => r,
        }
    }

    /// Worth retrying without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Busy)
    }
}

/// Failure at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A frame arrived but could not be decoded.
    #[error("decode: {0}")]
    Decode(String),

    #[error("io: {0}")]
    Io(String),

    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => CommandError::NotConnected("transport closed".into()),
            other => CommandError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
