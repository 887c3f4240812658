/// Category of a broker error. A closed topic ends a pipeline quietly, the
/// rest are reported as failures. Nothing here is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broker unreachable, request timed out, socket failure.
    Io,
    /// The topic or consumer was closed underneath the caller.
    Closed,
    /// Invalid client configuration (bad broker list, bad group id).
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Closed => f.write_str("closed"),
            ErrorKind::Config => f.write_str("config"),
        }
    }
}

/// Unified error type for every [`Broker`](crate::Broker) and
/// [`BrokerReader`](crate::BrokerReader) method.
#[derive(Clone)]
pub struct BrokerError {
    kind: ErrorKind,
    message: String,
}

impl BrokerError {
    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Closed, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message with context, keeping the kind.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl std::fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BrokerError {}
