use crate::stanza::{Condition, ErrorType, StanzaError};
use crate::types::JidError;
use thiserror::Error;

/// Error taxonomy for in-band bytestreams
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IbbError {
    #[error("Remote declined the stream: {0}")]
    NegotiationRejected(StanzaError),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unexpected sequence number: expected {expected}, got {got}")]
    SequenceViolation { expected: u16, got: u16 },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Stream is closed")]
    Closed,

    #[error("Listener was closed")]
    ListenerClosed,

    #[error("Operation canceled")]
    Canceled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error: {0}")]
    Remote(StanzaError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for IBB operations
pub type Result<T> = std::result::Result<T, IbbError>;

impl IbbError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// The stanza error reported to the peer for a locally detected failure.
    pub fn stanza_error(&self) -> StanzaError {
        match self {
            IbbError::UnknownSession(_) => StanzaError::cancel(Condition::ItemNotFound),
            IbbError::SequenceViolation { .. } => {
                StanzaError::cancel(Condition::UnexpectedRequest)
            }
            IbbError::MalformedPayload(_) | IbbError::Protocol(_) | IbbError::InvalidAddress(_) => {
                StanzaError::cancel(Condition::BadRequest)
            }
            IbbError::ListenerClosed | IbbError::NegotiationRejected(_) => {
                StanzaError::cancel(Condition::NotAcceptable)
            }
            IbbError::Remote(err) => err.clone(),
            IbbError::Closed => StanzaError::cancel(Condition::ItemNotFound),
            IbbError::Canceled | IbbError::Timeout | IbbError::Transport(_) => {
                StanzaError::new(ErrorType::Wait, Condition::InternalServerError)
            }
        }
    }

    /// The defined condition behind this error, if it carries one.
    pub fn condition(&self) -> Option<Condition> {
        match self {
            IbbError::NegotiationRejected(err) | IbbError::Remote(err) => Some(err.condition),
            IbbError::UnknownSession(_)
            | IbbError::SequenceViolation { .. }
            | IbbError::MalformedPayload(_)
            | IbbError::InvalidAddress(_)
            | IbbError::Protocol(_) => Some(self.stanza_error().condition),
            _ => None,
        }
    }
}

impl From<JidError> for IbbError {
    fn from(err: JidError) -> Self {
        Self::InvalidAddress(err.to_string())
    }
}

impl From<std::io::Error> for IbbError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<IbbError> for std::io::Error {
    fn from(err: IbbError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            IbbError::Closed | IbbError::ListenerClosed => ErrorKind::NotConnected,
            IbbError::Timeout => ErrorKind::TimedOut,
            IbbError::Canceled => ErrorKind::Interrupted,
            IbbError::NegotiationRejected(_) => ErrorKind::ConnectionRefused,
            IbbError::MalformedPayload(_) => ErrorKind::InvalidData,
            IbbError::SequenceViolation { .. } | IbbError::Remote(_) => ErrorKind::ConnectionAborted,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
