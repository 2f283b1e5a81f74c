use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type attribute of a stanza error (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(ErrorType::Auth),
            "cancel" => Ok(ErrorType::Cancel),
            "continue" => Ok(ErrorType::Continue),
            "modify" => Ok(ErrorType::Modify),
            "wait" => Ok(ErrorType::Wait),
            other => Err(format!("unknown error type: {}", other)),
        }
    }
}

/// Defined stanza error conditions used by in-band bytestreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    BadRequest,
    InternalServerError,
    ItemNotFound,
    NotAcceptable,
    ResourceConstraint,
    ServiceUnavailable,
    UnexpectedRequest,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::BadRequest => "bad-request",
            Condition::InternalServerError => "internal-server-error",
            Condition::ItemNotFound => "item-not-found",
            Condition::NotAcceptable => "not-acceptable",
            Condition::ResourceConstraint => "resource-constraint",
            Condition::ServiceUnavailable => "service-unavailable",
            Condition::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bad-request" => Ok(Condition::BadRequest),
            "internal-server-error" => Ok(Condition::InternalServerError),
            "item-not-found" => Ok(Condition::ItemNotFound),
            "not-acceptable" => Ok(Condition::NotAcceptable),
            "resource-constraint" => Ok(Condition::ResourceConstraint),
            "service-unavailable" => Ok(Condition::ServiceUnavailable),
            "unexpected-request" => Ok(Condition::UnexpectedRequest),
            other => Err(format!("unknown condition: {}", other)),
        }
    }
}

/// A stanza-level error as carried in an `<error/>` child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    pub kind: ErrorType,
    pub condition: Condition,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(kind: ErrorType, condition: Condition) -> Self {
        Self {
            kind,
            condition,
            text: None,
        }
    }

    /// Shorthand for the `cancel` errors IBB responds with.
    pub fn cancel(condition: Condition) -> Self {
        Self::new(ErrorType::Cancel, condition)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition.as_str(), self.kind.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

impl std::error::Error for StanzaError {}
