//! Shared types for the in-band bytestream crates: addresses, session
//! identifiers, carrier types, stanza errors, the error taxonomy and the
//! configuration layer.

pub mod config;
pub mod error;
pub mod stanza;
pub mod types;

pub use config::{protocol, ConfigError, IbbConfig};
pub use error::{IbbError, Result};
pub use stanza::{Condition, ErrorType, StanzaError};
pub use types::{Jid, JidError};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Opaque identifier of one bytestream session (the `sid` attribute).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; protocol::SID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap a remote-supplied id. Empty ids are rejected.
    pub fn new(sid: impl Into<String>) -> std::result::Result<Self, IbbError> {
        let sid = sid.into();
        if sid.is_empty() {
            return Err(IbbError::protocol("empty session id"));
        }
        Ok(Self(sid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = IbbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Stanza type used to carry data frames of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Carrier {
    /// Data frames travel in `iq` set requests and are acknowledged.
    #[default]
    Iq,
    /// Data frames travel in one-shot `message` stanzas.
    Message,
}

impl Carrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Iq => "iq",
            Carrier::Message => "message",
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Carrier {
    type Err = IbbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "iq" => Ok(Carrier::Iq),
            "message" => Ok(Carrier::Message),
            other => Err(IbbError::protocol(format!("unknown stanza carrier: {}", other))),
        }
    }
}
