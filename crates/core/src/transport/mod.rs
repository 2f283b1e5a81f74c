//! Stanza transport capability
//!
//! The bytestream layer never touches the XML stream itself. It needs three
//! things from the session underneath it:
//! - send a one-shot message
//! - send an iq request and await the correlated result or error
//! - have inbound stanzas with a given payload routed to a handler

mod memory;
mod router;

pub use memory::{MemoryTransport, SentStanza};
pub use router::{RouteKey, Router};

use crate::protocol::IbbPayload;
use async_trait::async_trait;
use ibb_common::{Jid, Result, StanzaError};

/// Kind of stanza a payload travelled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Iq,
    Message,
}

/// An inbound stanza handed to a [`StanzaHandler`]
#[derive(Debug, Clone)]
pub struct InboundStanza {
    pub kind: StanzaKind,
    pub from: Jid,
    pub to: Jid,
    /// Serialized payload element
    pub payload: String,
    /// Set when the stanza is an error bounced back by the peer
    pub error: Option<StanzaError>,
}

/// Outbound half of a session.
///
/// Dropping a returned future cancels the operation. Callers apply their
/// own deadlines.
#[async_trait]
pub trait StanzaTransport: Send + Sync {
    /// Address of the local entity
    fn local_addr(&self) -> Jid;

    /// Send a payload in a one-shot message
    async fn send_message(&self, to: &Jid, payload: &IbbPayload) -> Result<()>;

    /// Send a payload in an iq set and wait for the reply.
    ///
    /// An error reply comes back as `IbbError::Remote`.
    async fn send_iq(&self, to: &Jid, payload: &IbbPayload) -> Result<()>;
}

/// Inbound half of a session: receives stanzas matched by a [`Router`].
///
/// For iq stanzas the result becomes the result or error reply. For
/// messages success is silent and an error is bounced to the sender.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    async fn handle_stanza(&self, stanza: InboundStanza) -> std::result::Result<(), StanzaError>;
}
