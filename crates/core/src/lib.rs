pub mod listener;
pub mod multiplexer;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use listener::Listener;
pub use multiplexer::{Multiplexer, MultiplexerStats};
pub use protocol::{Close, Data, ElementName, IbbPayload, Open};
pub use stream::{IbbStream, StreamState};

// Re-export transport types
pub use transport::{
    InboundStanza, MemoryTransport, RouteKey, Router, SentStanza, StanzaHandler, StanzaKind,
    StanzaTransport,
};

// Re-export shared types so applications need only this crate
pub use ibb_common::{
    Carrier, Condition, ErrorType, IbbConfig, IbbError, Jid, Result, SessionId, StanzaError,
};
