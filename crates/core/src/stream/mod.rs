//! Per-session bytestream state machine

mod ibb_stream;
mod state;

pub use ibb_stream::IbbStream;
pub(crate) use ibb_stream::{CloseGuard, StreamParams, StreamShared};
pub use state::StreamState;
