//! In-band bytestream elements
//!
//! The three elements of the protocol: `open` negotiates a session,
//! `data` carries one base64 encoded block, `close` tears the session down.

use data_encoding::BASE64;
use ibb_common::{Carrier, IbbError, Result, SessionId};

/// `<open/>`: request to start a bytestream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub sid: SessionId,
    pub block_size: u16,
    pub stanza: Carrier,
}

/// `<data/>`: one block of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub sid: SessionId,
    pub seq: u16,
    /// Base64 text exactly as carried on the wire
    pub data: String,
}

/// `<close/>`: end of the bytestream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub sid: SessionId,
}

/// Any element in the IBB namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbbPayload {
    Open(Open),
    Data(Data),
    Close(Close),
}

impl IbbPayload {
    /// Local name of the element
    pub fn name(&self) -> &'static str {
        match self {
            IbbPayload::Open(_) => "open",
            IbbPayload::Data(_) => "data",
            IbbPayload::Close(_) => "close",
        }
    }

    pub fn sid(&self) -> &SessionId {
        match self {
            IbbPayload::Open(open) => &open.sid,
            IbbPayload::Data(data) => &data.sid,
            IbbPayload::Close(close) => &close.sid,
        }
    }
}

impl Data {
    /// Build a frame from raw bytes
    pub fn encode(sid: SessionId, seq: u16, bytes: &[u8]) -> Self {
        Self {
            sid,
            seq,
            data: BASE64.encode(bytes),
        }
    }

    /// Decode the frame body back into raw bytes.
    ///
    /// Whitespace inside the body is ignored, anything else that is not
    /// padded standard base64 is a malformed payload.
    pub fn decode(&self) -> Result<Vec<u8>> {
        let compact: Vec<u8> = self
            .data
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();

        BASE64
            .decode(&compact)
            .map_err(|e| IbbError::malformed(format!("seq {}: {}", self.seq, e)))
    }
}

impl From<Open> for IbbPayload {
    fn from(open: Open) -> Self {
        IbbPayload::Open(open)
    }
}

impl From<Data> for IbbPayload {
    fn from(data: Data) -> Self {
        IbbPayload::Data(data)
    }
}

impl From<Close> for IbbPayload {
    fn from(close: Close) -> Self {
        IbbPayload::Close(close)
    }
}
