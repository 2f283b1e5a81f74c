//! Ordered byte stream over IBB data frames
//!
//! Outbound bytes are cut into blocks, base64 encoded and sent one frame at a
//! time with a 16-bit sequence number. Inbound frames are checked against the
//! expected sequence number, decoded and queued for the reader.

use super::state::StreamState;
use crate::multiplexer::Registry;
use crate::protocol::{Close, Data, IbbPayload};
use crate::transport::StanzaTransport;
use bytes::Bytes;
use ibb_common::{Carrier, Condition, IbbError, Jid, Result, SessionId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parameters fixed once a stream is negotiated
#[derive(Debug, Clone)]
pub(crate) struct StreamParams {
    pub sid: SessionId,
    pub local: Jid,
    pub peer: Jid,
    pub carrier: Carrier,
    pub block_size: u16,
}

struct Control {
    state: StreamState,
    /// Next sequence number expected from the peer
    seq_in: u16,
    /// Dropped on close so the reader sees end-of-stream after draining
    inbound: Option<mpsc::Sender<Bytes>>,
    failure: Option<IbbError>,
}

struct ReadHalf {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

struct WriteHalf {
    /// Sequence number of the next outbound frame
    seq: u16,
}

pub(crate) struct StreamShared {
    params: StreamParams,
    control: Mutex<Control>,
    reader: tokio::sync::Mutex<ReadHalf>,
    writer: tokio::sync::Mutex<WriteHalf>,
    transport: Arc<dyn StanzaTransport>,
    registry: Weak<Registry>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StreamShared {
    pub(crate) fn new(
        params: StreamParams,
        state: StreamState,
        buffer_frames: usize,
        transport: Arc<dyn StanzaTransport>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(buffer_frames.max(1));

        Arc::new(Self {
            params,
            control: Mutex::new(Control {
                state,
                seq_in: 0,
                inbound: Some(tx),
                failure: None,
            }),
            reader: tokio::sync::Mutex::new(ReadHalf {
                rx,
                pending: Bytes::new(),
            }),
            writer: tokio::sync::Mutex::new(WriteHalf { seq: 0 }),
            transport,
            registry,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sid(&self) -> &SessionId {
        &self.params.sid
    }

    pub(crate) fn peer(&self) -> &Jid {
        &self.params.peer
    }

    pub(crate) fn state(&self) -> StreamState {
        self.control().state
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Opening -> Open
    pub(crate) fn mark_open(&self) -> Result<()> {
        let mut control = self.control();
        match control.state {
            StreamState::Opening => {
                control.state = StreamState::Open;
                debug!("IBB stream {} is open", self.params.sid);
                Ok(())
            }
            StreamState::Open => Ok(()),
            StreamState::Closing | StreamState::Closed => {
                Err(control.failure.clone().unwrap_or(IbbError::Closed))
            }
        }
    }

    /// Move to Closed, wake the reader and leave the registry.
    ///
    /// Returns false when the stream was already closed.
    pub(crate) fn finish(&self, cause: Option<IbbError>) -> bool {
        {
            let mut control = self.control();
            if control.state == StreamState::Closed {
                return false;
            }
            control.state = StreamState::Closed;
            control.inbound = None;
            control.failure = cause.clone();
        }

        match &cause {
            Some(err) => warn!(
                "IBB stream {} with {} closed: {}",
                self.params.sid, self.params.peer, err
            ),
            None => info!("IBB stream {} with {} closed", self.params.sid, self.params.peer),
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self);
        }
        true
    }

    /// Close locally and send a best-effort close to the peer
    pub(crate) fn abort(&self, cause: Option<IbbError>) {
        if !self.finish(cause) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let peer = self.params.peer.clone();
        let close = IbbPayload::Close(Close {
            sid: self.params.sid.clone(),
        });
        handle.spawn(async move {
            if let Err(e) = transport.send_iq(&peer, &close).await {
                debug!("Close for aborted stream {} failed: {}", close.sid(), e);
            }
        });
    }

    /// Accept one inbound frame.
    ///
    /// A wrong sequence number or an undecodable body closes the stream;
    /// the returned error is what the peer gets told.
    pub(crate) async fn deliver(&self, data: &Data) -> Result<()> {
        let decoded = data.decode();

        let outcome = {
            let mut control = self.control();
            if !control.state.accepts_data() {
                Err(IbbError::UnknownSession(data.sid.to_string()))
            } else if data.seq != control.seq_in {
                Err(IbbError::SequenceViolation {
                    expected: control.seq_in,
                    got: data.seq,
                })
            } else {
                decoded.map(|bytes| {
                    control.seq_in = control.seq_in.wrapping_add(1);
                    (control.inbound.clone(), bytes)
                })
            }
        };

        let (sender, bytes) = match outcome {
            Ok(accepted) => accepted,
            Err(IbbError::UnknownSession(sid)) => return Err(IbbError::UnknownSession(sid)),
            Err(err) => {
                self.finish(Some(err.clone()));
                return Err(err);
            }
        };

        debug!(
            "IBB stream {}: received seq {} ({} bytes)",
            self.params.sid,
            data.seq,
            bytes.len()
        );
        self.bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if let Some(sender) = sender {
            if !bytes.is_empty() && sender.send(Bytes::from(bytes)).await.is_err() {
                debug!("IBB stream {}: reader is gone", self.params.sid);
            }
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        let control = self.control();
        match control.state {
            StreamState::Open => Ok(()),
            StreamState::Opening => Err(IbbError::protocol("stream is still opening")),
            StreamState::Closing => Err(IbbError::Closed),
            StreamState::Closed => Err(control.failure.clone().unwrap_or(IbbError::Closed)),
        }
    }

    fn end_of_stream(&self) -> Result<usize> {
        match self.control().failure.clone() {
            Some(err) => Err(err),
            None => Ok(0),
        }
    }
}

/// Closes a stream when dropped while still armed.
///
/// Covers futures dropped at an await point where the peer's view of the
/// stream is unknown.
pub(crate) struct CloseGuard {
    stream: Arc<StreamShared>,
    cause: Option<IbbError>,
    notify_peer: bool,
    armed: bool,
}

impl CloseGuard {
    pub(crate) fn new(stream: Arc<StreamShared>, cause: Option<IbbError>, notify_peer: bool) -> Self {
        Self {
            stream,
            cause,
            notify_peer,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cause = self.cause.take();
        if self.notify_peer {
            self.stream.abort(cause);
        } else {
            self.stream.finish(cause);
        }
    }
}

/// Handle to one in-band bytestream.
///
/// Clones share the same stream, so one task can read while another writes.
#[derive(Clone)]
pub struct IbbStream {
    shared: Arc<StreamShared>,
}

impl IbbStream {
    pub(crate) fn from_shared(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn abort(&self, cause: Option<IbbError>) {
        self.shared.abort(cause);
    }

    pub fn sid(&self) -> &SessionId {
        &self.shared.params.sid
    }

    pub fn local_addr(&self) -> &Jid {
        &self.shared.params.local
    }

    pub fn peer(&self) -> &Jid {
        &self.shared.params.peer
    }

    pub fn carrier(&self) -> Carrier {
        self.shared.params.carrier
    }

    pub fn block_size(&self) -> u16 {
        self.shared.params.block_size
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received()
    }

    /// Send all of `buf`, one frame per block.
    ///
    /// Concurrent writers are serialized. If the future is dropped while a
    /// frame is in flight the stream is closed, since the peer may or may
    /// not have seen that sequence number.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let shared = &self.shared;
        let mut writer = shared.writer.lock().await;
        shared.ensure_writable()?;

        for chunk in buf.chunks(usize::from(shared.params.block_size)) {
            shared.ensure_writable()?;

            let seq = writer.seq;
            let frame = IbbPayload::Data(Data::encode(shared.params.sid.clone(), seq, chunk));

            let guard = CloseGuard::new(shared.clone(), Some(IbbError::Canceled), true);
            let sent = match shared.params.carrier {
                Carrier::Iq => shared.transport.send_iq(&shared.params.peer, &frame).await,
                Carrier::Message => {
                    shared
                        .transport
                        .send_message(&shared.params.peer, &frame)
                        .await
                }
            };
            guard.disarm();

            if let Err(err) = sent {
                shared.finish(Some(err.clone()));
                return Err(err);
            }

            writer.seq = seq.wrapping_add(1);
            shared
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            debug!(
                "IBB stream {}: sent seq {} ({} bytes)",
                shared.params.sid,
                seq,
                chunk.len()
            );
        }

        Ok(buf.len())
    }

    /// Read buffered bytes, waiting for the next frame if there are none.
    ///
    /// Returns `Ok(0)` once the stream is closed and drained. A stream
    /// closed by a protocol or transport failure returns that failure
    /// instead.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut reader = self.shared.reader.lock().await;
        if reader.pending.is_empty() {
            match reader.rx.recv().await {
                Some(chunk) => reader.pending = chunk,
                None => return self.shared.end_of_stream(),
            }
        }

        let n = buf.len().min(reader.pending.len());
        let chunk = reader.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    /// Fill `buf` completely
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(IbbError::Closed),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Read until end-of-stream or `max_size` bytes
    pub async fn read_to_end(&self, max_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut temp = vec![0u8; usize::from(self.block_size()).max(1)];

        while out.len() < max_size {
            let want = (max_size - out.len()).min(temp.len());
            match self.read(&mut temp[..want]).await? {
                0 => break,
                n => out.extend_from_slice(&temp[..n]),
            }
        }

        Ok(out)
    }

    /// Close the stream.
    ///
    /// Waits for an in-flight write, sends `close` and moves to Closed.
    /// Repeated calls return `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut control = shared.control();
            match control.state {
                StreamState::Closing | StreamState::Closed => return Ok(()),
                StreamState::Opening | StreamState::Open => control.state = StreamState::Closing,
            }
        }
        debug!("IBB stream {}: closing", shared.params.sid);

        let guard = CloseGuard::new(shared.clone(), None, true);
        let _writer = shared.writer.lock().await;
        let close = IbbPayload::Close(Close {
            sid: shared.params.sid.clone(),
        });
        let result = shared.transport.send_iq(&shared.params.peer, &close).await;
        guard.disarm();

        match result {
            Ok(()) => {
                shared.finish(None);
                Ok(())
            }
            // The peer already forgot the session, which is what we wanted.
            Err(IbbError::Remote(err)) if err.condition == Condition::ItemNotFound => {
                shared.finish(None);
                Ok(())
            }
            Err(err) => {
                shared.finish(Some(err.clone()));
                Err(err)
            }
        }
    }
}

impl fmt::Debug for IbbStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IbbStream")
            .field("sid", self.sid())
            .field("peer", self.peer())
            .field("carrier", &self.carrier())
            .field("block_size", &self.block_size())
            .field("state", &self.state())
            .finish()
    }
}
