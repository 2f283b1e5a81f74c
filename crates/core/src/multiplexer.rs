//! Bytestream multiplexer
//!
//! Owns the session registry and the listener registry, routes inbound
//! `open`/`data`/`close` payloads to the right stream or listener, and
//! drives outbound negotiation.
//!
//! Both registries sit behind short-lived locks that are never held across
//! an await point.

use crate::listener::Listener;
use crate::protocol::{Data, ElementName, IbbPayload, Open};
use crate::stream::{CloseGuard, IbbStream, StreamParams, StreamShared, StreamState};
use crate::transport::{InboundStanza, Router, StanzaHandler, StanzaKind, StanzaTransport};
use async_trait::async_trait;
use ibb_common::{
    protocol::NS, Carrier, Condition, ErrorType, IbbConfig, IbbError, Jid, Result, SessionId,
    StanzaError,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Tables {
    streams: HashMap<SessionId, Arc<StreamShared>>,
    listeners: HashMap<Jid, Listener>,
}

/// Registries shared by the multiplexer and its streams
pub(crate) struct Registry {
    transport: Arc<dyn StanzaTransport>,
    config: IbbConfig,
    /// Held for map operations only
    tables: Mutex<Tables>,
}

impl Registry {
    /// Remove a stream, but only the exact instance given
    pub(crate) fn deregister(&self, stream: &StreamShared) {
        let mut tables = lock(&self.tables);
        let streams = &mut tables.streams;
        let registered = streams
            .get(stream.sid())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), stream));
        if registered {
            streams.remove(stream.sid());
            debug!("Deregistered IBB stream {}", stream.sid());
        }
    }

    fn lookup(&self, sid: &SessionId) -> Option<Arc<StreamShared>> {
        lock(&self.tables)
            .streams
            .get(sid)
            .filter(|stream| stream.state().is_registered())
            .cloned()
    }
}

/// Snapshot of multiplexer activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub streams: usize,
    pub opening: usize,
    pub open: usize,
    pub closing: usize,
    pub listeners: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Multiplexes in-band bytestreams over one stanza session
#[derive(Clone)]
pub struct Multiplexer {
    registry: Arc<Registry>,
}

impl Multiplexer {
    pub fn new(transport: Arc<dyn StanzaTransport>, config: IbbConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                transport,
                config,
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    pub fn config(&self) -> &IbbConfig {
        &self.registry.config
    }

    /// Register the IBB payload routes on a router
    pub fn register_routes(&self, router: &Router) {
        let handler: Arc<dyn StanzaHandler> = Arc::new(self.clone());
        for local in ["open", "close", "data"] {
            router.register(StanzaKind::Iq, ElementName::new(NS, local), handler.clone());
        }
        router.register(StanzaKind::Message, ElementName::new(NS, "data"), handler);
    }

    /// Listener for inbound streams addressed to the bare form of `addr`.
    ///
    /// Returns the existing listener when one was already registered.
    pub fn listen(&self, addr: &Jid) -> Listener {
        let bare = addr.bare();
        lock(&self.registry.tables)
            .listeners
            .entry(bare.clone())
            .or_insert_with(|| {
                info!("Listening for IBB streams on {}", bare);
                Listener::new(bare, self.registry.config.accept_backlog)
            })
            .clone()
    }

    /// Handle to a registered stream
    pub fn stream(&self, sid: &SessionId) -> Option<IbbStream> {
        self.registry.lookup(sid).map(IbbStream::from_shared)
    }

    pub fn stats(&self) -> MultiplexerStats {
        let (streams, listeners) = {
            let tables = lock(&self.registry.tables);
            let streams: Vec<_> = tables.streams.values().cloned().collect();
            (streams, tables.listeners.len())
        };

        let mut stats = MultiplexerStats {
            listeners,
            ..Default::default()
        };
        stats.streams = streams.len();
        for stream in streams {
            match stream.state() {
                StreamState::Opening => stats.opening += 1,
                StreamState::Open => stats.open += 1,
                StreamState::Closing => stats.closing += 1,
                StreamState::Closed => {}
            }
            stats.bytes_sent += stream.bytes_sent();
            stats.bytes_received += stream.bytes_received();
        }
        stats
    }

    /// Open a stream to `to`, giving up after the configured open timeout.
    /// A block size of 0 selects the configured default.
    pub async fn open(&self, to: &Jid, carrier: Carrier, block_size: u16) -> Result<IbbStream> {
        self.open_with_timeout(self.registry.config.open_timeout(), to, carrier, block_size)
            .await
    }

    /// Negotiate a new outbound stream, giving up after `deadline`.
    ///
    /// Nothing stays registered unless the peer accepted: on rejection,
    /// timeout or cancellation the reserved session is released.
    pub async fn open_with_timeout(
        &self,
        deadline: Duration,
        to: &Jid,
        carrier: Carrier,
        block_size: u16,
    ) -> Result<IbbStream> {
        match tokio::time::timeout(deadline, self.negotiate(to, carrier, block_size)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("IBB open to {} timed out after {:?}", to, deadline);
                Err(IbbError::Timeout)
            }
        }
    }

    async fn negotiate(&self, to: &Jid, carrier: Carrier, block_size: u16) -> Result<IbbStream> {
        let block_size = self.registry.config.block_size_or_default(block_size);
        if block_size == 0 {
            return Err(IbbError::protocol("block size must be non-zero"));
        }
        let stream = self.reserve(to, carrier, block_size);
        let sid = stream.sid().clone();
        debug!("Opening IBB stream {} to {} ({}, block size {})", sid, to, carrier, block_size);

        let guard = CloseGuard::new(stream.clone(), Some(IbbError::Canceled), true);
        let open = IbbPayload::Open(Open {
            sid: sid.clone(),
            block_size,
            stanza: carrier,
        });
        let response = self.registry.transport.send_iq(to, &open).await;
        guard.disarm();

        match response {
            Ok(()) => {
                stream.mark_open()?;
                info!("Opened IBB stream {} to {}", sid, to);
                Ok(IbbStream::from_shared(stream))
            }
            Err(IbbError::Remote(err)) => {
                stream.finish(None);
                warn!("{} declined IBB stream {}: {}", to, sid, err);
                Err(IbbError::NegotiationRejected(err))
            }
            Err(err) => {
                stream.finish(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Register an Opening stream under a fresh session id
    fn reserve(&self, to: &Jid, carrier: Carrier, block_size: u16) -> Arc<StreamShared> {
        let mut tables = lock(&self.registry.tables);
        let streams = &mut tables.streams;
        let sid = loop {
            let sid = SessionId::generate();
            if !streams.contains_key(&sid) {
                break sid;
            }
            debug!("Session id {} already in use, generating another", sid);
        };

        let stream = StreamShared::new(
            StreamParams {
                sid: sid.clone(),
                local: self.registry.transport.local_addr(),
                peer: to.clone(),
                carrier,
                block_size,
            },
            StreamState::Opening,
            self.registry.config.inbound_buffer_frames,
            self.registry.transport.clone(),
            Arc::downgrade(&self.registry),
        );
        streams.insert(sid, stream.clone());
        stream
    }

    /// Inbound `open`: admit the stream if someone listens on `to`
    pub async fn handle_open(
        &self,
        from: &Jid,
        to: &Jid,
        open: Open,
    ) -> std::result::Result<(), StanzaError> {
        let listener = lock(&self.registry.tables).listeners.get(&to.bare()).cloned();
        let listener = match listener {
            Some(listener) if !listener.is_closed() => listener,
            _ => {
                warn!("Refusing IBB stream {} from {}: nobody listens on {}", open.sid, from, to);
                return Err(StanzaError::cancel(Condition::NotAcceptable));
            }
        };

        if open.block_size == 0 {
            return Err(StanzaError::cancel(Condition::BadRequest).with_text("block-size must be positive"));
        }
        if open.block_size > self.registry.config.max_block_size {
            warn!(
                "Refusing IBB stream {} from {}: block size {} over {}",
                open.sid, from, open.block_size, self.registry.config.max_block_size
            );
            return Err(StanzaError::new(ErrorType::Modify, Condition::ResourceConstraint));
        }

        let stream = {
            let mut tables = lock(&self.registry.tables);
            let streams = &mut tables.streams;
            if streams.contains_key(&open.sid) {
                warn!("Refusing IBB stream from {}: session {} already in use", from, open.sid);
                return Err(StanzaError::cancel(Condition::NotAcceptable));
            }
            let stream = StreamShared::new(
                StreamParams {
                    sid: open.sid.clone(),
                    local: to.clone(),
                    peer: from.clone(),
                    carrier: open.stanza,
                    block_size: open.block_size,
                },
                StreamState::Opening,
                self.registry.config.inbound_buffer_frames,
                self.registry.transport.clone(),
                Arc::downgrade(&self.registry),
            );
            streams.insert(open.sid.clone(), stream.clone());
            stream
        };

        // The peer learns nothing unless we answer, so a dropped handler
        // only needs to release the registration.
        let guard = CloseGuard::new(stream.clone(), None, false);
        stream
            .mark_open()
            .map_err(|_| StanzaError::cancel(Condition::NotAcceptable))?;

        match listener.enqueue(IbbStream::from_shared(stream.clone())).await {
            Ok(()) => {
                guard.disarm();
                info!("Accepted IBB stream {} from {} for {}", open.sid, from, listener.addr());
                Ok(())
            }
            Err(_) => {
                debug!("Listener {} closed while admitting {}", listener.addr(), open.sid);
                drop(guard);
                Err(StanzaError::cancel(Condition::NotAcceptable))
            }
        }
    }

    /// Inbound `close`: the peer is done with the session
    pub async fn handle_close(&self, from: &Jid, sid: &SessionId) -> std::result::Result<(), StanzaError> {
        let stream = self.peer_stream(from, sid)?;
        stream.finish(None);
        Ok(())
    }

    /// Inbound `data`, whichever stanza carried it
    pub async fn handle_data(&self, from: &Jid, data: Data) -> std::result::Result<(), StanzaError> {
        let stream = self.peer_stream(from, &data.sid)?;
        stream.deliver(&data).await.map_err(|err| err.stanza_error())
    }

    /// A data message we sent came back as an error
    fn handle_bounce(&self, from: &Jid, sid: &SessionId, error: StanzaError) {
        match self.peer_stream(from, sid) {
            Ok(stream) => {
                stream.finish(Some(IbbError::Remote(error)));
            }
            Err(_) => debug!("Ignoring bounced data for unknown session {}", sid),
        }
    }

    fn peer_stream(&self, from: &Jid, sid: &SessionId) -> std::result::Result<Arc<StreamShared>, StanzaError> {
        match self.registry.lookup(sid) {
            Some(stream) if sent_by(stream.peer(), from) => Ok(stream),
            _ => {
                debug!("Unknown IBB session {} from {}", sid, from);
                Err(IbbError::UnknownSession(sid.to_string()).stanza_error())
            }
        }
    }
}

/// Whether `from` is the stream's peer. A stream opened to a bare address
/// accepts traffic from any resource of it.
fn sent_by(peer: &Jid, from: &Jid) -> bool {
    peer == from || (peer.is_bare() && *peer == from.bare())
}

#[async_trait]
impl StanzaHandler for Multiplexer {
    async fn handle_stanza(&self, stanza: InboundStanza) -> std::result::Result<(), StanzaError> {
        let payload = IbbPayload::from_xml(&stanza.payload).map_err(|err| {
            warn!("Malformed IBB payload from {}: {}", stanza.from, err);
            err.stanza_error()
        })?;

        if let Some(error) = stanza.error {
            if let IbbPayload::Data(data) = &payload {
                self.handle_bounce(&stanza.from, &data.sid, error);
            }
            return Ok(());
        }

        match (stanza.kind, payload) {
            (StanzaKind::Iq, IbbPayload::Open(open)) => {
                self.handle_open(&stanza.from, &stanza.to, open).await
            }
            (StanzaKind::Iq, IbbPayload::Close(close)) => {
                self.handle_close(&stanza.from, &close.sid).await
            }
            (_, IbbPayload::Data(data)) => self.handle_data(&stanza.from, data).await,
            (StanzaKind::Message, other) => {
                warn!("Unexpected <{}/> in a message from {}", other.name(), stanza.from);
                Err(StanzaError::cancel(Condition::BadRequest))
            }
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("local", &self.registry.transport.local_addr())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Close;
    use crate::transport::MemoryTransport;

    struct Endpoints {
        alice: Multiplexer,
        bob: Multiplexer,
        alice_transport: Arc<MemoryTransport>,
        bob_transport: Arc<MemoryTransport>,
    }

    fn alice_addr() -> Jid {
        "alice@example.net/a".parse().unwrap()
    }

    fn bob_addr() -> Jid {
        "bob@example.net/b".parse().unwrap()
    }

    fn endpoints(config: IbbConfig) -> Endpoints {
        let (alice_transport, bob_transport) = MemoryTransport::pair(alice_addr(), bob_addr());
        let alice = Multiplexer::new(alice_transport.clone(), config.clone());
        let bob = Multiplexer::new(bob_transport.clone(), config);
        alice.register_routes(alice_transport.router());
        bob.register_routes(bob_transport.router());
        Endpoints {
            alice,
            bob,
            alice_transport,
            bob_transport,
        }
    }

    fn data_xml(sid: &SessionId, seq: u16, body: &str) -> String {
        IbbPayload::Data(Data {
            sid: sid.clone(),
            seq,
            data: body.to_string(),
        })
        .to_xml()
        .unwrap()
    }

    #[test]
    fn test_listen_is_idempotent_per_bare_address() {
        let ep = endpoints(IbbConfig::default());
        let first = ep.bob.listen(&bob_addr());
        let second = ep.bob.listen(&"bob@example.net/other".parse().unwrap());
        assert_eq!(first.addr(), second.addr());
        assert_eq!(ep.bob.stats().listeners, 1);

        first.close();
        assert!(second.is_closed());
    }

    #[test]
    fn test_register_routes() {
        let ep = endpoints(IbbConfig::default());
        let router = ep.bob_transport.router();
        for local in ["open", "close", "data"] {
            assert!(router.is_registered(StanzaKind::Iq, &ElementName::new(NS, local)));
        }
        assert!(router.is_registered(StanzaKind::Message, &ElementName::new(NS, "data")));
        assert!(!router.is_registered(StanzaKind::Message, &ElementName::new(NS, "open")));
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());

        let outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        assert_eq!(outbound.sid(), inbound.sid());
        assert_eq!(outbound.state(), StreamState::Open);
        assert_eq!(inbound.state(), StreamState::Open);
        assert_eq!(inbound.peer(), &alice_addr());
        assert_eq!(outbound.block_size(), 4096);
        assert_eq!(inbound.block_size(), 4096);
        assert!(ep.alice.stream(outbound.sid()).is_some());
        assert!(ep.bob.stream(inbound.sid()).is_some());
    }

    #[tokio::test]
    async fn test_open_without_listener_is_not_acceptable() {
        let ep = endpoints(IbbConfig::default());
        let err = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap_err();

        match err {
            IbbError::NegotiationRejected(stanza) => {
                assert_eq!(stanza.condition, Condition::NotAcceptable);
                assert_eq!(stanza.kind, ErrorType::Cancel);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ep.alice.stats().streams, 0);
        assert_eq!(ep.bob.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_open_after_listener_close_is_not_acceptable() {
        let ep = endpoints(IbbConfig::default());
        ep.bob.listen(&bob_addr()).close();

        let err = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap_err();
        assert_eq!(err.condition(), Some(Condition::NotAcceptable));
        assert_eq!(ep.bob.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_oversized_block_is_resource_constraint() {
        let (alice_transport, bob_transport) = MemoryTransport::pair(alice_addr(), bob_addr());
        let alice = Multiplexer::new(alice_transport.clone(), IbbConfig::default());
        let bob = Multiplexer::new(
            bob_transport.clone(),
            IbbConfig::default().with_block_size(1024).with_max_block_size(1024),
        );
        bob.register_routes(bob_transport.router());
        let _listener = bob.listen(&bob_addr());

        let err = alice.open(&bob_addr(), Carrier::Iq, 2048).await.unwrap_err();
        assert_eq!(err.condition(), Some(Condition::ResourceConstraint));
        assert!(alice.open(&bob_addr(), Carrier::Iq, 1024).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_default_block_size_is_refused_before_sending() {
        let ep = endpoints(IbbConfig::default().with_block_size(0));
        let _listener = ep.bob.listen(&bob_addr());

        let err = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap_err();
        assert!(matches!(err, IbbError::Protocol(_)));
        assert!(ep.alice_transport.sent().is_empty());
        assert_eq!(ep.alice.stats().streams, 0);

        // An explicit size still works
        let stream = ep.alice.open(&bob_addr(), Carrier::Iq, 8).await.unwrap();
        assert_eq!(stream.write(b"sixteen bytes!!!").await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_inbound_zero_block_size_is_bad_request() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let open = Open {
            sid: SessionId::new("zero").unwrap(),
            block_size: 0,
            stanza: Carrier::Iq,
        };

        let err = ep
            .bob
            .handle_open(&alice_addr(), &bob_addr(), open)
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::BadRequest);
        assert_eq!(err.kind, ErrorType::Cancel);
        assert_eq!(ep.bob.stats().streams, 0);
        assert_eq!(listener.pending(), 0);
    }

    #[test]
    fn test_bare_peer_matches_any_resource() {
        let bare: Jid = "bob@example.net".parse().unwrap();
        assert!(sent_by(&bare, &bob_addr()));
        assert!(sent_by(&bob_addr(), &bob_addr()));
        assert!(!sent_by(&bob_addr(), &"bob@example.net/other".parse().unwrap()));
        assert!(!sent_by(&bare, &alice_addr()));
    }

    #[tokio::test]
    async fn test_duplicate_inbound_sid_is_refused() {
        let ep = endpoints(IbbConfig::default());
        let _listener = ep.bob.listen(&bob_addr());
        let open = Open {
            sid: SessionId::new("dup").unwrap(),
            block_size: 4096,
            stanza: Carrier::Iq,
        };

        assert!(ep.bob.handle_open(&alice_addr(), &bob_addr(), open.clone()).await.is_ok());
        let err = ep
            .bob
            .handle_open(&alice_addr(), &bob_addr(), open)
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::NotAcceptable);
        assert_eq!(ep.bob.stats().streams, 1);
    }

    #[tokio::test]
    async fn test_close_unknown_session_leaves_others_alone() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        let close = IbbPayload::Close(Close {
            sid: SessionId::new("nope").unwrap(),
        });
        let err = ep
            .alice_transport
            .send_iq(&bob_addr(), &close)
            .await
            .unwrap_err();
        assert_eq!(err.condition(), Some(Condition::ItemNotFound));

        assert_eq!(inbound.state(), StreamState::Open);
        assert_eq!(outbound.state(), StreamState::Open);
        assert_eq!(ep.bob.stats().open, 1);
    }

    #[tokio::test]
    async fn test_data_for_unknown_session_is_item_not_found() {
        let ep = endpoints(IbbConfig::default());
        let sid = SessionId::new("ghost").unwrap();
        let err = ep
            .bob_transport
            .inject(StanzaKind::Iq, alice_addr(), data_xml(&sid, 0, "AA=="))
            .await
            .unwrap_err();
        assert_eq!(err, StanzaError::cancel(Condition::ItemNotFound));
    }

    #[tokio::test]
    async fn test_data_from_wrong_sender_is_item_not_found() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let _outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        let mallory: Jid = "mallory@example.org/m".parse().unwrap();
        let err = ep
            .bob_transport
            .inject(StanzaKind::Iq, mallory, data_xml(inbound.sid(), 0, "AA=="))
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::ItemNotFound);
        assert_eq!(inbound.state(), StreamState::Open);
    }

    #[tokio::test]
    async fn test_sequence_violation_closes_stream() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let _outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        let err = ep
            .bob_transport
            .inject(StanzaKind::Iq, alice_addr(), data_xml(inbound.sid(), 1, "AA=="))
            .await
            .unwrap_err();
        assert_eq!(err, StanzaError::cancel(Condition::UnexpectedRequest));

        assert!(inbound.is_closed());
        assert!(ep.bob.stream(inbound.sid()).is_none());
        let mut buf = [0u8; 8];
        let read_err = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(read_err, IbbError::SequenceViolation { expected: 0, got: 1 });
        assert_eq!(read_err.condition(), Some(Condition::UnexpectedRequest));
    }

    #[tokio::test]
    async fn test_malformed_data_is_bad_request_and_closes() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let _outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        let err = ep
            .bob_transport
            .inject(StanzaKind::Iq, alice_addr(), data_xml(inbound.sid(), 0, "@@@"))
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::BadRequest);
        assert!(inbound.is_closed());
        assert!(matches!(
            inbound.write(b"x").await,
            Err(IbbError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_close_ends_reader() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        let reader = {
            let inbound = inbound.clone();
            tokio::spawn(async move { inbound.read_to_end(1024).await })
        };
        outbound.write(b"bye").await.unwrap();
        outbound.close().await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), b"bye");
        assert!(outbound.is_closed());
        assert!(inbound.is_closed());
        assert_eq!(ep.alice.stats().streams, 0);
        assert_eq!(ep.bob.stats().streams, 0);
        assert_eq!(outbound.write(b"more").await.unwrap_err(), IbbError::Closed);
        outbound.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_timeout_leaves_nothing_registered() {
        let ep = endpoints(IbbConfig::default().with_accept_backlog(1));
        let listener = ep.bob.listen(&bob_addr());

        // Fill the backlog so the next inbound open waits for room.
        ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let err = ep
            .alice
            .open_with_timeout(Duration::from_millis(50), &bob_addr(), Carrier::Iq, 0)
            .await
            .unwrap_err();
        assert_eq!(err, IbbError::Timeout);

        assert_eq!(ep.alice.stats().streams, 1);
        assert_eq!(ep.bob.stats().streams, 1);
        assert_eq!(listener.pending(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_during_open() {
        let ep = endpoints(IbbConfig::default());
        let _listener = ep.bob.listen(&bob_addr());
        ep.alice_transport.set_offline(true);

        let err = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap_err();
        assert!(matches!(err, IbbError::Transport(_)));
        assert_eq!(ep.alice.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_stats_count_bytes() {
        let ep = endpoints(IbbConfig::default());
        let listener = ep.bob.listen(&bob_addr());
        let outbound = ep.alice.open(&bob_addr(), Carrier::Iq, 0).await.unwrap();
        let inbound = listener.accept().await.unwrap();

        outbound.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();

        assert_eq!(ep.alice.stats().bytes_sent, 5);
        assert_eq!(ep.bob.stats().bytes_received, 5);
        assert_eq!(ep.bob.stats().open, 1);
    }
}
