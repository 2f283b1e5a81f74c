//! In-process transport joining two endpoints
//!
//! Every payload is rendered to XML on send and parsed again by the
//! receiving router, so traffic exercises the same codec a real session
//! would. Delivery happens inline in the sender's task, which keeps the
//! frames of one sender in order.

use super::{InboundStanza, Router, StanzaKind, StanzaTransport};
use crate::protocol::IbbPayload;
use async_trait::async_trait;
use ibb_common::{IbbError, Jid, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tracing::debug;

/// A stanza as it left an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentStanza {
    pub kind: StanzaKind,
    pub to: Jid,
    pub xml: String,
}

/// One end of an in-memory stanza session
pub struct MemoryTransport {
    addr: Jid,
    router: Arc<Router>,
    peer: OnceLock<Weak<MemoryTransport>>,
    sent: Mutex<Vec<SentStanza>>,
    offline: AtomicBool,
}

impl MemoryTransport {
    /// Create two connected endpoints
    pub fn pair(a: Jid, b: Jid) -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self::new(a));
        let right = Arc::new(Self::new(b));
        let _ = left.peer.set(Arc::downgrade(&right));
        let _ = right.peer.set(Arc::downgrade(&left));
        (left, right)
    }

    fn new(addr: Jid) -> Self {
        Self {
            addr,
            router: Arc::new(Router::new()),
            peer: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Router receiving this endpoint's inbound stanzas
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Everything this endpoint has sent so far
    pub fn sent(&self) -> Vec<SentStanza> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// While offline every send fails with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Deliver a raw payload to this endpoint as if it came off the wire
    pub async fn inject(
        &self,
        kind: StanzaKind,
        from: Jid,
        xml: String,
    ) -> std::result::Result<(), ibb_common::StanzaError> {
        self.router
            .dispatch(InboundStanza {
                kind,
                from,
                to: self.addr.clone(),
                payload: xml,
                error: None,
            })
            .await
    }

    fn prepare(&self, kind: StanzaKind, to: &Jid, payload: &IbbPayload) -> Result<(Arc<Self>, String)> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IbbError::transport("endpoint is offline"));
        }
        let peer = self
            .peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| IbbError::transport("peer endpoint is gone"))?;
        let xml = payload.to_xml()?;

        debug!("{} -> {} {:?}: {}", self.addr, to, kind, xml);
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentStanza {
                kind,
                to: to.clone(),
                xml: xml.clone(),
            });

        Ok((peer, xml))
    }
}

#[async_trait]
impl StanzaTransport for MemoryTransport {
    fn local_addr(&self) -> Jid {
        self.addr.clone()
    }

    async fn send_message(&self, to: &Jid, payload: &IbbPayload) -> Result<()> {
        let (peer, xml) = self.prepare(StanzaKind::Message, to, payload)?;

        let delivered = peer
            .router
            .dispatch(InboundStanza {
                kind: StanzaKind::Message,
                from: self.addr.clone(),
                to: to.clone(),
                payload: xml.clone(),
                error: None,
            })
            .await;

        // Messages get no reply; a failure comes back as an error message.
        if let Err(error) = delivered {
            debug!("{} bounced message to {}: {}", to, self.addr, error);
            let _ = self
                .router
                .dispatch(InboundStanza {
                    kind: StanzaKind::Message,
                    from: to.clone(),
                    to: self.addr.clone(),
                    payload: xml,
                    error: Some(error),
                })
                .await;
        }
        Ok(())
    }

    async fn send_iq(&self, to: &Jid, payload: &IbbPayload) -> Result<()> {
        let (peer, xml) = self.prepare(StanzaKind::Iq, to, payload)?;

        peer.router
            .dispatch(InboundStanza {
                kind: StanzaKind::Iq,
                from: self.addr.clone(),
                to: to.clone(),
                payload: xml,
                error: None,
            })
            .await
            .map_err(IbbError::Remote)
    }
}
