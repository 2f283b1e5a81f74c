//! Acceptor for inbound bytestreams
//!
//! A listener is bound to a bare address. Streams negotiated by peers for
//! that address wait in its queue until the application accepts them.

use crate::stream::IbbStream;
use ibb_common::{IbbError, Jid, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

struct QueueState {
    pending: VecDeque<IbbStream>,
    closed: bool,
}

/// Queue of negotiated streams with a terminal closed state
struct AcceptQueue {
    state: Mutex<QueueState>,
    /// None means unbounded
    capacity: Option<usize>,
    /// Signalled on push and on close
    ready: Notify,
    /// Signalled on pop and on close
    space: Notify,
}

impl AcceptQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            capacity: (capacity > 0).then_some(capacity),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a stream, waiting for room when bounded. Hands the stream back
    /// if the queue is closed.
    async fn push(&self, stream: IbbStream) -> std::result::Result<(), IbbStream> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(stream);
                }
                if self.capacity.map_or(true, |cap| state.pending.len() < cap) {
                    state.pending.push_back(stream);
                    drop(state);
                    self.ready.notify_one();
                    return Ok(());
                }
            }

            space.await;
        }
    }

    async fn pop(&self) -> Result<IbbStream> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(stream) = state.pending.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Ok(stream);
                }
                if state.closed {
                    return Err(IbbError::ListenerClosed);
                }
            }

            ready.await;
        }
    }

    /// Close the queue, returning what was still waiting.
    /// None if it was already closed.
    fn close(&self) -> Option<Vec<IbbStream>> {
        let drained = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.closed = true;
            state.pending.drain(..).collect()
        };
        self.ready.notify_waiters();
        self.space.notify_waiters();
        Some(drained)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().pending.len()
    }
}

struct ListenerInner {
    addr: Jid,
    queue: AcceptQueue,
}

/// Accepts inbound streams for one bare address
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub(crate) fn new(addr: Jid, backlog: usize) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                addr: addr.bare(),
                queue: AcceptQueue::new(backlog),
            }),
        }
    }

    /// The bare address this listener is bound to
    pub fn addr(&self) -> &Jid {
        &self.inner.addr
    }

    /// Wait for the next negotiated stream
    pub async fn accept(&self) -> Result<IbbStream> {
        let stream = self.inner.queue.pop().await?;
        debug!("Accepted IBB stream {} from {}", stream.sid(), stream.peer());
        Ok(stream)
    }

    /// Stop accepting. Pending and future accept calls fail with
    /// `ListenerClosed`, streams still queued are closed. Idempotent.
    pub fn close(&self) {
        let Some(drained) = self.inner.queue.close() else {
            return;
        };
        info!(
            "IBB listener for {} closed ({} streams never accepted)",
            self.inner.addr,
            drained.len()
        );
        for stream in drained {
            stream.abort(Some(IbbError::ListenerClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Streams negotiated but not yet accepted
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub(crate) async fn enqueue(&self, stream: IbbStream) -> std::result::Result<(), IbbStream> {
        self.inner.queue.push(stream).await
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamParams, StreamShared, StreamState};
    use crate::transport::MemoryTransport;
    use ibb_common::{Carrier, SessionId};
    use std::sync::Weak;
    use std::time::Duration;

    fn stream(sid: &str) -> IbbStream {
        let (alice, _bob) = MemoryTransport::pair(
            "alice@example.net/a".parse().unwrap(),
            "bob@example.net/b".parse().unwrap(),
        );
        let shared = StreamShared::new(
            StreamParams {
                sid: SessionId::new(sid).unwrap(),
                local: "alice@example.net/a".parse().unwrap(),
                peer: "bob@example.net/b".parse().unwrap(),
                carrier: Carrier::Iq,
                block_size: 4096,
            },
            StreamState::Open,
            4,
            alice,
            Weak::new(),
        );
        IbbStream::from_shared(shared)
    }

    fn listener(backlog: usize) -> Listener {
        Listener::new("bob@example.net/b".parse().unwrap(), backlog)
    }

    #[test]
    fn test_listener_binds_bare_address() {
        let listener = listener(0);
        assert_eq!(listener.addr().to_string(), "bob@example.net");
    }

    #[tokio::test]
    async fn test_accept_returns_in_queue_order() {
        let listener = listener(0);
        listener.enqueue(stream("one")).await.unwrap();
        listener.enqueue(stream("two")).await.unwrap();
        assert_eq!(listener.pending(), 2);

        assert_eq!(listener.accept().await.unwrap().sid().as_str(), "one");
        assert_eq!(listener.accept().await.unwrap().sid().as_str(), "two");
        assert_eq!(listener.pending(), 0);
    }

    #[tokio::test]
    async fn test_accept_waits_for_enqueue() {
        let listener = listener(0);
        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.enqueue(stream("late")).await.unwrap();

        let accepted = acceptor.await.unwrap().unwrap();
        assert_eq!(accepted.sid().as_str(), "late");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accepts() {
        let listener = listener(0);
        let acceptors: Vec<_> = (0..3)
            .map(|_| {
                let listener = listener.clone();
                tokio::spawn(async move { listener.accept().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();
        listener.close();

        for acceptor in acceptors {
            let err = acceptor.await.unwrap().unwrap_err();
            assert_eq!(err, IbbError::ListenerClosed);
        }
        assert!(listener.is_closed());
        assert_eq!(listener.accept().await.unwrap_err(), IbbError::ListenerClosed);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_refused() {
        let listener = listener(0);
        listener.close();
        assert!(listener.enqueue(stream("refused")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_queued_streams() {
        let listener = listener(0);
        let queued = stream("queued");
        listener.enqueue(queued.clone()).await.unwrap();

        listener.close();
        assert!(queued.is_closed());
        assert_eq!(listener.pending(), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_waits_for_room() {
        let listener = listener(1);
        listener.enqueue(stream("first")).await.unwrap();

        let blocked = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.enqueue(stream("second")).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(listener.accept().await.unwrap().sid().as_str(), "first");
        assert!(blocked.await.unwrap());
        assert_eq!(listener.accept().await.unwrap().sid().as_str(), "second");
    }
}
