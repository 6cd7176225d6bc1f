use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::{Message, Multiaddr, TransportError};

use super::AddressedStream;

const CHANNEL_CAPACITY: usize = 64;

/// In-process stream. Messages are handed over as values, never encoded.
///
/// Addresses are late-bound: [`rebind_local`](Self::rebind_local) and
/// [`rebind_remote`](Self::rebind_remote) change what the stream reports,
/// the way a migrating or relayed connection would.
#[derive(Clone)]
pub struct MemStream {
    inner: Arc<MemInner>,
}

impl std::fmt::Debug for MemStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStream")
            .field("local", &*self.inner.local.read())
            .field("remote", &*self.inner.remote.read())
            .finish_non_exhaustive()
    }
}

struct MemInner {
    /// Sender to the peer's receiver; taken on close so the peer sees EOF.
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    /// Only ever locked inside a single poll, never across an await.
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: watch::Sender<bool>,
    local: RwLock<Multiaddr>,
    remote: RwLock<Multiaddr>,
}

impl MemStream {
    /// Create a connected pair. The first stream is bound to `a` and talks
    /// to `b`; the second is the mirror image.
    pub fn pair(a: Multiaddr, b: Multiaddr) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            closed: watch::Sender::new(false),
            local: RwLock::new(a.clone()),
            remote: RwLock::new(b.clone()),
        });

        let inner_b = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            closed: watch::Sender::new(false),
            local: RwLock::new(b),
            remote: RwLock::new(a),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    pub fn rebind_local(&self, addr: Multiaddr) {
        *self.inner.local.write() = addr;
    }

    pub fn rebind_remote(&self, addr: Multiaddr) {
        *self.inner.remote.write() = addr;
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl AddressedStream for MemStream {
    async fn send_msg(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let tx = self.inner.tx.lock().clone().ok_or(TransportError::Closed)?;

        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            sent = tx.send(msg) => sent.map_err(|_| TransportError::Closed),
        }
    }

    async fn recv_msg(&self) -> Result<Message, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.inner.closed.subscribe();
        let next = std::future::poll_fn(|cx| self.inner.rx.lock().poll_recv(cx));
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            msg = next => msg.ok_or(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        tracing::debug!(local = %self.inner.local.read(), "mem stream closed");
        self.inner.tx.lock().take();
        // Fails the peer's pending and future sends.
        self.inner.rx.lock().close();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }

    fn local_addr(&self) -> Multiaddr {
        self.inner.local.read().clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.inner.remote.read().clone()
    }
}
