//! Addressable stream trait and type-erased wrapper.
//!
//! The [`AddressedStream`] trait is what the multiplexer runs on: an
//! ordered, bidirectional carrier of [`Message`]s that knows the
//! [`Multiaddr`] of each end. Backends live in their own modules under
//! `stream/`.
//!
//! Use [`AnyStream`] when the concrete backend should not leak into types
//! (the multiplexer and [`Connection`](crate::Connection) do).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{Message, Multiaddr, TransportError};

/// An established, addressable message stream.
///
/// Implementations must tolerate one concurrent reader and any number of
/// concurrent writers. Only the owning connection closes a stream.
pub trait AddressedStream: Send + Sync + 'static {
    /// Send one message. Awaits if the peer applies backpressure.
    fn send_msg(
        &self,
        msg: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Receive the next message.
    ///
    /// Returns `TransportError::Closed` once the stream has been closed
    /// locally or the peer has ended it.
    fn recv_msg(&self) -> impl Future<Output = Result<Message, TransportError>> + Send + '_;

    /// Close the stream.
    ///
    /// Non-blocking. A pending `recv_msg` on this end returns
    /// `TransportError::Closed`, and the peer observes end-of-stream after
    /// any messages already sent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Address of this end, as currently known by the stream.
    fn local_addr(&self) -> Multiaddr;

    /// Address of the other end, as currently known by the stream.
    fn remote_addr(&self) -> Multiaddr;
}

/// Object-safe version of [`AddressedStream`] for dynamic dispatch.
pub trait DynStream: Send + Sync + 'static {
    fn send_msg_dyn(
        &self,
        msg: Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn recv_msg_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Message, TransportError>> + Send + '_>>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> Multiaddr;

    fn remote_addr(&self) -> Multiaddr;
}

impl<S: AddressedStream> DynStream for S {
    fn send_msg_dyn(
        &self,
        msg: Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send_msg(msg))
    }

    fn recv_msg_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Message, TransportError>> + Send + '_>> {
        Box::pin(self.recv_msg())
    }

    fn close(&self) {
        AddressedStream::close(self)
    }

    fn is_closed(&self) -> bool {
        AddressedStream::is_closed(self)
    }

    fn local_addr(&self) -> Multiaddr {
        AddressedStream::local_addr(self)
    }

    fn remote_addr(&self) -> Multiaddr {
        AddressedStream::remote_addr(self)
    }
}

/// Type-erased, cheaply cloneable stream handle.
#[derive(Clone)]
pub struct AnyStream {
    inner: Arc<dyn DynStream>,
}

impl std::fmt::Debug for AnyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyStream")
            .field("local", &self.inner.local_addr())
            .field("remote", &self.inner.remote_addr())
            .field("is_closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl AnyStream {
    pub fn new<S: AddressedStream>(stream: S) -> Self {
        Self {
            inner: Arc::new(stream),
        }
    }

    pub async fn send_msg(&self, msg: Message) -> Result<(), TransportError> {
        self.inner.send_msg_dyn(msg).await
    }

    pub async fn recv_msg(&self) -> Result<Message, TransportError> {
        self.inner.recv_msg_dyn().await
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn local_addr(&self) -> Multiaddr {
        self.inner.local_addr()
    }

    pub fn remote_addr(&self) -> Multiaddr {
        self.inner.remote_addr()
    }

    /// A connected pair of in-memory streams.
    #[cfg(feature = "mem")]
    pub fn mem_pair(a: Multiaddr, b: Multiaddr) -> (Self, Self) {
        let (a, b) = mem::MemStream::pair(a, b);
        (Self::new(a), Self::new(b))
    }

    /// Wrap any byte stream (TCP socket, Unix socket, relayed stream, ...).
    ///
    /// Frames larger than `config.max_frame_len` are refused in both
    /// directions.
    #[cfg(feature = "stream")]
    pub fn io<T>(inner: T, local: Multiaddr, remote: Multiaddr, config: &crate::MuxConfig) -> Self
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::new(io::IoStream::with_max_frame_len(
            inner,
            local,
            remote,
            config.max_frame_len,
        ))
    }

    /// A connected pair of framed streams over an in-memory byte pipe.
    #[cfg(feature = "stream")]
    pub fn io_pair() -> (Self, Self) {
        let (a, b) = io::IoStream::pair();
        (Self::new(a), Self::new(b))
    }
}

impl AddressedStream for AnyStream {
    fn send_msg(
        &self,
        msg: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        self.inner.send_msg_dyn(msg)
    }

    fn recv_msg(&self) -> impl Future<Output = Result<Message, TransportError>> + Send + '_ {
        self.inner.recv_msg_dyn()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn local_addr(&self) -> Multiaddr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.inner.remote_addr()
    }
}

#[cfg(feature = "stream")]
pub mod io;
#[cfg(feature = "mem")]
pub mod mem;
