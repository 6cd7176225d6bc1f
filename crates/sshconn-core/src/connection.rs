//! The connection: the operation surface over a running multiplexer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::{Channel, NewChannel};
use crate::metadata::{ConnMetadata, ConnectionMetadata, SessionIdentity};
use crate::mux::Mux;
use crate::stream::AnyStream;
use crate::{ConnectionError, Multiaddr, MuxConfig, Request};

/// Out-of-band requests for the connection or for one channel.
///
/// Must be drained for as long as its source is alive: a full buffer stops
/// the demux loop and stalls every channel on the connection. Hand it to
/// [`discard_requests`] when nothing needs answering.
pub type Requests = mpsc::Receiver<Request>;

/// Channel opens initiated by the peer.
pub type NewChannels = mpsc::Receiver<NewChannel>;

/// Lifecycle of a connection, after the handshake.
///
/// `cause` is `None` when the connection was closed locally.
#[derive(Debug, Clone)]
pub enum Phase {
    Open,
    /// Shutdown started; suspended operations are being failed.
    Closing { cause: Option<ConnectionError> },
    /// Everything has been torn down. Terminal.
    Closed { cause: Option<ConnectionError> },
}

impl Phase {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Operations on an established connection.
pub trait Conn: ConnectionMetadata {
    /// Send a connection-global request.
    ///
    /// Without `want_reply` this returns `(false, empty)` once the request is
    /// sent. With it, waits for the peer and returns whether it accepted,
    /// plus any reply payload. Replies come back in the order requests were
    /// sent.
    fn send_request<'a>(
        &'a self,
        name: &'a str,
        want_reply: bool,
        payload: Bytes,
    ) -> impl Future<Output = Result<(bool, Bytes), ConnectionError>> + Send + 'a;

    /// Open a channel and wait for the peer to accept or refuse it.
    ///
    /// A refusal is `ConnectionError::Rejected`; the connection stays up.
    /// The returned `Requests` must be drained for the life of the channel.
    fn open_channel<'a>(
        &'a self,
        channel_type: &'a str,
        extra: Bytes,
    ) -> impl Future<Output = Result<(Channel, Requests), ConnectionError>> + Send + 'a;

    /// Close the connection, failing every suspended operation.
    ///
    /// Never blocks. The first call returns `Ok(())`; later calls, or a
    /// call after the connection already went down, return
    /// `ConnectionError::Closed`.
    fn close(&self) -> Result<(), ConnectionError>;

    /// Wait until the connection is fully torn down.
    ///
    /// Returns `Ok(())` after a local close, otherwise the error that ended
    /// the connection. Every caller gets the same value.
    fn wait(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send + '_;
}

/// A connection over an addressable stream.
///
/// Dropping it closes the connection.
pub struct Connection {
    mux: Arc<Mux>,
    metadata: ConnMetadata,
}

impl Connection {
    /// Wrap an established stream and start the demux loop on the current
    /// Tokio runtime.
    ///
    /// Both returned streams must be serviced: accept or reject each
    /// [`NewChannel`], and answer or [`discard_requests`] the global
    /// requests.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        identity: SessionIdentity,
        stream: AnyStream,
        config: MuxConfig,
    ) -> (Self, NewChannels, Requests) {
        tracing::debug!(
            user = identity.user(),
            local = %stream.local_addr(),
            remote = %stream.remote_addr(),
            "connection established"
        );
        let metadata = ConnMetadata::new(identity, stream.clone());
        let (mux, new_channels, requests) = Mux::start(stream, config);
        (Self { mux, metadata }, new_channels, requests)
    }

    /// A handle that can read identity and addresses and do nothing else.
    pub fn metadata(&self) -> ConnMetadata {
        self.metadata.clone()
    }

    pub fn phase(&self) -> Phase {
        self.mux.phase()
    }

    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(bool, Bytes), ConnectionError> {
        self.mux.global_request(name, want_reply, payload).await
    }

    pub async fn open_channel(
        &self,
        channel_type: &str,
        extra: Bytes,
    ) -> Result<(Channel, Requests), ConnectionError> {
        self.mux.open_channel(channel_type, extra).await
    }

    pub fn close(&self) -> Result<(), ConnectionError> {
        if self.mux.begin_shutdown(None) {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    pub async fn wait(&self) -> Result<(), ConnectionError> {
        let mut phase = self.mux.subscribe();
        let cause = match phase.wait_for(Phase::is_closed).await {
            Ok(phase) => match &*phase {
                Phase::Closed { cause } => cause.clone(),
                _ => None,
            },
            // The mux owns the sender, so this cannot happen while we hold it.
            Err(_) => Some(self.mux.terminal_error()),
        };
        match cause {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("metadata", &self.metadata)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.mux.begin_shutdown(None);
    }
}

impl ConnectionMetadata for Connection {
    fn user(&self) -> &str {
        self.metadata.user()
    }

    fn session_id(&self) -> Vec<u8> {
        self.metadata.session_id()
    }

    fn client_version(&self) -> Vec<u8> {
        self.metadata.client_version()
    }

    fn server_version(&self) -> Vec<u8> {
        self.metadata.server_version()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.metadata.remote_addr()
    }

    fn local_addr(&self) -> Multiaddr {
        self.metadata.local_addr()
    }
}

impl Conn for Connection {
    fn send_request<'a>(
        &'a self,
        name: &'a str,
        want_reply: bool,
        payload: Bytes,
    ) -> impl Future<Output = Result<(bool, Bytes), ConnectionError>> + Send + 'a {
        Connection::send_request(self, name, want_reply, payload)
    }

    fn open_channel<'a>(
        &'a self,
        channel_type: &'a str,
        extra: Bytes,
    ) -> impl Future<Output = Result<(Channel, Requests), ConnectionError>> + Send + 'a {
        Connection::open_channel(self, channel_type, extra)
    }

    fn close(&self) -> Result<(), ConnectionError> {
        Connection::close(self)
    }

    fn wait(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send + '_ {
        Connection::wait(self)
    }
}

/// Refuse every request on `requests` until the stream ends.
///
/// Requests that want a reply get `false` with no payload, each answered
/// before the next one is taken. Returns once the source has closed, which
/// happens when its channel or connection goes away.
pub async fn discard_requests(mut requests: Requests) {
    while let Some(request) = requests.recv().await {
        tracing::trace!(name = %request.name, want_reply = request.want_reply, "discarding request");
        if request.want_reply {
            // Failure here means the connection is going down and the
            // stream will end shortly.
            let _ = request.reply(false, Bytes::new()).await;
        }
    }
}
