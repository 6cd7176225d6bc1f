//! Channel handles.
//!
//! A [`Channel`] is one multiplexed sub-connection. Its out-of-band
//! requests arrive on the `Requests` stream returned next to it, which must
//! be drained for as long as the channel lives.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::connection::Requests;
use crate::mux::Mux;
use crate::{ConnectionError, RejectionReason};

/// An open channel.
///
/// - [`read`](Self::read) yields the peer's data until it sends EOF or
///   closes the channel.
/// - [`write`](Self::write) sends data until [`close_write`](Self::close_write)
///   or [`close`](Self::close).
/// - Dropping a channel that was not closed sends a close in the
///   background.
pub struct Channel {
    mux: Arc<Mux>,
    local_id: u32,
    remote_id: u32,
    channel_type: String,
    data_rx: mpsc::Receiver<Bytes>,
    /// Orders reply waiters the same way requests go out on the wire.
    request_lock: AsyncMutex<()>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        mux: Arc<Mux>,
        local_id: u32,
        remote_id: u32,
        channel_type: String,
        data_rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            mux,
            local_id,
            remote_id,
            channel_type,
            data_rx,
            request_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Send a channel request.
    ///
    /// With `want_reply` this waits for the peer's answer and returns it.
    /// Replies come back in the order requests were sent. Without it,
    /// returns `false` as soon as the request is sent.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<bool, ConnectionError> {
        let reply = {
            let _ordered = self.request_lock.lock().await;
            self.mux
                .send_channel_request(self.local_id, name, want_reply, payload)
                .await?
        };

        match reply {
            Some(rx) => rx.await.map_err(|_| self.mux.channel_error(self.local_id)),
            None => Ok(false),
        }
    }

    /// Send data to the peer.
    pub async fn write(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.mux.channel_data(self.local_id, data).await
    }

    /// Next chunk of data from the peer; `None` once the peer sent EOF,
    /// closed the channel, or the connection went down.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Tell the peer we will send no more data. Reading continues.
    pub async fn close_write(&self) -> Result<(), ConnectionError> {
        self.mux.channel_eof(self.local_id).await
    }

    /// Close the channel. Idempotent.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::Release);
        self.mux.channel_close(self.local_id).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("channel_type", &self.channel_type)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let closed = self.closed.load(Ordering::Acquire);
        tracing::debug!(channel_id = self.local_id, closed, "channel dropped");
        if closed {
            return;
        }

        // Best-effort close so the peer is not left holding a dead channel.
        let mux = self.mux.clone();
        let local_id = self.local_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = mux.channel_close(local_id).await;
            });
        }
    }
}

/// A channel the peer wants to open. Answer with [`accept`](Self::accept)
/// or [`reject`](Self::reject); dropping it rejects with
/// `resource shortage`.
pub struct NewChannel {
    mux: Arc<Mux>,
    channel_type: String,
    remote_id: u32,
    extra: Bytes,
    answered: bool,
}

impl NewChannel {
    pub(crate) fn new(mux: Arc<Mux>, channel_type: String, remote_id: u32, extra: Bytes) -> Self {
        Self {
            mux,
            channel_type,
            remote_id,
            extra,
            answered: false,
        }
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Type-specific data sent with the open.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra
    }

    pub async fn accept(mut self) -> Result<(Channel, Requests), ConnectionError> {
        self.answered = true;
        self.mux
            .accept_channel(&self.channel_type, self.remote_id)
            .await
    }

    pub async fn reject(
        mut self,
        reason: RejectionReason,
        message: &str,
    ) -> Result<(), ConnectionError> {
        self.answered = true;
        self.mux
            .reject_channel(self.remote_id, reason, message)
            .await
    }

    /// Mark as answered without sending anything; returns the peer's id.
    pub(crate) fn defuse(mut self) -> u32 {
        self.answered = true;
        self.remote_id
    }
}

impl fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewChannel")
            .field("channel_type", &self.channel_type)
            .field("remote_id", &self.remote_id)
            .field("extra_len", &self.extra.len())
            .finish()
    }
}

impl Drop for NewChannel {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        tracing::debug!(
            remote_id = self.remote_id,
            channel_type = %self.channel_type,
            "channel open dropped unanswered; rejecting"
        );
        let mux = self.mux.clone();
        let remote_id = self.remote_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = mux
                    .reject_channel(remote_id, RejectionReason::ResourceShortage, "not accepted")
                    .await;
            });
        }
    }
}
