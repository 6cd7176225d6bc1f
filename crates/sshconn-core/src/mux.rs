//! The multiplexer: one stream, many channels, one demux loop.
//!
//! # Key invariant
//!
//! Only [`Mux::run`] calls `recv_msg` on the stream. Everything else sends
//! and then waits on a oneshot or mpsc receiver that the demux loop feeds.
//!
//! ```text
//!                      stream.recv_msg()
//!                             │
//!                        demux loop
//!        ┌──────────────┬─────┴───────┬────────────────┐
//!   global request   global reply   channel open   channel-scoped
//!        │              │             │                │
//!   Requests mpsc   FIFO waiter   NewChannels mpsc  entry by local id
//!                                  or open waiter   (data, requests,
//!                                                    reply waiters)
//! ```
//!
//! Delivery into an mpsc waits for buffer space. A consumer that stops
//! draining its `Requests` stops the loop, and with it every channel on the
//! connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};

use crate::channel::{Channel, NewChannel};
use crate::request::{ReplyTarget, Request};
use crate::stream::AnyStream;
use crate::{
    ConnectionError, Message, MuxConfig, OpenChannelError, Phase, RejectionReason, TransportError,
};

type OpenWaiter = oneshot::Sender<Result<u32, OpenChannelError>>;

pub(crate) struct Mux {
    stream: AnyStream,
    config: MuxConfig,
    phase: watch::Sender<Phase>,
    state: Mutex<MuxState>,
    /// Held while queueing a global reply waiter and sending its request,
    /// so waiters are queued in wire order.
    global_send: AsyncMutex<()>,
    /// Held while releasing queued answers to inbound requests.
    reply_send: AsyncMutex<()>,
}

#[derive(Default)]
struct MuxState {
    channels: HashMap<u32, ChannelEntry>,
    next_local_id: u32,
    global_replies: VecDeque<oneshot::Sender<(bool, Bytes)>>,
    global_answers: ReplyQueue,
    global_requests: Option<mpsc::Sender<Request>>,
    new_channels: Option<mpsc::Sender<NewChannel>>,
}

impl MuxState {
    /// Next free local channel id. Ids wrap, skipping those still in use.
    fn allocate_local_id(&mut self) -> u32 {
        loop {
            let id = self.next_local_id;
            self.next_local_id = id.wrapping_add(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// The answer queue for `target`, with the peer's channel id for
    /// channel targets.
    fn answers(
        &mut self,
        target: ReplyTarget,
    ) -> Result<(&mut ReplyQueue, Option<u32>), ConnectionError> {
        match target {
            ReplyTarget::Global => Ok((&mut self.global_answers, None)),
            ReplyTarget::Channel { local_id } => {
                let closed = ConnectionError::ChannelClosed { channel: local_id };
                let Some(entry) = self.channels.get_mut(&local_id) else {
                    return Err(closed);
                };
                match entry.remote_id {
                    Some(remote_id) if !entry.sent_close => {
                        Ok((&mut entry.answers, Some(remote_id)))
                    }
                    _ => Err(closed),
                }
            }
        }
    }
}

/// Answers to inbound requests, released in the order the requests
/// arrived.
///
/// Replies carry no request id on the wire, so an answer waits until every
/// earlier request on the same target has been answered.
#[derive(Default)]
struct ReplyQueue {
    /// Assigned to the next delivered request that wants a reply.
    next_seq: u64,
    /// The request whose answer goes out next.
    next_out: u64,
    ready: BTreeMap<u64, (bool, Bytes)>,
}

impl ReplyQueue {
    fn assign(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn pop_ready(&mut self) -> Option<(bool, Bytes)> {
        let answer = self.ready.remove(&self.next_out)?;
        self.next_out += 1;
        Some(answer)
    }
}

struct ChannelEntry {
    /// `None` until the peer confirms an open we initiated.
    remote_id: Option<u32>,
    pending_open: Option<OpenWaiter>,
    data_tx: Option<mpsc::Sender<Bytes>>,
    requests_tx: Option<mpsc::Sender<Request>>,
    reply_waiters: VecDeque<oneshot::Sender<bool>>,
    answers: ReplyQueue,
    sent_eof: bool,
    sent_close: bool,
}

impl ChannelEntry {
    fn new(
        remote_id: Option<u32>,
        pending_open: Option<OpenWaiter>,
        data_tx: mpsc::Sender<Bytes>,
        requests_tx: mpsc::Sender<Request>,
    ) -> Self {
        Self {
            remote_id,
            pending_open,
            data_tx: Some(data_tx),
            requests_tx: Some(requests_tx),
            reply_waiters: VecDeque::new(),
            answers: ReplyQueue::default(),
            sent_eof: false,
            sent_close: false,
        }
    }
}

fn reply_message(remote_id: Option<u32>, ok: bool, payload: Bytes) -> Message {
    match (remote_id, ok) {
        (None, true) => Message::RequestSuccess { payload },
        (None, false) => Message::RequestFailure,
        (Some(recipient_channel), true) => Message::ChannelSuccess { recipient_channel },
        (Some(recipient_channel), false) => Message::ChannelFailure { recipient_channel },
    }
}

fn unknown_channel(local_id: u32) -> ConnectionError {
    ConnectionError::Protocol(format!("message for unknown channel {local_id}"))
}

/// Waits until the phase leaves `Open`.
async fn closing(phase: &mut watch::Receiver<Phase>) {
    let _ = phase.wait_for(|p| !p.is_open()).await;
}

/// Pops a reply waiter queued by a request that never made it onto the
/// wire. The queue lock that ordered the push is still held when this
/// runs, so the waiter is the last one.
struct WaiterGuard<'a> {
    mux: &'a Mux,
    channel: Option<u32>,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.mux.state.lock();
        match self.channel {
            None => {
                state.global_replies.pop_back();
            }
            Some(local_id) => {
                if let Some(entry) = state.channels.get_mut(&local_id) {
                    entry.reply_waiters.pop_back();
                }
            }
        }
        tracing::debug!(channel_id = ?self.channel, "request not sent: removed reply waiter");
    }
}

/// Drops the entry of an outbound open that was cancelled before the open
/// message was sent.
struct OpenGuard<'a> {
    mux: &'a Mux,
    local_id: u32,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.mux.state.lock().channels.remove(&self.local_id).is_some() {
            tracing::debug!(channel_id = self.local_id, "open not sent: removed channel entry");
        }
    }
}

impl Mux {
    /// Create the multiplexer and spawn its demux loop on the current Tokio
    /// runtime.
    pub(crate) fn start(
        stream: AnyStream,
        config: MuxConfig,
    ) -> (Arc<Self>, mpsc::Receiver<NewChannel>, mpsc::Receiver<Request>) {
        let (global_tx, global_rx) = mpsc::channel(config.request_buffer.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_buffer.max(1));

        let mux = Arc::new(Self {
            stream,
            config,
            phase: watch::Sender::new(Phase::Open),
            state: Mutex::new(MuxState {
                global_requests: Some(global_tx),
                new_channels: Some(incoming_tx),
                ..MuxState::default()
            }),
            global_send: AsyncMutex::new(()),
            reply_send: AsyncMutex::new(()),
        });

        tokio::spawn(mux.clone().run());
        (mux, incoming_rx, global_rx)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn is_open(&self) -> bool {
        self.phase.borrow().is_open()
    }

    /// Moves `Open` to `Closing` and closes the stream.
    ///
    /// Only the first call has any effect, so the first cause wins. `None`
    /// means a local close. Returns whether this call started the shutdown.
    pub(crate) fn begin_shutdown(&self, cause: Option<ConnectionError>) -> bool {
        let description = cause.as_ref().map(ToString::to_string);
        let started = self.phase.send_if_modified(move |phase| {
            if !phase.is_open() {
                return false;
            }
            *phase = Phase::Closing { cause };
            true
        });

        if started {
            match description {
                None => tracing::debug!("mux: closing on local request"),
                Some(cause) => tracing::debug!(%cause, "mux: closing"),
            }
            // Wakes every send or receive parked on the stream.
            self.stream.close();
        }
        started
    }

    /// The error handed to operations once the connection is going down.
    pub(crate) fn terminal_error(&self) -> ConnectionError {
        match &*self.phase.borrow() {
            Phase::Closing { cause: Some(e) } | Phase::Closed { cause: Some(e) } => e.clone(),
            _ => ConnectionError::Closed,
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.terminal_error())
        }
    }

    /// Error for an operation on `local_id` whose waiter went away.
    pub(crate) fn channel_error(&self, local_id: u32) -> ConnectionError {
        if self.is_open() {
            ConnectionError::ChannelClosed { channel: local_id }
        } else {
            self.terminal_error()
        }
    }

    /// Send one message. A stream failure shuts the connection down.
    async fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        let number = msg.number();
        match self.stream.send_msg(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let description = e.to_string();
                if self.begin_shutdown(Some(e.into())) {
                    tracing::error!(error = %description, msg = number, "mux: send failed");
                }
                Err(self.terminal_error())
            }
        }
    }

    // ========================================================================
    // Outbound operations
    // ========================================================================

    pub(crate) async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(bool, Bytes), ConnectionError> {
        self.ensure_open()?;
        let payload_len = payload.len();
        let msg = Message::GlobalRequest {
            name: name.to_owned(),
            want_reply,
            payload,
        };

        if !want_reply {
            self.send(msg).await?;
            tracing::debug!(name, payload_len, "global request sent, no reply wanted");
            return Ok((false, Bytes::new()));
        }

        let reply = {
            let _ordered = self.global_send.lock().await;
            let rx = {
                let mut state = self.state.lock();
                self.ensure_open()?;
                let (tx, rx) = oneshot::channel();
                state.global_replies.push_back(tx);
                rx
            };
            let mut guard = WaiterGuard {
                mux: self,
                channel: None,
                armed: true,
            };
            self.send(msg).await?;
            guard.armed = false;
            rx
        };
        tracing::debug!(name, payload_len, "global request sent, awaiting reply");

        reply.await.map_err(|_| self.terminal_error())
    }

    pub(crate) async fn open_channel(
        self: &Arc<Self>,
        channel_type: &str,
        extra: Bytes,
    ) -> Result<(Channel, mpsc::Receiver<Request>), ConnectionError> {
        self.ensure_open()?;
        let (data_tx, data_rx) = mpsc::channel(self.config.data_buffer.max(1));
        let (requests_tx, requests_rx) = mpsc::channel(self.config.request_buffer.max(1));
        let (open_tx, open_rx) = oneshot::channel();

        let local_id = {
            let mut state = self.state.lock();
            self.ensure_open()?;
            let local_id = state.allocate_local_id();
            state.channels.insert(
                local_id,
                ChannelEntry::new(None, Some(open_tx), data_tx, requests_tx),
            );
            local_id
        };

        let mut guard = OpenGuard {
            mux: self,
            local_id,
            armed: true,
        };
        self.send(Message::ChannelOpen {
            channel_type: channel_type.to_owned(),
            sender_channel: local_id,
            initial_window: self.config.window_size,
            max_packet: self.config.max_packet,
            extra,
        })
        .await?;
        guard.armed = false;
        tracing::debug!(channel_id = local_id, channel_type, "channel open sent");

        match open_rx.await {
            Ok(Ok(remote_id)) => {
                tracing::debug!(channel_id = local_id, remote_id, channel_type, "channel open");
                let channel = Channel::new(
                    self.clone(),
                    local_id,
                    remote_id,
                    channel_type.to_owned(),
                    data_rx,
                );
                Ok((channel, requests_rx))
            }
            Ok(Err(rejection)) => {
                tracing::debug!(channel_id = local_id, %rejection, "channel open refused");
                Err(rejection.into())
            }
            Err(_) => Err(self.channel_error(local_id)),
        }
    }

    pub(crate) async fn accept_channel(
        self: &Arc<Self>,
        channel_type: &str,
        remote_id: u32,
    ) -> Result<(Channel, mpsc::Receiver<Request>), ConnectionError> {
        self.ensure_open()?;
        let (data_tx, data_rx) = mpsc::channel(self.config.data_buffer.max(1));
        let (requests_tx, requests_rx) = mpsc::channel(self.config.request_buffer.max(1));

        let local_id = {
            let mut state = self.state.lock();
            self.ensure_open()?;
            let local_id = state.allocate_local_id();
            state.channels.insert(
                local_id,
                ChannelEntry::new(Some(remote_id), None, data_tx, requests_tx),
            );
            local_id
        };

        let confirmed = self
            .send(Message::ChannelOpenConfirmation {
                recipient_channel: remote_id,
                sender_channel: local_id,
                initial_window: self.config.window_size,
                max_packet: self.config.max_packet,
                extra: Bytes::new(),
            })
            .await;
        if let Err(e) = confirmed {
            self.state.lock().channels.remove(&local_id);
            return Err(e);
        }
        tracing::debug!(channel_id = local_id, remote_id, channel_type, "channel accepted");

        let channel = Channel::new(
            self.clone(),
            local_id,
            remote_id,
            channel_type.to_owned(),
            data_rx,
        );
        Ok((channel, requests_rx))
    }

    pub(crate) async fn reject_channel(
        &self,
        remote_id: u32,
        reason: RejectionReason,
        message: &str,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        tracing::debug!(remote_id, %reason, detail = message, "rejecting channel open");
        self.send(Message::ChannelOpenFailure {
            recipient_channel: remote_id,
            reason,
            message: message.to_owned(),
            language: String::new(),
        })
        .await
    }

    /// The peer's id for a channel that can still carry messages.
    fn live_remote_id(&self, state: &MuxState, local_id: u32) -> Result<u32, ConnectionError> {
        self.ensure_open()?;
        state
            .channels
            .get(&local_id)
            .filter(|entry| !entry.sent_close)
            .and_then(|entry| entry.remote_id)
            .ok_or(ConnectionError::ChannelClosed { channel: local_id })
    }

    /// Send a channel request and, if a reply is wanted, return the waiter
    /// for it. Callers serialise per channel so waiters queue in wire order.
    pub(crate) async fn send_channel_request(
        &self,
        local_id: u32,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<Option<oneshot::Receiver<bool>>, ConnectionError> {
        let (remote_id, reply) = {
            let mut state = self.state.lock();
            let remote_id = self.live_remote_id(&state, local_id)?;
            let reply = match state.channels.get_mut(&local_id) {
                Some(entry) if want_reply => {
                    let (tx, rx) = oneshot::channel();
                    entry.reply_waiters.push_back(tx);
                    Some(rx)
                }
                _ => None,
            };
            (remote_id, reply)
        };

        let mut guard = WaiterGuard {
            mux: self,
            channel: Some(local_id),
            armed: reply.is_some(),
        };
        self.send(Message::ChannelRequest {
            recipient_channel: remote_id,
            name: name.to_owned(),
            want_reply,
            payload,
        })
        .await?;
        guard.armed = false;
        tracing::debug!(channel_id = local_id, name, want_reply, "channel request sent");
        Ok(reply)
    }

    pub(crate) async fn channel_data(&self, local_id: u32, data: Bytes) -> Result<(), ConnectionError> {
        let remote_id = {
            let state = self.state.lock();
            let remote_id = self.live_remote_id(&state, local_id)?;
            if state.channels.get(&local_id).is_some_and(|e| e.sent_eof) {
                return Err(ConnectionError::ChannelClosed { channel: local_id });
            }
            remote_id
        };
        tracing::trace!(channel_id = local_id, len = data.len(), "channel data");
        self.send(Message::ChannelData {
            recipient_channel: remote_id,
            data,
        })
        .await
    }

    pub(crate) async fn channel_eof(&self, local_id: u32) -> Result<(), ConnectionError> {
        let remote_id = {
            let mut state = self.state.lock();
            let remote_id = self.live_remote_id(&state, local_id)?;
            match state.channels.get_mut(&local_id) {
                Some(entry) if !entry.sent_eof => entry.sent_eof = true,
                _ => return Ok(()),
            }
            remote_id
        };
        tracing::debug!(channel_id = local_id, "channel eof sent");
        self.send(Message::ChannelEof {
            recipient_channel: remote_id,
        })
        .await
    }

    /// Send our close for `local_id` unless already sent. The entry stays
    /// until the peer's close arrives.
    pub(crate) async fn channel_close(&self, local_id: u32) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Ok(());
        }
        let remote_id = {
            let mut state = self.state.lock();
            let Some(entry) = state.channels.get_mut(&local_id) else {
                return Ok(());
            };
            if entry.sent_close {
                return Ok(());
            }
            entry.sent_close = true;
            match entry.remote_id {
                Some(remote_id) => remote_id,
                None => return Ok(()),
            }
        };
        tracing::debug!(channel_id = local_id, remote_id, "channel close sent");
        self.send(Message::ChannelClose {
            recipient_channel: remote_id,
        })
        .await
    }

    /// Answer inbound request `seq` on `target` and send whatever answers
    /// are now due. An answer waits in the queue while an earlier request
    /// on the same target is still unanswered.
    pub(crate) async fn send_reply(
        &self,
        target: ReplyTarget,
        seq: u64,
        ok: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        self.queue_reply(target, seq, ok, payload)?;
        self.flush_replies(target).await
    }

    /// Record the answer to inbound request `seq`. Never waits.
    pub(crate) fn queue_reply(
        &self,
        target: ReplyTarget,
        seq: u64,
        ok: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        self.ensure_open()?;
        let (answers, _) = state.answers(target)?;
        answers.ready.insert(seq, (ok, payload));
        Ok(())
    }

    /// Send queued answers for `target` in request order, stopping at the
    /// first request still unanswered.
    pub(crate) async fn flush_replies(&self, target: ReplyTarget) -> Result<(), ConnectionError> {
        let _ordered = self.reply_send.lock().await;
        loop {
            let msg = {
                let mut state = self.state.lock();
                self.ensure_open()?;
                let (answers, remote_id) = state.answers(target)?;
                let Some((ok, payload)) = answers.pop_ready() else {
                    return Ok(());
                };
                tracing::debug!(reply_to = ?target, ok, "request reply sent");
                reply_message(remote_id, ok, payload)
            };
            self.send(msg).await?;
        }
    }

    // ========================================================================
    // Demux loop
    // ========================================================================

    /// The demux loop. Runs until the stream ends, the peer misbehaves, or
    /// the connection is closed locally, then tears everything down.
    pub(crate) async fn run(self: Arc<Self>) {
        tracing::debug!(
            local = %self.stream.local_addr(),
            remote = %self.stream.remote_addr(),
            "mux: starting demux loop"
        );
        let mut phase = self.phase.subscribe();

        loop {
            let received = tokio::select! {
                biased;
                _ = closing(&mut phase) => break,
                received = self.stream.recv_msg() => received,
            };

            let msg = match received {
                Ok(msg) => msg,
                Err(TransportError::Closed) => {
                    tracing::debug!("mux: stream ended by peer");
                    self.begin_shutdown(Some(TransportError::Closed.into()));
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "mux: stream failed");
                    self.begin_shutdown(Some(e.into()));
                    break;
                }
            };
            tracing::trace!(msg = msg.number(), channel_id = ?msg.recipient_channel(), "mux: received");

            // Delivery may wait on a full buffer; a local close must still
            // get through.
            let handled = tokio::select! {
                biased;
                _ = closing(&mut phase) => break,
                handled = self.handle(msg) => handled,
            };
            if let Err(e) = handled {
                tracing::warn!(error = %e, "mux: shutting down");
                self.begin_shutdown(Some(e));
                break;
            }
        }

        self.teardown();
    }

    /// Wake every waiter and close every delivery stream, then publish
    /// `Closed`.
    fn teardown(&self) {
        let state = std::mem::take(&mut *self.state.lock());
        let channels = state.channels.len();
        drop(state);
        self.stream.close();

        let cause = match &*self.phase.borrow() {
            Phase::Closing { cause } | Phase::Closed { cause } => cause.clone(),
            Phase::Open => None,
        };
        tracing::debug!(channels, cause = ?cause, "mux: closed");
        self.phase.send_replace(Phase::Closed { cause });
    }

    async fn handle(self: &Arc<Self>, msg: Message) -> Result<(), ConnectionError> {
        match msg {
            Message::Disconnect {
                reason,
                description,
            } => {
                tracing::debug!(reason, %description, "mux: peer disconnected");
                Err(ConnectionError::Protocol(format!(
                    "peer disconnected: {description} (reason {reason})"
                )))
            }
            Message::GlobalRequest {
                name,
                want_reply,
                payload,
            } => self.route_global_request(name, want_reply, payload).await,
            Message::RequestSuccess { payload } => self.route_global_reply(true, payload),
            Message::RequestFailure => self.route_global_reply(false, Bytes::new()),
            Message::ChannelOpen {
                channel_type,
                sender_channel,
                extra,
                ..
            } => {
                self.route_channel_open(channel_type, sender_channel, extra)
                    .await
            }
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                ..
            } => {
                self.route_open_confirmation(recipient_channel, sender_channel)
                    .await
            }
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
                message,
                ..
            } => self.route_open_failure(recipient_channel, reason, message),
            Message::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                if !self.state.lock().channels.contains_key(&recipient_channel) {
                    return Err(unknown_channel(recipient_channel));
                }
                tracing::trace!(channel_id = recipient_channel, bytes_to_add, "window adjust ignored");
                Ok(())
            }
            Message::ChannelData {
                recipient_channel,
                data,
            } => self.route_data(recipient_channel, data).await,
            Message::ChannelEof { recipient_channel } => self.route_eof(recipient_channel),
            Message::ChannelClose { recipient_channel } => self.route_close(recipient_channel).await,
            Message::ChannelRequest {
                recipient_channel,
                name,
                want_reply,
                payload,
            } => {
                self.route_channel_request(recipient_channel, name, want_reply, payload)
                    .await
            }
            Message::ChannelSuccess { recipient_channel } => {
                self.route_channel_reply(recipient_channel, true)
            }
            Message::ChannelFailure { recipient_channel } => {
                self.route_channel_reply(recipient_channel, false)
            }
        }
    }

    async fn route_global_request(
        self: &Arc<Self>,
        name: String,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        tracing::debug!(name = %name, want_reply, payload_len = payload.len(), "mux: global request");
        let (tx, seq) = {
            let mut state = self.state.lock();
            let seq = want_reply.then(|| state.global_answers.assign());
            (state.global_requests.clone(), seq)
        };
        let request = Request::new(self, ReplyTarget::Global, seq, name, want_reply, payload);

        // Without a receiver the request is dropped here, which refuses it.
        let Some(tx) = tx else {
            return Ok(());
        };
        if tx.send(request).await.is_err() {
            tracing::debug!("mux: global requests receiver dropped");
            self.state.lock().global_requests = None;
        }
        Ok(())
    }

    fn route_global_reply(&self, ok: bool, payload: Bytes) -> Result<(), ConnectionError> {
        let waiter = self.state.lock().global_replies.pop_front();
        match waiter {
            Some(tx) => {
                tracing::debug!(ok, payload_len = payload.len(), "mux: global reply delivered");
                let _ = tx.send((ok, payload));
                Ok(())
            }
            None => Err(ConnectionError::Protocol(
                "global request reply with no request outstanding".into(),
            )),
        }
    }

    async fn route_channel_open(
        self: &Arc<Self>,
        channel_type: String,
        remote_id: u32,
        extra: Bytes,
    ) -> Result<(), ConnectionError> {
        let (tx, live) = {
            let state = self.state.lock();
            (state.new_channels.clone(), state.channels.len())
        };
        tracing::debug!(remote_id, channel_type = %channel_type, live, "mux: channel open");

        if live >= self.config.max_channels {
            tracing::warn!(
                remote_id,
                live,
                max_channels = self.config.max_channels,
                "too many channels; refusing open"
            );
            return self
                .reject_channel(remote_id, RejectionReason::ResourceShortage, "too many channels")
                .await;
        }

        let Some(tx) = tx else {
            return self
                .reject_channel(
                    remote_id,
                    RejectionReason::UnknownChannelType,
                    "channel opens are not accepted",
                )
                .await;
        };

        let new = NewChannel::new(self.clone(), channel_type, remote_id, extra);
        if let Err(mpsc::error::SendError(new)) = tx.send(new).await {
            tracing::debug!("mux: new channel receiver dropped");
            self.state.lock().new_channels = None;
            let remote_id = new.defuse();
            self.reject_channel(
                remote_id,
                RejectionReason::UnknownChannelType,
                "channel opens are not accepted",
            )
            .await?;
        }
        Ok(())
    }

    async fn route_open_confirmation(
        &self,
        local_id: u32,
        remote_id: u32,
    ) -> Result<(), ConnectionError> {
        let delivered = {
            let mut state = self.state.lock();
            let entry = state
                .channels
                .get_mut(&local_id)
                .ok_or_else(|| unknown_channel(local_id))?;
            let Some(waiter) = entry.pending_open.take() else {
                return Err(ConnectionError::Protocol(format!(
                    "open confirmation for channel {local_id} which is not opening"
                )));
            };
            entry.remote_id = Some(remote_id);
            waiter.send(Ok(remote_id)).is_ok()
        };

        if !delivered {
            tracing::debug!(channel_id = local_id, "mux: opener went away; closing channel");
            self.channel_close(local_id).await?;
        }
        Ok(())
    }

    fn route_open_failure(
        &self,
        local_id: u32,
        reason: RejectionReason,
        message: String,
    ) -> Result<(), ConnectionError> {
        let waiter = {
            let mut state = self.state.lock();
            match state.channels.get(&local_id) {
                None => return Err(unknown_channel(local_id)),
                Some(entry) if entry.pending_open.is_none() => {
                    return Err(ConnectionError::Protocol(format!(
                        "open failure for channel {local_id} which is not opening"
                    )));
                }
                Some(_) => state
                    .channels
                    .remove(&local_id)
                    .and_then(|entry| entry.pending_open),
            }
        };

        tracing::debug!(channel_id = local_id, %reason, detail = %message, "mux: channel open refused");
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(OpenChannelError::new(reason, message)));
        }
        Ok(())
    }

    async fn route_data(&self, local_id: u32, data: Bytes) -> Result<(), ConnectionError> {
        let tx = {
            let state = self.state.lock();
            let entry = state
                .channels
                .get(&local_id)
                .ok_or_else(|| unknown_channel(local_id))?;
            entry.data_tx.clone()
        };

        let Some(tx) = tx else {
            tracing::trace!(channel_id = local_id, len = data.len(), "mux: no reader; data dropped");
            return Ok(());
        };
        if tx.send(data).await.is_err() {
            tracing::debug!(channel_id = local_id, "mux: channel reader dropped");
            if let Some(entry) = self.state.lock().channels.get_mut(&local_id) {
                entry.data_tx = None;
            }
        }
        Ok(())
    }

    fn route_eof(&self, local_id: u32) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        let entry = state
            .channels
            .get_mut(&local_id)
            .ok_or_else(|| unknown_channel(local_id))?;
        entry.data_tx = None;
        tracing::debug!(channel_id = local_id, "mux: peer sent eof");
        Ok(())
    }

    async fn route_close(&self, local_id: u32) -> Result<(), ConnectionError> {
        let entry = self
            .state
            .lock()
            .channels
            .remove(&local_id)
            .ok_or_else(|| unknown_channel(local_id))?;
        let (remote_id, sent_close) = (entry.remote_id, entry.sent_close);
        // Ends the channel's data and request streams and fails its waiters.
        drop(entry);
        tracing::debug!(channel_id = local_id, sent_close, "mux: peer closed channel");

        match remote_id {
            Some(remote_id) if !sent_close => {
                self.send(Message::ChannelClose {
                    recipient_channel: remote_id,
                })
                .await
            }
            _ => Ok(()),
        }
    }

    async fn route_channel_request(
        self: &Arc<Self>,
        local_id: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        let (tx, seq) = {
            let mut state = self.state.lock();
            let entry = state
                .channels
                .get_mut(&local_id)
                .ok_or_else(|| unknown_channel(local_id))?;
            let seq = want_reply.then(|| entry.answers.assign());
            (entry.requests_tx.clone(), seq)
        };
        tracing::debug!(channel_id = local_id, name = %name, want_reply, "mux: channel request");

        let request = Request::new(
            self,
            ReplyTarget::Channel { local_id },
            seq,
            name,
            want_reply,
            payload,
        );
        let Some(tx) = tx else {
            return Ok(());
        };
        if tx.send(request).await.is_err() {
            tracing::debug!(channel_id = local_id, "mux: channel requests receiver dropped");
            if let Some(entry) = self.state.lock().channels.get_mut(&local_id) {
                entry.requests_tx = None;
            }
        }
        Ok(())
    }

    fn route_channel_reply(&self, local_id: u32, ok: bool) -> Result<(), ConnectionError> {
        let waiter = {
            let mut state = self.state.lock();
            let entry = state
                .channels
                .get_mut(&local_id)
                .ok_or_else(|| unknown_channel(local_id))?;
            entry.reply_waiters.pop_front()
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(ok);
                Ok(())
            }
            None => Err(ConnectionError::Protocol(format!(
                "reply on channel {local_id} with no request outstanding"
            ))),
        }
    }
}
