use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::ConnectionError;
use crate::mux::Mux;

/// Where the answer to a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyTarget {
    Global,
    Channel { local_id: u32 },
}

struct Replier {
    mux: Arc<Mux>,
    target: ReplyTarget,
    /// Position among the requests on `target` that want a reply.
    seq: u64,
}

/// An out-of-band request from the peer, for the connection or one channel.
///
/// If `want_reply` is set the peer is blocked until [`reply`](Self::reply)
/// is called. A request dropped without a reply is answered with failure,
/// so forgetting to reply stalls nothing.
///
/// Answers go out in the order the requests arrived, whatever order they
/// are given in: an answer to a later request waits until every earlier
/// one on the same connection or channel has been answered or dropped.
pub struct Request {
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
    replier: Option<Replier>,
}

impl Request {
    pub(crate) fn new(
        mux: &Arc<Mux>,
        target: ReplyTarget,
        seq: Option<u64>,
        name: String,
        want_reply: bool,
        payload: Bytes,
    ) -> Self {
        let replier = seq.map(|seq| Replier {
            mux: mux.clone(),
            target,
            seq,
        });
        Self {
            name,
            want_reply,
            payload,
            replier,
        }
    }

    /// Answer the request.
    ///
    /// Does nothing when the peer asked for no reply. Channel replies carry
    /// no payload on the wire, so `payload` only matters for global
    /// requests.
    pub async fn reply(mut self, ok: bool, payload: Bytes) -> Result<(), ConnectionError> {
        match self.replier.take() {
            Some(replier) => {
                replier
                    .mux
                    .send_reply(replier.target, replier.seq, ok, payload)
                    .await
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .field("answered", &self.replier.is_none())
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let Some(replier) = self.replier.take() else {
            return;
        };
        tracing::debug!(
            name = %self.name,
            reply_to = ?replier.target,
            "request dropped without reply; refusing it"
        );
        // The refusal takes its place in the queue now; only the send is
        // deferred.
        let Replier { mux, target, seq } = replier;
        if mux.queue_reply(target, seq, false, Bytes::new()).is_err() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = mux.flush_replies(target).await;
            });
        }
    }
}
