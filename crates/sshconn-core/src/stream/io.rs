use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;

use crate::{DecodeError, Message, MuxConfig, Multiaddr, TransportError, codec};

use super::AddressedStream;

/// Length-prefixed message framing over any byte stream.
///
/// Each message is written as a `u32` big-endian length followed by its
/// wire encoding. Confidentiality and integrity are the job of whatever
/// produced `io` (the handshake transport); this layer only frames.
#[derive(Clone)]
pub struct IoStream {
    inner: Arc<IoInner>,
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStream")
            .field("local", &*self.inner.local.read())
            .field("remote", &*self.inner.remote.read())
            .finish_non_exhaustive()
    }
}

struct IoInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: watch::Sender<bool>,
    max_frame_len: usize,
    local: RwLock<Multiaddr>,
    remote: RwLock<Multiaddr>,
}

impl IoStream {
    pub fn new<T>(io: T, local: Multiaddr, remote: Multiaddr) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_max_frame_len(io, local, remote, MuxConfig::default().max_frame_len)
    }

    pub fn with_max_frame_len<T>(
        io: T,
        local: Multiaddr,
        remote: Multiaddr,
        max_frame_len: usize,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            inner: Arc::new(IoInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: watch::Sender::new(false),
                max_frame_len,
                local: RwLock::new(local),
                remote: RwLock::new(remote),
            }),
        }
    }

    /// A connected pair over `tokio::io::duplex`, bound to `/memory/1` and
    /// `/memory/2`.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        let (addr_a, addr_b) = (Multiaddr::memory(1), Multiaddr::memory(2));
        (
            Self::new(a, addr_a.clone(), addr_b.clone()),
            Self::new(b, addr_b, addr_a),
        )
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }

    async fn write_frame(&self, msg: &Message) -> Result<(), TransportError> {
        let mut body = BytesMut::with_capacity(64);
        codec::encode(msg, &mut body);
        let len = frame_len(body.len(), self.inner.max_frame_len)?;

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&self) -> Result<Message, TransportError> {
        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > self.inner.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len: frame_len,
                max: self.inner.max_frame_len,
            }
            .into());
        }

        let mut body = vec![0u8; frame_len];
        reader.read_exact(&mut body).await?;
        Ok(codec::decode(Bytes::from(body))?)
    }
}

/// The length prefix for a body of `len` bytes, if it may be sent.
fn frame_len(len: usize, max: usize) -> Result<u32, DecodeError> {
    u32::try_from(len)
        .ok()
        .filter(|_| len <= max)
        .ok_or(DecodeError::FrameTooLarge { len, max })
}

impl AddressedStream for IoStream {
    async fn send_msg(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            res = self.write_frame(&msg) => res,
        }
    }

    async fn recv_msg(&self) -> Result<Message, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            res = self.read_frame() => res,
        }
    }

    fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        tracing::debug!(local = %self.inner.local.read(), "io stream closed");

        // Shutting down the write half is what lets the peer see EOF. It has
        // to wait for any in-flight write to notice the close and release
        // the lock, so it runs in the background.
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut writer = inner.writer.lock().await;
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(error = %e, "io stream shutdown failed");
                }
            });
        }
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn frames_survive_the_byte_pipe() {
        let (a, b) = IoStream::pair();
        let msg = Message::ChannelRequest {
            recipient_channel: 4,
            name: "exec".into(),
            want_reply: true,
            payload: Bytes::from_static(b"\x00\x00\x00\x02ls"),
        };
        a.send_msg(msg.clone()).await.unwrap();
        assert_eq!(b.recv_msg().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn peer_sees_end_of_stream_after_close() {
        let (a, b) = IoStream::pair();
        a.send_msg(Message::RequestFailure).await.unwrap();
        a.close();

        assert_eq!(b.recv_msg().await.unwrap(), Message::RequestFailure);
        let end = tokio::time::timeout(Duration::from_secs(1), b.recv_msg())
            .await
            .expect("peer observed close");
        assert!(matches!(end, Err(TransportError::Closed)));
        assert!(matches!(
            a.send_msg(Message::RequestFailure).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn length_prefix_must_fit_in_u32() {
        assert_eq!(frame_len(65, 1 << 20), Ok(65));
        assert_eq!(
            frame_len(65, 16),
            Err(DecodeError::FrameTooLarge { len: 65, max: 16 })
        );
        #[cfg(target_pointer_width = "64")]
        {
            let len = u32::MAX as usize + 1;
            assert_eq!(
                frame_len(len, usize::MAX),
                Err(DecodeError::FrameTooLarge {
                    len,
                    max: usize::MAX
                })
            );
        }
    }

    #[tokio::test]
    async fn configured_limit_reaches_the_stream() {
        let config = MuxConfig::from_lookup(|key| {
            (key == "SSHCONN_MAX_FRAME_LEN").then(|| "16".to_string())
        });
        assert_eq!(config.max_frame_len, 16);

        let (a, b) = tokio::io::duplex(1024);
        let (addr_a, addr_b) = (Multiaddr::memory(1), Multiaddr::memory(2));
        let limited = crate::AnyStream::io(a, addr_a.clone(), addr_b.clone(), &config);
        let sender = IoStream::new(b, addr_b, addr_a);

        // Refused before anything is written.
        let big = Message::RequestSuccess {
            payload: Bytes::from(vec![1u8; 32]),
        };
        assert!(matches!(
            limited.send_msg(big.clone()).await,
            Err(TransportError::Decode(DecodeError::FrameTooLarge { len: 33, max: 16 }))
        ));

        sender.send_msg(big).await.unwrap();
        assert!(matches!(
            limited.recv_msg().await,
            Err(TransportError::Decode(DecodeError::FrameTooLarge { len: 33, max: 16 }))
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (a, b) = tokio::io::duplex(1024);
        let (addr_a, addr_b) = (Multiaddr::memory(1), Multiaddr::memory(2));
        let sender = IoStream::with_max_frame_len(a, addr_a.clone(), addr_b.clone(), 1 << 20);
        let receiver = IoStream::with_max_frame_len(b, addr_b, addr_a, 16);

        let send = tokio::spawn(async move {
            sender
                .send_msg(Message::RequestSuccess {
                    payload: Bytes::from(vec![7u8; 64]),
                })
                .await
        });

        let err = receiver.recv_msg().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Decode(DecodeError::FrameTooLarge { len: 65, max: 16 })
        ));
        drop(receiver);
        let _ = send.await;
    }
}
