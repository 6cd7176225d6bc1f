#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sshconn_core::{
    AddressedStream, AnyStream, Connection, Message, Multiaddr, MuxConfig, NewChannels,
    RejectionReason, Requests, SessionIdentity, TransportError, discard_requests,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fail the test instead of hanging it.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("operation did not complete in time")
}

pub fn identity(user: &str) -> SessionIdentity {
    SessionIdentity::new(
        user,
        vec![0x5e, 0x55, 0x10, 0x1d],
        b"SSH-2.0-sshconn_client".to_vec(),
        b"SSH-2.0-sshconn_server".to_vec(),
    )
}

pub struct Side {
    pub conn: Connection,
    pub new_channels: NewChannels,
    pub requests: Requests,
}

pub struct Pair {
    pub client: Side,
    pub server: Side,
}

pub fn pair_over(client: AnyStream, server: AnyStream, server_config: MuxConfig) -> Pair {
    init_tracing();
    let (conn, new_channels, requests) =
        Connection::new(identity("alice"), client, MuxConfig::default());
    let client = Side {
        conn,
        new_channels,
        requests,
    };
    let (conn, new_channels, requests) = Connection::new(identity("alice"), server, server_config);
    let server = Side {
        conn,
        new_channels,
        requests,
    };
    Pair { client, server }
}

pub fn mem_pair() -> Pair {
    let (a, b) = AnyStream::mem_pair(Multiaddr::memory(1), Multiaddr::memory(2));
    pair_over(a, b, MuxConfig::default())
}

pub fn io_pair() -> Pair {
    let (a, b) = AnyStream::io_pair();
    pair_over(a, b, MuxConfig::default())
}

/// A connection whose peer is driven by hand, message by message.
pub fn raw_peer() -> (Side, AnyStream) {
    init_tracing();
    let (a, b) = AnyStream::mem_pair(Multiaddr::memory(1), Multiaddr::memory(2));
    let (conn, new_channels, requests) = Connection::new(identity("bob"), a, MuxConfig::default());
    (
        Side {
            conn,
            new_channels,
            requests,
        },
        b,
    )
}

/// Accepts `session` channels and echoes their data back; refuses every
/// other type with `administratively prohibited (no)`.
pub fn serve_echo(mut new_channels: NewChannels) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(new) = new_channels.recv().await {
            if new.channel_type() != "session" {
                let _ = new
                    .reject(RejectionReason::AdministrativelyProhibited, "no")
                    .await;
                continue;
            }
            let Ok((mut channel, requests)) = new.accept().await else {
                break;
            };
            tokio::spawn(discard_requests(requests));
            tokio::spawn(async move {
                while let Some(data) = channel.read().await {
                    if channel.write(data).await.is_err() {
                        break;
                    }
                }
                let _ = channel.close().await;
            });
        }
    })
}

/// Stream wrapper whose reads fail with a connection reset on demand.
pub struct FaultyStream {
    inner: AnyStream,
    fault: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct FaultSwitch(Arc<watch::Sender<bool>>);

impl FaultSwitch {
    pub fn trip(&self) {
        self.0.send_replace(true);
    }
}

impl FaultyStream {
    pub fn wrap(inner: AnyStream) -> (AnyStream, FaultSwitch) {
        let fault = Arc::new(watch::Sender::new(false));
        let stream = Self {
            inner,
            fault: fault.clone(),
        };
        (AnyStream::new(stream), FaultSwitch(fault))
    }
}

fn reset() -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "injected reset"))
}

impl AddressedStream for FaultyStream {
    async fn send_msg(&self, msg: Message) -> Result<(), TransportError> {
        if *self.fault.borrow() {
            return Err(reset());
        }
        self.inner.send_msg(msg).await
    }

    async fn recv_msg(&self) -> Result<Message, TransportError> {
        let mut fault = self.fault.subscribe();
        tokio::select! {
            biased;
            _ = fault.wait_for(|tripped| *tripped) => Err(reset()),
            received = self.inner.recv_msg() => received,
        }
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

pub fn empty() -> Bytes {
    Bytes::new()
}
