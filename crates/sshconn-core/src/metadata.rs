//! Read-only facts about an established session.
//!
//! [`ConnectionMetadata`] is deliberately narrower than
//! [`Conn`](crate::Conn): code that only needs to know who is on the other
//! end and where they are gets a [`ConnMetadata`] and cannot send, open or
//! close anything through it.

use std::fmt;
use std::sync::Arc;

use crate::Multiaddr;
use crate::stream::AnyStream;

/// Identity negotiated by the handshake. Never changes afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    user: String,
    session_id: Box<[u8]>,
    client_version: Box<[u8]>,
    server_version: Box<[u8]>,
}

impl SessionIdentity {
    pub fn new(
        user: impl Into<String>,
        session_id: impl Into<Vec<u8>>,
        client_version: impl Into<Vec<u8>>,
        server_version: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            user: user.into(),
            session_id: session_id.into().into_boxed_slice(),
            client_version: client_version.into().into_boxed_slice(),
            server_version: server_version.into().into_boxed_slice(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

// The session id is a secret-derived hash; keep it out of logs.
impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user", &self.user)
            .field("session_id_len", &self.session_id.len())
            .field(
                "client_version",
                &String::from_utf8_lossy(&self.client_version),
            )
            .field(
                "server_version",
                &String::from_utf8_lossy(&self.server_version),
            )
            .finish()
    }
}

/// Identity and addressing of a connection.
///
/// Byte accessors return a fresh buffer on every call. Mutating it has no
/// effect on the connection or on later calls. Addresses are asked of the
/// stream each time, so they follow the stream if it rebinds.
pub trait ConnectionMetadata: Send + Sync {
    /// The authenticated user.
    fn user(&self) -> &str;

    /// The session hash computed during the handshake.
    fn session_id(&self) -> Vec<u8>;

    fn client_version(&self) -> Vec<u8>;

    fn server_version(&self) -> Vec<u8>;

    fn remote_addr(&self) -> Multiaddr;

    fn local_addr(&self) -> Multiaddr;
}

/// Metadata-only handle to a connection.
///
/// Cheap to clone and safe to give to code that must not touch the data
/// path.
#[derive(Clone)]
pub struct ConnMetadata {
    identity: Arc<SessionIdentity>,
    stream: AnyStream,
}

impl ConnMetadata {
    pub(crate) fn new(identity: SessionIdentity, stream: AnyStream) -> Self {
        Self {
            identity: Arc::new(identity),
            stream,
        }
    }
}

impl fmt::Debug for ConnMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnMetadata")
            .field("identity", &self.identity)
            .field("local", &self.stream.local_addr())
            .field("remote", &self.stream.remote_addr())
            .finish()
    }
}

impl ConnectionMetadata for ConnMetadata {
    fn user(&self) -> &str {
        &self.identity.user
    }

    fn session_id(&self) -> Vec<u8> {
        self.identity.session_id.to_vec()
    }

    fn client_version(&self) -> Vec<u8> {
        self.identity.client_version.to_vec()
    }

    fn server_version(&self) -> Vec<u8> {
        self.identity.server_version.to_vec()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.stream.remote_addr()
    }

    fn local_addr(&self) -> Multiaddr {
        self.stream.local_addr()
    }
}
