//! sshconn-core: SSH-style connections over addressable streams.
//!
//! This crate defines:
//! - Endpoint addresses ([`Multiaddr`])
//! - Session identity and the read-only metadata capability
//!   ([`SessionIdentity`], [`ConnectionMetadata`], [`ConnMetadata`])
//! - The connection operation surface ([`Conn`], [`Connection`])
//! - Channels and inbound channel opens ([`Channel`], [`NewChannel`])
//! - Out-of-band requests and the drain helper ([`Request`], [`discard_requests`])
//! - Stream traits and backends ([`AddressedStream`], [`AnyStream`])
//! - Wire messages and their encoding ([`Message`], [`codec`])
//! - Errors ([`ConnectionError`], [`OpenChannelError`], [`TransportError`])
//!
//! # Liveness
//!
//! Every [`Requests`] stream, global or per channel, has to be drained
//! while its source lives. One consumer that stops reading fills its
//! buffer, the demux loop waits for space, and the whole connection
//! stalls. Pass streams you have no use for to [`discard_requests`].
//!
//! # Example
//!
//! ```ignore
//! let (conn, mut new_channels, requests) = Connection::new(identity, stream, MuxConfig::from_env());
//! tokio::spawn(discard_requests(requests));
//!
//! let (mut channel, channel_requests) = conn.open_channel("session", Bytes::new()).await?;
//! tokio::spawn(discard_requests(channel_requests));
//! channel.write(Bytes::from_static(b"hello")).await?;
//! ```

mod addr;
mod channel;
pub mod codec;
mod config;
mod connection;
mod error;
mod metadata;
mod msg;
mod mux;
mod request;
pub mod stream;

pub use addr::*;
pub use channel::*;
pub use config::*;
pub use connection::*;
pub use error::*;
pub use metadata::*;
pub use msg::*;
pub use request::Request;
pub use stream::{AddressedStream, AnyStream, DynStream};
