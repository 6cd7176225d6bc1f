//! Multi-protocol endpoint addresses.
//!
//! A stream endpoint is not necessarily a socket: it may be a QUIC stream
//! relayed through a peer, an in-process pipe, or a plain TCP connection.
//! [`Multiaddr`] describes such an endpoint as an ordered stack of protocol
//! components, rendered as `/ip4/127.0.0.1/tcp/22`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// One component of a [`Multiaddr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Tcp(u16),
    Udp(u16),
    Quic,
    /// In-process endpoint identified by an opaque number.
    Memory(u64),
    /// Peer identity, as an opaque textual id.
    P2p(String),
}

impl Protocol {
    /// The protocol's name as it appears in the textual form.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ip4(_) => "ip4",
            Self::Ip6(_) => "ip6",
            Self::Dns(_) => "dns",
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            Self::Quic => "quic",
            Self::Memory(_) => "memory",
            Self::P2p(_) => "p2p",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Self::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Self::Dns(host) => write!(f, "/dns/{host}"),
            Self::Tcp(port) => write!(f, "/tcp/{port}"),
            Self::Udp(port) => write!(f, "/udp/{port}"),
            Self::Quic => write!(f, "/quic"),
            Self::Memory(id) => write!(f, "/memory/{id}"),
            Self::P2p(id) => write!(f, "/p2p/{id}"),
        }
    }
}

/// An address made of a stack of protocol components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// An address with no components.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A `/memory/<id>` address, used by in-process streams.
    pub fn memory(id: u64) -> Self {
        Self {
            components: vec![Protocol::Memory(id)],
        }
    }

    /// Append a component.
    pub fn push(&mut self, protocol: Protocol) {
        self.components.push(protocol);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.push(protocol);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl From<SocketAddr> for Multiaddr {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self {
            components: vec![ip, Protocol::Tcp(addr.port())],
        }
    }
}

impl FromIterator<Protocol> for Multiaddr {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        Self {
            components: iter.into_iter().collect(),
        }
    }
}

/// Errors from parsing the textual form of a [`Multiaddr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrParseError {
    MissingLeadingSlash,
    UnknownProtocol(String),
    MissingValue(&'static str),
    InvalidValue { protocol: &'static str, value: String },
}

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLeadingSlash => write!(f, "address must start with '/'"),
            Self::UnknownProtocol(name) => write!(f, "unknown protocol {name:?}"),
            Self::MissingValue(protocol) => write!(f, "protocol {protocol} requires a value"),
            Self::InvalidValue { protocol, value } => {
                write!(f, "invalid value {value:?} for protocol {protocol}")
            }
        }
    }
}

impl std::error::Error for AddrParseError {}

impl FromStr for Multiaddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or(AddrParseError::MissingLeadingSlash)?;

        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut addr = Multiaddr::empty();

        while let Some(name) = parts.next() {
            let protocol = match name {
                "ip4" => Protocol::Ip4(parse_value("ip4", parts.next())?),
                "ip6" => Protocol::Ip6(parse_value("ip6", parts.next())?),
                "dns" => Protocol::Dns(require_value("dns", parts.next())?.to_owned()),
                "tcp" => Protocol::Tcp(parse_value("tcp", parts.next())?),
                "udp" => Protocol::Udp(parse_value("udp", parts.next())?),
                "quic" => Protocol::Quic,
                "memory" => Protocol::Memory(parse_value("memory", parts.next())?),
                "p2p" => Protocol::P2p(require_value("p2p", parts.next())?.to_owned()),
                other => return Err(AddrParseError::UnknownProtocol(other.to_owned())),
            };
            addr.push(protocol);
        }

        Ok(addr)
    }
}

fn require_value<'a>(
    protocol: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, AddrParseError> {
    value.ok_or(AddrParseError::MissingValue(protocol))
}

fn parse_value<T: FromStr>(
    protocol: &'static str,
    value: Option<&str>,
) -> Result<T, AddrParseError> {
    let value = require_value(protocol, value)?;
    value.parse().map_err(|_| AddrParseError::InvalidValue {
        protocol,
        value: value.to_owned(),
    })
}
