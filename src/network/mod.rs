//! Peer transport
//!
//! The session layer talks to the other node only through [`Transport`]:
//! messages in both directions, one outbound byte stream per send session,
//! and a feed of [`TransportEvent`]s for connectivity changes and inbound
//! traffic. Two implementations ship with the crate:
//!
//! - [`memory::MemoryTransport`]: an in-process pair, used by tests
//! - [`tcp::TcpTransport`]: a single framed TCP connection per peer

pub mod memory;
pub mod stream;
pub mod tcp;

pub use memory::MemoryTransport;
pub use stream::{byte_stream_pair, ChannelReader, ChannelWriter};
pub use tcp::TcpTransport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::error::TransportError;

/// Readable half of a peer byte stream
pub type InboundStream = Box<dyn Read + Send>;

/// Writable half of a peer byte stream
pub type OutboundStream = Box<dyn Write + Send>;

/// Identity of a node on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub display_name: String,
    pub id: Uuid,
}

impl PeerId {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Connection state of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    NotConnected,
}

/// Delivery guarantee requested for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    /// May be dropped by the transport without notice.
    Unreliable,
}

/// Notification from a transport to the control context
pub enum TransportEvent {
    PeerStateChanged {
        peer: PeerId,
        state: PeerState,
    },
    MessageReceived {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    StreamOpened {
        peer: PeerId,
        name: String,
        stream: InboundStream,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerStateChanged { peer, state } => f
                .debug_struct("PeerStateChanged")
                .field("peer", peer)
                .field("state", state)
                .finish(),
            Self::MessageReceived { peer, bytes } => f
                .debug_struct("MessageReceived")
                .field("peer", peer)
                .field("len", &bytes.len())
                .finish(),
            Self::StreamOpened { peer, name, .. } => f
                .debug_struct("StreamOpened")
                .field("peer", peer)
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Peer connectivity, messaging and byte streams.
///
/// Implementations deliver [`TransportEvent`]s on the channel supplied when
/// they are constructed. At most one peer is connected at a time.
pub trait Transport: Send {
    /// This node's identity.
    fn local_peer(&self) -> &PeerId;

    /// Accept incoming connections.
    fn start_advertising(&mut self) -> Result<(), TransportError>;

    fn stop_advertising(&mut self);

    /// Look for a peer and connect to it.
    fn browse(&mut self) -> Result<(), TransportError>;

    /// Send `bytes` to the connected peer.
    fn send_message(&mut self, bytes: &[u8], reliability: Reliability) -> Result<(), TransportError>;

    /// Open a named byte stream to the connected peer.
    fn open_byte_stream(&mut self, name: &str) -> Result<OutboundStream, TransportError>;

    /// Drop the current peer, if any.
    fn disconnect(&mut self);
}
