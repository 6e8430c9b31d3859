//! In-process transport
//!
//! Two [`MemoryTransport`]s created by [`MemoryTransport::pair`] behave like
//! two nodes on a network: one advertises, the other browses, and they
//! connect. Used to drive session controllers end to end without sockets.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::stream::byte_stream_pair;
use super::{OutboundStream, PeerId, PeerState, Reliability, Transport, TransportEvent};
use crate::constants::STREAM_READ_POLL_MS;
use crate::error::TransportError;

struct Endpoint {
    peer: PeerId,
    events: Sender<TransportEvent>,
    advertising: bool,
    browsing: bool,
}

struct Link {
    ends: [Endpoint; 2],
    connected: bool,
    drop_unreliable: bool,
}

impl Link {
    fn notify_state(&self, state: PeerState) {
        for side in 0..2 {
            let other = &self.ends[1 - side];
            let _ = self.ends[side].events.send(TransportEvent::PeerStateChanged {
                peer: other.peer.clone(),
                state,
            });
        }
    }

    fn try_connect(&mut self) {
        if self.connected {
            return;
        }
        let ready = (self.ends[0].browsing && self.ends[1].advertising)
            || (self.ends[1].browsing && self.ends[0].advertising);
        if !ready {
            return;
        }

        self.connected = true;
        for end in &mut self.ends {
            end.browsing = false;
        }
        self.notify_state(PeerState::Connecting);
        self.notify_state(PeerState::Connected);
        tracing::debug!(
            a = %self.ends[0].peer,
            b = %self.ends[1].peer,
            "Memory transport connected"
        );
    }
}

/// One node's view of an in-process link
pub struct MemoryTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
    local: PeerId,
}

/// A transport together with the events it delivers
pub type MemoryEndpoint = (MemoryTransport, Receiver<TransportEvent>);

impl MemoryTransport {
    /// Create two linked transports named `a` and `b`.
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (MemoryEndpoint, MemoryEndpoint) {
        let peer_a = PeerId::new(a);
        let peer_b = PeerId::new(b);
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();

        let link = Arc::new(Mutex::new(Link {
            ends: [
                Endpoint {
                    peer: peer_a.clone(),
                    events: tx_a,
                    advertising: false,
                    browsing: false,
                },
                Endpoint {
                    peer: peer_b.clone(),
                    events: tx_b,
                    advertising: false,
                    browsing: false,
                },
            ],
            connected: false,
            drop_unreliable: false,
        }));

        (
            (
                Self {
                    link: link.clone(),
                    side: 0,
                    local: peer_a,
                },
                rx_a,
            ),
            (
                Self {
                    link,
                    side: 1,
                    local: peer_b,
                },
                rx_b,
            ),
        )
    }

    /// Silently discard every unreliable message sent over this link.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.link.lock().drop_unreliable = drop;
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    fn remote_events(link: &Link, side: usize) -> &Sender<TransportEvent> {
        &link.ends[1 - side].events
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn start_advertising(&mut self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        link.ends[self.side].advertising = true;
        link.try_connect();
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.link.lock().ends[self.side].advertising = false;
    }

    fn browse(&mut self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        link.ends[self.side].browsing = true;
        link.try_connect();
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8], reliability: Reliability) -> Result<(), TransportError> {
        let link = self.link.lock();
        if !link.connected {
            return Err(TransportError::NotConnected);
        }
        if reliability == Reliability::Unreliable && link.drop_unreliable {
            tracing::trace!(bytes = bytes.len(), "Dropping unreliable message");
            return Ok(());
        }

        Self::remote_events(&link, self.side)
            .send(TransportEvent::MessageReceived {
                peer: self.local.clone(),
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::SendFailed("remote peer is gone".to_string()))
    }

    fn open_byte_stream(&mut self, name: &str) -> Result<OutboundStream, TransportError> {
        let link = self.link.lock();
        if !link.connected {
            return Err(TransportError::NotConnected);
        }

        let (writer, reader) = byte_stream_pair(Duration::from_millis(STREAM_READ_POLL_MS));
        Self::remote_events(&link, self.side)
            .send(TransportEvent::StreamOpened {
                peer: self.local.clone(),
                name: name.to_string(),
                stream: Box::new(reader),
            })
            .map_err(|_| TransportError::StreamOpenFailed("remote peer is gone".to_string()))?;

        Ok(Box::new(writer))
    }

    fn disconnect(&mut self) {
        let mut link = self.link.lock();
        if !link.connected {
            return;
        }
        link.connected = false;
        link.notify_state(PeerState::NotConnected);
        tracing::debug!(peer = %self.local, "Memory transport disconnected");
    }
}
