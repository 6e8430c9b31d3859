//! TCP transport
//!
//! One TCP connection per peer carries both control messages and audio
//! byte streams, multiplexed as length-prefixed frames:
//!
//! ```text
//! ┌──────┬────────────┬─────────────────────────┐
//! │ tag  │ length     │ payload                 │
//! │ u8   │ u32 BE     │ `length` bytes          │
//! └──────┴────────────┴─────────────────────────┘
//! ```
//!
//! Stream frames start their payload with a u32 BE stream id. Each side
//! opens with a `HELLO` frame carrying its [`PeerId`] as JSON.

use bytes::{Buf, Bytes};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::stream::{byte_stream_pair, ChannelWriter};
use super::{OutboundStream, PeerId, PeerState, Reliability, Transport, TransportEvent};
use crate::config::NetworkConfig;
use crate::constants::STREAM_READ_POLL_MS;
use crate::error::TransportError;

const TAG_HELLO: u8 = 0;
const TAG_MESSAGE: u8 = 1;
const TAG_STREAM_OPEN: u8 = 2;
const TAG_STREAM_DATA: u8 = 3;
const TAG_STREAM_CLOSE: u8 = 4;

const MAX_FRAME_LEN: usize = 1 << 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

fn write_frame(mut out: impl Write, tag: u8, parts: &[&[u8]]) -> io::Result<()> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }

    let mut frame = Vec::with_capacity(5 + len);
    frame.push(tag);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    for part in parts {
        frame.extend_from_slice(part);
    }
    out.write_all(&frame)?;
    out.flush()
}

fn read_frame(mut input: impl Read) -> io::Result<(u8, Bytes)> {
    let mut header = [0u8; 5];
    input.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    Ok((header[0], Bytes::from(payload)))
}

/// Split a stream frame payload into its id and body.
fn stream_frame(mut payload: Bytes) -> Option<(u32, Bytes)> {
    if payload.len() < 4 {
        return None;
    }
    let id = payload.get_u32();
    Some((id, payload))
}

/// Addressing and socket options for [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub bind: SocketAddr,
    /// Peer dialled by [`Transport::browse`].
    pub connect_to: Option<String>,
    pub nodelay: bool,
}

impl TcpSettings {
    pub fn from_config(config: &NetworkConfig) -> Result<Self, TransportError> {
        let text = format!("{}:{}", config.bind_address, config.port);
        let bind = text
            .parse()
            .map_err(|_| TransportError::InvalidAddress(text.clone()))?;
        Ok(Self {
            bind,
            connect_to: config.connect_to.clone(),
            nodelay: config.nodelay,
        })
    }
}

struct Connection {
    peer: PeerId,
    writer: Arc<Mutex<TcpStream>>,
    /// Handle used only to shut the socket down.
    control: TcpStream,
    next_stream: u32,
}

struct Shared {
    local: PeerId,
    events: Sender<TransportEvent>,
    nodelay: bool,
    advertising: AtomicBool,
    shutdown: AtomicBool,
    connection: Mutex<Option<Connection>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    fn notify(&self, peer: &PeerId, state: PeerState) {
        let _ = self.events.send(TransportEvent::PeerStateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

/// Exchange identities over a fresh socket and register the connection.
fn establish(shared: &Arc<Shared>, stream: TcpStream) -> io::Result<PeerId> {
    stream.set_nodelay(shared.nodelay)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let hello = serde_json::to_vec(&shared.local)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(&stream, TAG_HELLO, &[&hello])?;

    let (tag, payload) = read_frame(&stream)?;
    if tag != TAG_HELLO {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected HELLO frame"));
    }
    let peer: PeerId = serde_json::from_slice(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    shared.notify(&peer, PeerState::Connecting);

    stream.set_read_timeout(None)?;
    let reader = stream.try_clone()?;
    let control = stream.try_clone()?;

    {
        let mut connection = shared.connection.lock();
        if connection.is_some() {
            let _ = stream.shutdown(Shutdown::Both);
            shared.notify(&peer, PeerState::NotConnected);
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already connected"));
        }
        *connection = Some(Connection {
            peer: peer.clone(),
            writer: Arc::new(Mutex::new(stream)),
            control,
            next_stream: 1,
        });
    }

    let thread_shared = shared.clone();
    let thread_peer = peer.clone();
    let spawned = thread::Builder::new()
        .name("tcp-reader".to_string())
        .spawn(move || run_reader(thread_shared, thread_peer, reader));
    if let Err(e) = spawned {
        if let Some(connection) = shared.connection.lock().take() {
            let _ = connection.control.shutdown(Shutdown::Both);
        }
        shared.notify(&peer, PeerState::NotConnected);
        return Err(e);
    }

    shared.notify(&peer, PeerState::Connected);
    tracing::info!(peer = %peer, "TCP peer connected");
    Ok(peer)
}

fn run_reader(shared: Arc<Shared>, peer: PeerId, socket: TcpStream) {
    let mut streams: HashMap<u32, ChannelWriter> = HashMap::new();
    let read_timeout = Duration::from_millis(STREAM_READ_POLL_MS);

    loop {
        let (tag, payload) = match read_frame(&socket) {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::debug!(peer = %peer, error = %e, "TCP read ended");
                }
                break;
            }
        };

        match tag {
            TAG_MESSAGE => {
                let _ = shared.events.send(TransportEvent::MessageReceived {
                    peer: peer.clone(),
                    bytes: payload.to_vec(),
                });
            }
            TAG_STREAM_OPEN | TAG_STREAM_DATA | TAG_STREAM_CLOSE => {
                let Some((id, body)) = stream_frame(payload) else {
                    tracing::warn!(peer = %peer, tag, "Stream frame without id");
                    continue;
                };
                match tag {
                    TAG_STREAM_OPEN => {
                        let name = String::from_utf8_lossy(&body).into_owned();
                        let (writer, reader) = byte_stream_pair(read_timeout);
                        streams.insert(id, writer);
                        tracing::debug!(peer = %peer, stream = id, name = %name, "Inbound stream opened");
                        let _ = shared.events.send(TransportEvent::StreamOpened {
                            peer: peer.clone(),
                            name,
                            stream: Box::new(reader),
                        });
                    }
                    TAG_STREAM_DATA => {
                        if let Some(writer) = streams.get(&id) {
                            if writer.send_bytes(body).is_err() {
                                streams.remove(&id);
                            }
                        }
                    }
                    _ => {
                        if let Some(writer) = streams.remove(&id) {
                            let dropped = writer.dropped_bytes();
                            if dropped > 0 {
                                tracing::warn!(
                                    peer = %peer,
                                    stream = id,
                                    dropped,
                                    "Inbound stream fell behind, audio was dropped"
                                );
                            }
                        }
                    }
                }
            }
            other => {
                tracing::warn!(peer = %peer, tag = other, "Ignoring unknown frame");
            }
        }
    }

    // Dropping the writers ends every inbound stream.
    drop(streams);

    {
        let mut connection = shared.connection.lock();
        if connection.as_ref().is_some_and(|c| c.peer.id == peer.id) {
            *connection = None;
        }
    }
    tracing::info!(peer = %peer, "TCP peer disconnected");
    shared.notify(&peer, PeerState::NotConnected);
}

fn run_listener(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if !shared.advertising.load(Ordering::Acquire) || shared.is_connected() {
            thread::sleep(ACCEPT_POLL);
            continue;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "Incoming TCP connection");
                let result = stream
                    .set_nonblocking(false)
                    .and_then(|_| establish(&shared, stream));
                if let Err(e) = result {
                    tracing::warn!(%addr, error = %e, "Handshake failed");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Outbound audio stream multiplexed onto the peer connection
struct TcpStreamWriter {
    id: u32,
    writer: Arc<Mutex<TcpStream>>,
}

impl Write for TcpStreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = buf.len().min(MAX_FRAME_LEN - 4);
        let stream = self.writer.lock();
        write_frame(&*stream, TAG_STREAM_DATA, &[&self.id.to_be_bytes(), &buf[..count]])?;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpStreamWriter {
    fn drop(&mut self) {
        let stream = self.writer.lock();
        let _ = write_frame(&*stream, TAG_STREAM_CLOSE, &[&self.id.to_be_bytes()]);
    }
}

/// Transport over a single TCP connection
pub struct TcpTransport {
    shared: Arc<Shared>,
    settings: TcpSettings,
    listener_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(local: PeerId, settings: TcpSettings, events: Sender<TransportEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                events,
                nodelay: settings.nodelay,
                advertising: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                connection: Mutex::new(None),
            }),
            settings,
            listener_handle: None,
            local_addr: None,
        }
    }

    /// Address the listener is bound to, once advertising has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn bind_listener(&mut self) -> Result<(), TransportError> {
        if self.listener_handle.is_some() {
            return Ok(());
        }

        let addr = self.settings.bind;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(1)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        self.local_addr = Some(listener.local_addr()?);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("tcp-listener".to_string())
            .spawn(move || run_listener(shared, listener))?;
        self.listener_handle = Some(handle);

        tracing::info!(addr = ?self.local_addr, "Listening for peers");
        Ok(())
    }

    fn writer(&self) -> Result<Arc<Mutex<TcpStream>>, TransportError> {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or(TransportError::NotConnected)
    }
}

impl Transport for TcpTransport {
    fn local_peer(&self) -> &PeerId {
        &self.shared.local
    }

    fn start_advertising(&mut self) -> Result<(), TransportError> {
        self.bind_listener()?;
        self.shared.advertising.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.shared.advertising.store(false, Ordering::Release);
    }

    fn browse(&mut self) -> Result<(), TransportError> {
        if self.shared.is_connected() {
            return Ok(());
        }

        let target = self
            .settings
            .connect_to
            .as_deref()
            .ok_or_else(|| TransportError::Unreachable("no peer address configured".to_string()))?;
        let addr = target
            .to_socket_addrs()
            .map_err(|_| TransportError::InvalidAddress(target.to_string()))?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(target.to_string()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket
            .connect_timeout(&SockAddr::from(addr), CONNECT_TIMEOUT)
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;

        establish(&self.shared, socket.into())?;
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8], reliability: Reliability) -> Result<(), TransportError> {
        if reliability == Reliability::Unreliable {
            tracing::trace!("TCP delivers unreliable messages reliably");
        }
        let writer = self.writer()?;
        let stream = writer.lock();
        write_frame(&*stream, TAG_MESSAGE, &[bytes]).map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn open_byte_stream(&mut self, name: &str) -> Result<OutboundStream, TransportError> {
        let (id, writer) = {
            let mut connection = self.shared.connection.lock();
            let connection = connection.as_mut().ok_or(TransportError::NotConnected)?;
            let id = connection.next_stream;
            connection.next_stream = connection.next_stream.wrapping_add(1);
            (id, connection.writer.clone())
        };

        {
            let stream = writer.lock();
            write_frame(&*stream, TAG_STREAM_OPEN, &[&id.to_be_bytes(), name.as_bytes()])
                .map_err(|e| TransportError::StreamOpenFailed(e.to_string()))?;
        }

        tracing::debug!(stream = id, name, "Outbound stream opened");
        Ok(Box::new(TcpStreamWriter { id, writer }))
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.shared.connection.lock().take() {
            tracing::info!(peer = %connection.peer, "Disconnecting");
            let _ = connection.control.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.disconnect();
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    fn loopback(connect_to: Option<String>) -> TcpSettings {
        TcpSettings {
            bind: "127.0.0.1:0".parse().unwrap(),
            connect_to,
            nodelay: true,
        }
    }

    fn next_state(rx: &Receiver<TransportEvent>) -> PeerState {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            TransportEvent::PeerStateChanged { state, .. } => state,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, TAG_MESSAGE, &[b"ab", b"c"]).unwrap();
        assert_eq!(out, vec![1, 0, 0, 0, 3, b'a', b'b', b'c']);

        let (tag, payload) = read_frame(&out[..]).unwrap();
        assert_eq!(tag, TAG_MESSAGE);
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = vec![TAG_MESSAGE];
        header.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let err = read_frame(&header[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_stream_frame_needs_id() {
        assert!(stream_frame(Bytes::from_static(&[0, 0])).is_none());
        let (id, body) = stream_frame(Bytes::from_static(&[0, 0, 0, 9, 42])).unwrap();
        assert_eq!(id, 9);
        assert_eq!(&body[..], &[42]);
    }

    #[test]
    fn test_settings_from_config() {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 6123,
            connect_to: Some("10.0.0.2:6123".to_string()),
            nodelay: false,
        };
        let settings = TcpSettings::from_config(&config).unwrap();
        assert_eq!(settings.bind.port(), 6123);
        assert_eq!(settings.connect_to.as_deref(), Some("10.0.0.2:6123"));

        let bad = NetworkConfig {
            bind_address: "not an address".to_string(),
            ..config
        };
        assert!(matches!(
            TcpSettings::from_config(&bad),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_browse_without_address_fails() {
        let (tx, _rx) = unbounded();
        let mut transport = TcpTransport::new(PeerId::new("lonely"), loopback(None), tx);
        assert!(matches!(transport.browse(), Err(TransportError::Unreachable(_))));
    }

    #[test]
    fn test_loopback_session() {
        let (tx_a, rx_a) = unbounded();
        let mut a = TcpTransport::new(PeerId::new("mic"), loopback(None), tx_a);
        a.start_advertising().unwrap();
        let addr = a.local_addr().unwrap();

        let (tx_b, rx_b) = unbounded();
        let mut b = TcpTransport::new(PeerId::new("recorder"), loopback(Some(addr.to_string())), tx_b);
        b.browse().unwrap();

        assert_eq!(next_state(&rx_b), PeerState::Connecting);
        assert_eq!(next_state(&rx_b), PeerState::Connected);
        assert_eq!(next_state(&rx_a), PeerState::Connecting);
        assert_eq!(next_state(&rx_a), PeerState::Connected);

        b.send_message(b"{}", Reliability::Reliable).unwrap();
        match rx_a.recv_timeout(Duration::from_secs(5)).unwrap() {
            TransportEvent::MessageReceived { peer, bytes } => {
                assert_eq!(peer, *b.local_peer());
                assert_eq!(bytes, b"{}");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let mut out = a.open_byte_stream("spare mic stream").unwrap();
        out.write_all(&[5; 300]).unwrap();
        drop(out);
        match rx_b.recv_timeout(Duration::from_secs(5)).unwrap() {
            TransportEvent::StreamOpened { name, mut stream, .. } => {
                assert_eq!(name, "spare mic stream");
                let mut received = Vec::new();
                let mut buf = [0u8; 64];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => panic!("read failed: {}", e),
                    }
                }
                assert_eq!(received, vec![5; 300]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        b.disconnect();
        assert_eq!(next_state(&rx_a), PeerState::NotConnected);
        assert_eq!(next_state(&rx_b), PeerState::NotConnected);
        assert!(!b.is_connected());
    }
}
