use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::core::{Error, PeerId, Result, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::protocol::{Channel, FrameCodec};
use super::transport::{LinkEvent, Signal, SignalKind, Transport};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses a node advertises in its offer or answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Endpoint {
    peer_id: PeerId,
    version: u8,
    control: SocketAddr,
    sync: SocketAddr,
}

/// First frame on a control stream, sent by the dialing side
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    peer_id: PeerId,
    version: u8,
}

#[derive(Default)]
struct Link {
    remote_sync: Option<SocketAddr>,
    awaiting_inbound: bool,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type Links = Arc<Mutex<HashMap<PeerId, Link>>>;

fn lock(links: &Links) -> MutexGuard<'_, HashMap<PeerId, Link>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// TCP control channel plus UDP sync channel between hosts.
///
/// The side that sent the offer dials the answerer's control address once the
/// answer arrives and identifies itself with a hello frame. Sync frames are
/// datagrams of `u16 id length | sender id | payload`.
pub struct SocketTransport {
    local_id: PeerId,
    control_addr: SocketAddr,
    sync_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
    background: Vec<JoinHandle<()>>,
}

impl SocketTransport {
    /// Binds both sockets on `ip` with ephemeral ports
    ///
    /// Must be called within a tokio runtime. Link events arrive on the
    /// returned receiver.
    pub async fn bind(
        local_id: PeerId,
        ip: IpAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        if ip.is_unspecified() {
            return Err(Error::config("socket transport needs a concrete address to advertise"));
        }

        let listener = TcpListener::bind((ip, 0))
            .await
            .map_err(|e| Error::network(format!("Failed to bind control socket: {}", e)))?;
        let udp = Arc::new(
            UdpSocket::bind((ip, 0))
                .await
                .map_err(|e| Error::network(format!("Failed to bind sync socket: {}", e)))?,
        );
        let control_addr = listener.local_addr()?;
        let sync_addr = udp.local_addr()?;

        let (events, rx) = mpsc::unbounded_channel();
        let links: Links = Arc::new(Mutex::new(HashMap::new()));

        let background = vec![
            tokio::spawn(accept_loop(listener, links.clone(), events.clone())),
            tokio::spawn(datagram_loop(udp.clone(), links.clone(), events.clone())),
        ];

        info!(peer = %local_id, %control_addr, %sync_addr, "socket transport bound");
        Ok((
            SocketTransport {
                local_id,
                control_addr,
                sync_addr,
                udp,
                links,
                events,
                background,
            },
            rx,
        ))
    }

    /// Local control (TCP) address
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Local sync (UDP) address
    pub fn sync_addr(&self) -> SocketAddr {
        self.sync_addr
    }

    fn endpoint(&self) -> Result<serde_json::Value> {
        let endpoint = Endpoint {
            peer_id: self.local_id.clone(),
            version: PROTOCOL_VERSION,
            control: self.control_addr,
            sync: self.sync_addr,
        };
        Ok(serde_json::to_value(endpoint)?)
    }

    fn parse_endpoint(peer: &PeerId, signal: Signal) -> Result<Endpoint> {
        let endpoint: Endpoint = serde_json::from_value(signal.payload)?;
        if endpoint.version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "peer {} speaks protocol version {}, expected {}",
                peer, endpoint.version, PROTOCOL_VERSION
            )));
        }
        if endpoint.peer_id != *peer {
            return Err(Error::protocol(format!(
                "signal from {} carries endpoint of {}",
                peer, endpoint.peer_id
            )));
        }
        Ok(endpoint)
    }
}

impl Transport for SocketTransport {
    fn open(&mut self, peer: &PeerId) -> Result<Signal> {
        let offer = Signal::offer(self.endpoint()?);
        if let Some(mut old) = lock(&self.links).insert(peer.clone(), Link::default()) {
            old.abort();
        }
        debug!(peer = %peer, "offering link");
        Ok(offer)
    }

    fn on_signal(&mut self, peer: &PeerId, signal: Signal) -> Result<Option<Signal>> {
        let kind = signal.kind;
        let endpoint = Self::parse_endpoint(peer, signal)?;

        match kind {
            SignalKind::Offer => {
                let answer = Signal::answer(self.endpoint()?);
                let mut links = lock(&self.links);
                let link = links.entry(peer.clone()).or_default();
                link.abort();
                link.remote_sync = Some(endpoint.sync);
                link.awaiting_inbound = true;
                debug!(peer = %peer, control = %endpoint.control, "answering offer");
                Ok(Some(answer))
            }
            SignalKind::Answer => {
                let mut links = lock(&self.links);
                let Some(link) = links.get_mut(peer) else {
                    return Err(Error::network(format!("answer from {} without an offer", peer)));
                };
                link.remote_sync = Some(endpoint.sync);
                let task = tokio::spawn(dial(
                    self.local_id.clone(),
                    peer.clone(),
                    endpoint.control,
                    self.links.clone(),
                    self.events.clone(),
                ));
                link.tasks.push(task);
                Ok(None)
            }
        }
    }

    fn send(&mut self, peer: &PeerId, channel: Channel, frame: Bytes) -> Result<()> {
        let links = lock(&self.links);
        let link = links
            .get(peer)
            .filter(|l| l.writer.is_some())
            .ok_or_else(|| Error::network(format!("no link to {}", peer)))?;

        match channel {
            Channel::Control => link
                .writer
                .as_ref()
                .ok_or_else(|| Error::network(format!("no link to {}", peer)))?
                .send(frame)
                .map_err(|_| Error::network(format!("control stream to {} closed", peer))),
            Channel::Sync => {
                let addr = link
                    .remote_sync
                    .ok_or_else(|| Error::network(format!("no sync address for {}", peer)))?;
                let datagram = encode_datagram(&self.local_id, &frame)?;
                match self.udp.try_send_to(&datagram, addr) {
                    Ok(_) => Ok(()),
                    // Sync traffic is unreliable; a full buffer drops the frame
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                    Err(e) => Err(Error::network(format!("sync send to {} failed: {}", peer, e))),
                }
            }
        }
    }

    fn close(&mut self, peer: &PeerId) {
        if let Some(mut link) = lock(&self.links).remove(peer) {
            link.abort();
            debug!(peer = %peer, "link closed");
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        for (_, mut link) in lock(&self.links).drain() {
            link.abort();
        }
    }
}

fn encode_datagram(sender: &PeerId, payload: &[u8]) -> Result<Bytes> {
    let id = sender.as_str().as_bytes();
    let len = 2 + id.len() + payload.len();
    if id.len() > u16::MAX as usize || len > MAX_MESSAGE_SIZE {
        return Err(Error::protocol(format!("datagram of {} bytes exceeds limit", len)));
    }
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u16(id.len() as u16);
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

fn decode_datagram(datagram: &[u8]) -> Option<(PeerId, Bytes)> {
    if datagram.len() < 2 {
        return None;
    }
    let id_len = u16::from_be_bytes([datagram[0], datagram[1]]) as usize;
    let rest = &datagram[2..];
    if rest.len() < id_len {
        return None;
    }
    let id = std::str::from_utf8(&rest[..id_len]).ok()?;
    Some((PeerId::new(id), Bytes::copy_from_slice(&rest[id_len..])))
}

async fn dial(
    local_id: PeerId,
    peer: PeerId,
    addr: SocketAddr,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(LinkEvent::LinkFailed {
                peer,
                reason: format!("connect to {} failed: {}", addr, e),
            });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let mut writer = FramedWrite::new(write, FrameCodec::new());

    let hello = Hello {
        peer_id: local_id,
        version: PROTOCOL_VERSION,
    };
    let sent = match serde_json::to_vec(&hello) {
        Ok(frame) => writer.send(Bytes::from(frame)).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        let _ = events.send(LinkEvent::LinkFailed {
            peer,
            reason: format!("hello failed: {}", e),
        });
        return;
    }

    attach(peer, FramedRead::new(read, FrameCodec::new()), writer, links, events);
}

async fn accept_loop(
    listener: TcpListener,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        tokio::spawn(handshake(stream, remote, links.clone(), events.clone()));
    }
}

async fn handshake(
    stream: TcpStream,
    remote: SocketAddr,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, FrameCodec::new());

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(frame))) => serde_json::from_slice::<Hello>(&frame).ok(),
        _ => None,
    };
    let Some(hello) = hello else {
        debug!(%remote, "dropping connection without a valid hello");
        return;
    };
    if hello.version != PROTOCOL_VERSION {
        warn!(%remote, version = hello.version, "dropping connection with unsupported version");
        return;
    }

    let expected = lock(&links)
        .get(&hello.peer_id)
        .map_or(false, |l| l.awaiting_inbound && l.writer.is_none());
    if !expected {
        warn!(%remote, peer = %hello.peer_id, "dropping unexpected connection");
        return;
    }

    attach(
        hello.peer_id,
        reader,
        FramedWrite::new(write, FrameCodec::new()),
        links,
        events,
    );
}

/// Installs the writer, starts the reader and reports the link up
fn attach(
    peer: PeerId,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut guard = lock(&links);
        let Some(link) = guard.get_mut(&peer) else {
            // closed while connecting
            return;
        };
        link.awaiting_inbound = false;
        link.writer = Some(tx);
        link.tasks.push(tokio::spawn(write_loop(writer, rx)));
        link.tasks
            .push(tokio::spawn(read_loop(peer.clone(), reader, events.clone())));
    }

    info!(peer = %peer, "link up");
    let _ = events.send(LinkEvent::LinkUp { peer: peer.clone() });
    let _ = events.send(LinkEvent::ChannelOpen {
        peer: peer.clone(),
        channel: Channel::Control,
    });
    let _ = events.send(LinkEvent::ChannelOpen {
        peer,
        channel: Channel::Sync,
    });
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.send(frame).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
}

async fn read_loop(
    peer: PeerId,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(data) => {
                let _ = events.send(LinkEvent::Frame {
                    peer: peer.clone(),
                    channel: Channel::Control,
                    data,
                });
            }
            Err(e) => {
                let _ = events.send(LinkEvent::LinkFailed {
                    peer,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
    let _ = events.send(LinkEvent::LinkDown { peer });
}

async fn datagram_loop(
    udp: Arc<UdpSocket>,
    links: Links,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "sync receive failed");
                continue;
            }
        };
        let Some((peer, data)) = decode_datagram(&buf[..len]) else {
            debug!(%from, "dropping malformed datagram");
            continue;
        };
        let known = lock(&links)
            .get(&peer)
            .map_or(false, |l| l.writer.is_some() && l.remote_sync == Some(from));
        if !known {
            debug!(%from, peer = %peer, "dropping datagram from unlinked sender");
            continue;
        }
        let _ = events.send(LinkEvent::Frame {
            peer,
            channel: Channel::Sync,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
    }

    #[test]
    fn test_datagram_framing() {
        let frame = encode_datagram(&PeerId::new("abc"), b"{}").unwrap();
        assert_eq!(&frame[..2], &[0, 3]);
        let (peer, data) = decode_datagram(&frame).unwrap();
        assert_eq!(peer, PeerId::new("abc"));
        assert_eq!(&data[..], b"{}");

        assert!(decode_datagram(&[0]).is_none());
        assert!(decode_datagram(&[0, 9, b'a']).is_none());
    }

    #[tokio::test]
    async fn test_unspecified_address_rejected() {
        let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert!(SocketTransport::bind(PeerId::new("a"), ip).await.is_err());
    }

    #[tokio::test]
    async fn test_link_setup_and_traffic() {
        let a_id = PeerId::new("a");
        let b_id = PeerId::new("b");
        let (mut a, mut a_rx) = SocketTransport::bind(a_id.clone(), LOCALHOST).await.unwrap();
        let (mut b, mut b_rx) = SocketTransport::bind(b_id.clone(), LOCALHOST).await.unwrap();

        let offer = a.open(&b_id).unwrap();
        let answer = b.on_signal(&a_id, offer).unwrap().expect("answer");
        assert_eq!(answer.kind, SignalKind::Answer);
        assert!(a.on_signal(&b_id, answer).unwrap().is_none());

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(next_event(rx).await, LinkEvent::LinkUp { .. }));
            assert!(matches!(
                next_event(rx).await,
                LinkEvent::ChannelOpen { channel: Channel::Control, .. }
            ));
            assert!(matches!(
                next_event(rx).await,
                LinkEvent::ChannelOpen { channel: Channel::Sync, .. }
            ));
        }

        a.send(&b_id, Channel::Control, Bytes::from_static(b"control"))
            .unwrap();
        match next_event(&mut b_rx).await {
            LinkEvent::Frame { peer, channel, data } => {
                assert_eq!(peer, a_id);
                assert_eq!(channel, Channel::Control);
                assert_eq!(&data[..], b"control");
            }
            other => panic!("unexpected event {:?}", other),
        }

        b.send(&a_id, Channel::Sync, Bytes::from_static(b"sync")).unwrap();
        match next_event(&mut a_rx).await {
            LinkEvent::Frame { peer, channel, data } => {
                assert_eq!(peer, b_id);
                assert_eq!(channel, Channel::Sync);
                assert_eq!(&data[..], b"sync");
            }
            other => panic!("unexpected event {:?}", other),
        }

        b.close(&a_id);
        assert!(b.send(&a_id, Channel::Control, Bytes::new()).is_err());
        assert!(matches!(next_event(&mut a_rx).await, LinkEvent::LinkDown { .. }));
    }

    #[tokio::test]
    async fn test_mismatched_endpoint_rejected() {
        let (mut a, _a_rx) = SocketTransport::bind(PeerId::new("a"), LOCALHOST).await.unwrap();
        let (mut b, _b_rx) = SocketTransport::bind(PeerId::new("b"), LOCALHOST).await.unwrap();

        let offer = a.open(&PeerId::new("b")).unwrap();
        // relayed as if it came from someone else
        assert!(b.on_signal(&PeerId::new("c"), offer).is_err());
        assert!(b.send(&PeerId::new("a"), Channel::Sync, Bytes::new()).is_err());
    }
}
