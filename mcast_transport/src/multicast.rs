// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The production transport: packet payloads travel as UDP multicast
//! datagrams, discovery happens through periodic announce datagrams on
//! the same group, and each subscriber keeps a TCP control link back to
//! every publisher it has attached to.
//!
//! Datagram layout: a one-byte kind tag, the sender's node id, then the
//! kind-specific body. Control links start with a hello frame naming the
//! subscriber's node id, after which every frame is an opaque control
//! message handed up to the caller.

use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::*;

use crate::*;

const DATAGRAM_DATA: u8 = 1;
const DATAGRAM_ANNOUNCE: u8 = 2;

const FRAME_HELLO: u8 = 1;
const FRAME_CONTROL: u8 = 2;

/// Parameters for building a multicast [`Transport`].
pub struct McastConfig {
    /// This peer's node id; 0 means the transport allocates one.
    pub node_id: NodeId,

    /// Upper bound on concurrently attached publishers.
    pub max_peers: usize,

    /// Multicast group the mesh communicates on.
    pub group: SocketAddrV4,

    /// Interface address used for multicast send/join; unspecified means
    /// the routing default.
    pub iface: Ipv4Addr,

    pub ttl: u32,

    /// Address and port the control-link TCP listener binds to; port 0
    /// picks an ephemeral port.
    pub listen_iface: Ipv4Addr,
    pub listen_port: u16,
}

impl Default for McastConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            max_peers: 32,
            group: SocketAddrV4::new(Ipv4Addr::new(239, 40, 41, 42), 4723),
            iface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            listen_iface: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
        }
    }
}

/// Build a connected publisher/subscriber pair for the given group.
pub fn transport(cfg: &McastConfig) -> io::Result<Transport> {
    let node_id = if cfg.node_id != 0 { cfg.node_id } else { allocate_node_id() };

    let publisher = McastPublisher::new(node_id, cfg)?;
    let subscriber = McastSubscriber::new(node_id, cfg)?;

    Ok(Transport {
        publisher: Box::new(publisher),
        subscriber: Box::new(subscriber),
    })
}

/// Derive a node id for a peer configured with id 0. Ids only need to be
/// distinct within one multicast group, and never 0.
fn allocate_node_id() -> NodeId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let id = nanos ^ std::process::id().rotate_left(16);
    if id == 0 {
        1
    } else {
        id
    }
}

enum Datagram<'a> {
    Data { payload: &'a [u8] },
    Announce { node_id: NodeId, control_port: u16 },
}

fn parse_datagram(buf: &[u8]) -> Option<Datagram> {
    if buf.len() < 5 {
        return None;
    }

    let node_id = u32::from_le_bytes(buf[1..5].try_into().unwrap());

    match buf[0] {
        DATAGRAM_DATA => Some(Datagram::Data { payload: &buf[5..] }),
        DATAGRAM_ANNOUNCE => {
            if buf.len() < 7 {
                return None;
            }
            let control_port = u16::from_le_bytes(buf[5..7].try_into().unwrap());
            Some(Datagram::Announce { node_id, control_port })
        }
        _ => None,
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

// Publisher-side socket indices: 0 is the multicast send socket, 1 the
// control listener, 2 and up the accepted control links.
const PUB_MCAST: SocketIndex = 0;
const PUB_LISTENER: SocketIndex = 1;
const PUB_CONN_BASE: SocketIndex = 2;

struct ControlConn {
    stream: TcpStream,
    /// Unknown until the subscriber's hello frame arrives.
    peer: Option<NodeId>,
    frames: FrameBuf,
}

pub struct McastPublisher {
    node_id: NodeId,
    group: SocketAddrV4,
    mcast: UdpSocket,
    listener: TcpListener,
    conns: Vec<Option<ControlConn>>,

    egress: VecDeque<Vec<u8>>,
    write_armed: bool,
    suspended: bool,
    suspend_at: usize,
    restart_at: usize,

    announce: Option<Duration>,
    next_announce: Option<Instant>,
    /// Port the listener actually bound, advertised in announcements.
    control_port: u16,
}

impl McastPublisher {
    fn new(node_id: NodeId, cfg: &McastConfig) -> io::Result<Self> {
        let mcast = send_socket(cfg)?;

        let listener = TcpListener::bind(SocketAddrV4::new(cfg.listen_iface, cfg.listen_port))?;
        listener.set_nonblocking(true)?;
        let control_port = listener.local_addr()?.port();

        debug!("publisher node 0x{node_id:X}: control listener on port {control_port}");

        Ok(Self {
            node_id,
            group: cfg.group,
            mcast,
            listener,
            conns: Vec::new(),
            egress: VecDeque::new(),
            write_armed: false,
            suspended: false,
            suspend_at: usize::MAX,
            restart_at: usize::MAX,
            announce: None,
            next_announce: None,
            control_port,
        })
    }

    fn accept_pending(&mut self, sink: &mut dyn InterestSink) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Could not make control link from {addr} nonblocking: {e}");
                        continue;
                    }

                    let slot = self.conns.iter().position(|c| c.is_none());
                    let slot = match slot {
                        Some(s) => s,
                        None => {
                            self.conns.push(None);
                            self.conns.len() - 1
                        }
                    };

                    sink.add(stream.as_raw_fd(), PUB_CONN_BASE + slot, PollAction::READ);
                    self.conns[slot] = Some(ControlConn {
                        stream,
                        peer: None,
                        frames: FrameBuf::default(),
                    });
                }
                Err(e) if would_block(&e) => return,
                Err(e) => {
                    warn!("Error accepting control link: {e}");
                    return;
                }
            }
        }
    }

    fn read_conn(
        &mut self,
        slot: usize,
        sink: &mut dyn InterestSink,
        events: &mut Vec<PubEvent>,
    ) -> io::Result<()> {
        let mut closed = false;

        if let Some(conn) = self.conns.get_mut(slot).and_then(Option::as_mut) {
            let mut buf = [0u8; 4096];
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.frames.extend(&buf[..n]),
                    Err(e) if would_block(&e) => break,
                    Err(e) => {
                        debug!("Control link read error: {e}");
                        closed = true;
                        break;
                    }
                }
            }

            while let Some(payload) = conn.frames.next() {
                match payload.split_first() {
                    Some((&FRAME_HELLO, rest)) if rest.len() >= 4 => {
                        let peer = u32::from_le_bytes(rest[..4].try_into().unwrap());
                        debug!("Subscriber 0x{peer:X} attached");
                        conn.peer = Some(peer);
                    }
                    Some((&FRAME_CONTROL, rest)) => match conn.peer {
                        Some(peer) => events.push(PubEvent::ControlMessage {
                            peer,
                            payload: rest.to_vec(),
                        }),
                        None => warn!("Control message before hello; dropping"),
                    },
                    _ => warn!("Unrecognized control frame; dropping"),
                }
            }
        }

        if closed {
            self.drop_conn(slot, sink, events);
        }

        Ok(())
    }

    fn drop_conn(&mut self, slot: usize, sink: &mut dyn InterestSink, events: &mut Vec<PubEvent>) {
        if let Some(conn) = self.conns.get_mut(slot).and_then(Option::take) {
            sink.remove(conn.stream.as_raw_fd(), PUB_CONN_BASE + slot);
            if let Some(peer) = conn.peer {
                info!("Subscriber 0x{peer:X} detached");
                events.push(PubEvent::SubscriberDisconnect { peer });
            }
        }
    }

    fn update_suspension(&mut self) {
        if !self.suspended && self.egress.len() >= self.suspend_at {
            info!("Outbound queue at {} packets; suspending traffic", self.egress.len());
            self.suspended = true;
        } else if self.suspended && self.egress.len() <= self.restart_at {
            info!("Outbound queue drained to {} packets; resuming traffic", self.egress.len());
            self.suspended = false;
        }
    }
}

impl Publisher for McastPublisher {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }

    fn socket_count(&self) -> usize {
        2 + self.conns.iter().flatten().count()
    }

    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()> {
        sink.add(self.listener.as_raw_fd(), PUB_LISTENER, PollAction::READ);
        Ok(())
    }

    fn queue_packet(
        &mut self,
        payload: Vec<u8>,
        sink: &mut dyn InterestSink,
    ) -> Result<(), TransportError> {
        if self.suspended {
            return Err(TransportError::Suspended);
        }

        let mut datagram = Vec::with_capacity(5 + payload.len());
        datagram.push(DATAGRAM_DATA);
        datagram.extend_from_slice(&self.node_id.to_le_bytes());
        datagram.extend_from_slice(&payload);

        self.egress.push_back(datagram);
        self.update_suspension();

        if !self.write_armed {
            sink.add(self.mcast.as_raw_fd(), PUB_MCAST, PollAction::WRITE);
            self.write_armed = true;
        }

        Ok(())
    }

    fn traffic_suspended(&self) -> bool {
        self.suspended
    }

    fn set_throttling(&mut self, suspend_at: usize, restart_at: usize) {
        self.suspend_at = suspend_at;
        self.restart_at = restart_at;
    }

    fn set_announce_interval(&mut self, interval: Option<Duration>) {
        self.announce = interval;
        self.next_announce = interval.map(|iv| Instant::now() + iv);
    }

    fn announce_interval(&self) -> Option<Duration> {
        self.announce
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.next_announce
    }

    fn process_timeout(&mut self, _sink: &mut dyn InterestSink) -> io::Result<()> {
        let (Some(interval), Some(due)) = (self.announce, self.next_announce) else {
            return Ok(());
        };

        if Instant::now() < due {
            return Ok(());
        }

        let mut datagram = Vec::with_capacity(7);
        datagram.push(DATAGRAM_ANNOUNCE);
        datagram.extend_from_slice(&self.node_id.to_le_bytes());
        datagram.extend_from_slice(&self.control_port.to_le_bytes());

        match self.mcast.send_to(&datagram, self.group) {
            Ok(_) => trace!("Announced node 0x{:X} port {}", self.node_id, self.control_port),
            // A full socket buffer just delays discovery one tick.
            Err(e) if would_block(&e) => {}
            Err(e) => warn!("Error sending announce: {e}"),
        }

        self.next_announce = Some(Instant::now() + interval);
        Ok(())
    }

    fn read(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<PubEvent>,
    ) -> io::Result<()> {
        match index {
            PUB_LISTENER => {
                self.accept_pending(sink);
                Ok(())
            }
            PUB_MCAST => Ok(()),
            conn => self.read_conn(conn - PUB_CONN_BASE, sink, events),
        }
    }

    fn write(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) -> io::Result<()> {
        if index != PUB_MCAST {
            return Ok(());
        }

        while let Some(front) = self.egress.front() {
            match self.mcast.send_to(front, self.group) {
                Ok(_) => {
                    self.egress.pop_front();
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }

        if self.egress.is_empty() && self.write_armed {
            sink.remove(self.mcast.as_raw_fd(), PUB_MCAST);
            self.write_armed = false;
        }

        self.update_suspension();
        Ok(())
    }

    fn close_connection(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<PubEvent>,
    ) {
        if index >= PUB_CONN_BASE {
            self.drop_conn(index - PUB_CONN_BASE, sink, events);
        } else {
            warn!("Request to close publisher socket {index} ignored");
        }
    }
}

fn send_socket(cfg: &McastConfig) -> io::Result<UdpSocket> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    sock.set_nonblocking(true)?;
    sock.bind(&socket2::SockAddr::from(SocketAddrV4::new(cfg.iface, 0)))?;
    sock.set_multicast_ttl_v4(cfg.ttl)?;
    sock.set_multicast_loop_v4(true)?;
    if !cfg.iface.is_unspecified() {
        sock.set_multicast_if_v4(&cfg.iface)?;
    }

    Ok(sock.into())
}

fn recv_socket(cfg: &McastConfig) -> io::Result<UdpSocket> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    // Several peers on one host share the group port.
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&socket2::SockAddr::from(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        cfg.group.port(),
    )))?;
    sock.join_multicast_v4(cfg.group.ip(), &cfg.iface)?;

    Ok(sock.into())
}

// Subscriber-side socket indices: 0 is the multicast receive socket,
// 1 and up the outbound control links.
const SUB_RECV: SocketIndex = 0;
const SUB_LINK_BASE: SocketIndex = 1;

enum LinkState {
    /// Nonblocking connect still in flight.
    Connecting,
    Ready,
}

struct PubLink {
    stream: TcpStream,
    peer: NodeId,
    state: LinkState,
    /// Unwritten control-frame bytes.
    egress: Vec<u8>,
    interest: PollAction,
}

pub struct McastSubscriber {
    node_id: NodeId,
    recv: UdpSocket,
    links: Vec<Option<PubLink>>,
    max_peers: usize,
}

impl McastSubscriber {
    fn new(node_id: NodeId, cfg: &McastConfig) -> io::Result<Self> {
        Ok(Self {
            node_id,
            recv: recv_socket(cfg)?,
            links: Vec::new(),
            max_peers: cfg.max_peers,
        })
    }

    /// React to an announce datagram: connect to the publisher's control
    /// port unless a link already exists.
    fn handle_announce(
        &mut self,
        peer: NodeId,
        addr: SocketAddrV4,
        sink: &mut dyn InterestSink,
    ) {
        if self.links.iter().flatten().any(|l| l.peer == peer) {
            return;
        }

        if self.links.iter().flatten().count() >= self.max_peers {
            warn!("Ignoring announce from 0x{peer:X}: peer limit {} reached", self.max_peers);
            return;
        }

        let stream = match connect_nonblocking(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not open control link to 0x{peer:X} at {addr}: {e}");
                return;
            }
        };

        debug!("Opening control link to publisher 0x{peer:X} at {addr}");

        let slot = match self.links.iter().position(|l| l.is_none()) {
            Some(s) => s,
            None => {
                self.links.push(None);
                self.links.len() - 1
            }
        };

        sink.add(stream.as_raw_fd(), SUB_LINK_BASE + slot, PollAction::WRITE);
        self.links[slot] = Some(PubLink {
            stream,
            peer,
            state: LinkState::Connecting,
            egress: Vec::new(),
            interest: PollAction::WRITE,
        });
    }

    fn drop_link(&mut self, slot: usize, sink: &mut dyn InterestSink) {
        if let Some(link) = self.links.get_mut(slot).and_then(Option::take) {
            debug!("Control link to publisher 0x{:X} closed", link.peer);
            sink.remove(link.stream.as_raw_fd(), SUB_LINK_BASE + slot);
        }
    }

    /// Write out as much pending control data as the socket accepts,
    /// then settle the link's poll interest.
    fn flush_link(&mut self, slot: usize, sink: &mut dyn InterestSink) -> io::Result<()> {
        let Some(link) = self.links.get_mut(slot).and_then(Option::as_mut) else {
            return Ok(());
        };

        while !link.egress.is_empty() {
            match link.stream.write(&link.egress) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    link.egress.drain(..n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }

        let wanted = if link.egress.is_empty() {
            PollAction::READ
        } else {
            PollAction::READ_WRITE
        };

        if link.interest != wanted {
            sink.modify(link.stream.as_raw_fd(), SUB_LINK_BASE + slot, link.interest, wanted);
            link.interest = wanted;
        }

        Ok(())
    }
}

impl Subscriber for McastSubscriber {
    fn socket_count(&self) -> usize {
        1 + self.links.iter().flatten().count()
    }

    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()> {
        sink.add(self.recv.as_raw_fd(), SUB_RECV, PollAction::READ);
        Ok(())
    }

    fn write_control_message(
        &mut self,
        peer: NodeId,
        payload: &[u8],
        sink: &mut dyn InterestSink,
    ) -> Result<(), TransportError> {
        let slot = self
            .links
            .iter()
            .position(|l| l.as_ref().is_some_and(|l| l.peer == peer))
            .ok_or(TransportError::UnknownPeer(peer))?;

        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(FRAME_CONTROL);
        body.extend_from_slice(payload);

        let framed = frame(&body);
        self.links[slot].as_mut().unwrap().egress.extend_from_slice(&framed);

        self.flush_link(slot, sink)?;
        Ok(())
    }

    fn next_timeout(&self) -> Option<Instant> {
        None
    }

    fn process_timeout(&mut self, _sink: &mut dyn InterestSink) -> io::Result<()> {
        Ok(())
    }

    fn read(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<SubEvent>,
    ) -> io::Result<()> {
        if index != SUB_RECV {
            // Publishers do not talk back over the control link; reads
            // there only serve to detect the link closing.
            let slot = index - SUB_LINK_BASE;
            let mut closed = false;

            if let Some(link) = self.links.get_mut(slot).and_then(Option::as_mut) {
                let mut buf = [0u8; 256];
                loop {
                    match link.stream.read(&mut buf) {
                        Ok(0) => {
                            closed = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) if would_block(&e) => break,
                        Err(e) => {
                            debug!("Control link read error: {e}");
                            closed = true;
                            break;
                        }
                    }
                }
            }

            if closed {
                self.drop_link(slot, sink);
            }
            return Ok(());
        }

        let mut buf = vec![0u8; 5 + MAX_PAYLOAD];
        loop {
            match self.recv.recv_from(&mut buf) {
                Ok((n, src)) => match parse_datagram(&buf[..n]) {
                    Some(Datagram::Data { payload }) => events.push(SubEvent::PacketReady {
                        payload: payload.to_vec(),
                    }),
                    Some(Datagram::Announce { node_id, control_port }) => {
                        let std::net::SocketAddr::V4(src) = src else {
                            continue;
                        };
                        let target = SocketAddrV4::new(*src.ip(), control_port);
                        self.handle_announce(node_id, target, sink);
                    }
                    None => warn!("Unparseable datagram of {n} bytes from {src}"),
                },
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn write(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<SubEvent>,
    ) -> io::Result<()> {
        if index < SUB_LINK_BASE {
            return Ok(());
        }
        let slot = index - SUB_LINK_BASE;
        let node_id = self.node_id;

        let mut failed = false;
        let mut completed = None;

        if let Some(link) = self.links.get_mut(slot).and_then(Option::as_mut) {
            if let LinkState::Connecting = link.state {
                match link.stream.take_error()? {
                    Some(e) => {
                        warn!("Control link to 0x{:X} failed to connect: {e}", link.peer);
                        failed = true;
                    }
                    None => {
                        link.state = LinkState::Ready;
                        completed = Some(link.peer);

                        let mut hello = Vec::with_capacity(5);
                        hello.push(FRAME_HELLO);
                        hello.extend_from_slice(&node_id.to_le_bytes());
                        let framed = frame(&hello);
                        link.egress.extend_from_slice(&framed);
                    }
                }
            }
        }

        if failed {
            self.drop_link(slot, sink);
            return Ok(());
        }

        if let Some(peer) = completed {
            events.push(SubEvent::SubscriptionComplete { peer });
        }

        self.flush_link(slot, sink)
    }

    fn close_connection(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) {
        if index >= SUB_LINK_BASE {
            self.drop_link(index - SUB_LINK_BASE, sink);
        }
    }
}

/// Start a nonblocking TCP connect; EINPROGRESS is the expected result.
fn connect_nonblocking(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    sock.set_nonblocking(true)?;

    match sock.connect(&socket2::SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) => match e.raw_os_error().map(nix::errno::Errno::from_raw) {
            Some(nix::errno::Errno::EINPROGRESS) => {}
            _ => return Err(e),
        },
    }

    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_datagram_round_trip() {
        let mut wire = vec![DATAGRAM_DATA];
        wire.extend_from_slice(&0xC0FFEEu32.to_le_bytes());
        wire.extend_from_slice(b"payload");

        match parse_datagram(&wire) {
            Some(Datagram::Data { payload }) => assert_eq!(payload, b"payload"),
            _ => panic!("expected data datagram"),
        }
    }

    #[test]
    fn announce_datagram_round_trip() {
        let mut wire = vec![DATAGRAM_ANNOUNCE];
        wire.extend_from_slice(&7u32.to_le_bytes());
        wire.extend_from_slice(&4242u16.to_le_bytes());

        match parse_datagram(&wire) {
            Some(Datagram::Announce { node_id, control_port }) => {
                assert_eq!(node_id, 7);
                assert_eq!(control_port, 4242);
            }
            _ => panic!("expected announce datagram"),
        }
    }

    #[test]
    fn runt_datagrams_are_rejected() {
        assert!(parse_datagram(&[]).is_none());
        assert!(parse_datagram(&[DATAGRAM_DATA, 1, 2]).is_none());
        assert!(parse_datagram(&[DATAGRAM_ANNOUNCE, 1, 2, 3, 4]).is_none());
        assert!(parse_datagram(&[99, 1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn allocated_node_ids_are_nonzero() {
        assert_ne!(allocate_node_id(), 0);
    }
}
