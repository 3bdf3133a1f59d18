// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! An in-process transport built from socketpairs, used to exercise
//! engines without touching a network interface. Every publisher is
//! pre-wired to every subscriber in the mesh (its own included, matching
//! multicast loopback), so discovery needs no announcements: each
//! control link reports subscription-complete on its first writable
//! event and carries control messages from then on.
//!
//! Back-pressure is real: payloads travel through kernel datagram
//! buffers, so an undriven engine eventually sees `WouldBlock`, queued
//! packets pile up, and the suspend threshold trips exactly as it does
//! over the wire.

use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::time::{Duration, Instant};

use log::*;

use crate::*;

/// Build one transport per node id, fully cross-linked.
pub fn mesh(node_ids: &[NodeId]) -> io::Result<Vec<Transport>> {
    let n = node_ids.len();
    let mut pub_socks: Vec<Vec<Option<PubSock>>> = (0..n).map(|_| Vec::new()).collect();
    let mut sub_socks: Vec<Vec<Option<SubSock>>> = (0..n).map(|_| Vec::new()).collect();

    for i in 0..n {
        for j in 0..n {
            // Payload path: publisher i to subscriber j.
            let (tx, rx) = UnixDatagram::pair()?;
            tx.set_nonblocking(true)?;
            rx.set_nonblocking(true)?;
            pub_socks[i].push(Some(PubSock::Data(DataLink {
                sock: tx,
                queue: VecDeque::new(),
                armed: false,
            })));
            sub_socks[j].push(Some(SubSock::Data(rx)));

            // Control path: subscriber i to publisher j.
            let (sub_end, pub_end) = UnixStream::pair()?;
            sub_end.set_nonblocking(true)?;
            pub_end.set_nonblocking(true)?;
            sub_socks[i].push(Some(SubSock::Control(SubLink {
                stream: sub_end,
                peer: node_ids[j],
                greeted: false,
                egress: Vec::new(),
                interest: PollAction::WRITE,
            })));
            pub_socks[j].push(Some(PubSock::Control(ControlLink {
                stream: pub_end,
                peer: node_ids[i],
                frames: FrameBuf::default(),
            })));
        }
    }

    let mut transports = Vec::with_capacity(n);
    for (i, &node_id) in node_ids.iter().enumerate() {
        transports.push(Transport {
            publisher: Box::new(PairPublisher {
                node_id,
                socks: std::mem::take(&mut pub_socks[i]),
                suspended: false,
                suspend_at: usize::MAX,
                restart_at: usize::MAX,
                announce: None,
            }),
            subscriber: Box::new(PairSubscriber {
                socks: std::mem::take(&mut sub_socks[i]),
            }),
        });
    }

    Ok(transports)
}

/// Two cross-linked transports.
pub fn pair(a: NodeId, b: NodeId) -> io::Result<(Transport, Transport)> {
    let mut transports = mesh(&[a, b])?;
    let second = transports.pop().unwrap();
    let first = transports.pop().unwrap();
    Ok((first, second))
}

struct DataLink {
    sock: UnixDatagram,
    queue: VecDeque<Vec<u8>>,
    armed: bool,
}

struct ControlLink {
    stream: UnixStream,
    peer: NodeId,
    frames: FrameBuf,
}

enum PubSock {
    Data(DataLink),
    Control(ControlLink),
}

pub struct PairPublisher {
    node_id: NodeId,
    socks: Vec<Option<PubSock>>,
    suspended: bool,
    suspend_at: usize,
    restart_at: usize,
    announce: Option<Duration>,
}

impl PairPublisher {
    /// Depth of the most backed-up payload link.
    fn in_flight(&self) -> usize {
        self.socks
            .iter()
            .flatten()
            .map(|s| match s {
                PubSock::Data(link) => link.queue.len(),
                PubSock::Control(_) => 0,
            })
            .max()
            .unwrap_or(0)
    }

    fn update_suspension(&mut self) {
        let depth = self.in_flight();
        if !self.suspended && depth >= self.suspend_at {
            info!("Payload link at {depth} packets; suspending traffic");
            self.suspended = true;
        } else if self.suspended && depth <= self.restart_at {
            info!("Payload links drained to {depth} packets; resuming traffic");
            self.suspended = false;
        }
    }
}

impl Publisher for PairPublisher {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }

    fn socket_count(&self) -> usize {
        self.socks.iter().flatten().count()
    }

    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()> {
        for (index, sock) in self.socks.iter().enumerate() {
            if let Some(PubSock::Control(link)) = sock {
                sink.add(link.stream.as_raw_fd(), index, PollAction::READ);
            }
        }
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

        for (index, sock) in self.socks.iter_mut().enumerate() {
            if let Some(PubSock::Data(link)) = sock {
                link.queue.push_back(payload.clone());
                if !link.armed {
                    sink.add(link.sock.as_raw_fd(), index, PollAction::WRITE);
                    link.armed = true;
                }
            }
        }

        self.update_suspension();
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
        // Pre-wired links make announcements moot; remembered so callers
        // can observe what was configured.
        self.announce = interval;
    }

    fn announce_interval(&self) -> Option<Duration> {
        self.announce
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
        events: &mut Vec<PubEvent>,
    ) -> io::Result<()> {
        let mut closed = false;

        if let Some(PubSock::Control(link)) = self.socks.get_mut(index).and_then(Option::as_mut) {
            let mut buf = [0u8; 4096];
            loop {
                match link.stream.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => link.frames.extend(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("Control link read error: {e}");
                        closed = true;
                        break;
                    }
                }
            }

            while let Some(payload) = link.frames.next() {
                events.push(PubEvent::ControlMessage {
                    peer: link.peer,
                    payload,
                });
            }
        }

        if closed {
            self.close_connection(index, sink, events);
        }

        Ok(())
    }

    fn write(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) -> io::Result<()> {
        if let Some(PubSock::Data(link)) = self.socks.get_mut(index).and_then(Option::as_mut) {
            while let Some(front) = link.queue.front() {
                match link.sock.send(front) {
                    Ok(_) => {
                        link.queue.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if link.queue.is_empty() && link.armed {
                sink.remove(link.sock.as_raw_fd(), index);
                link.armed = false;
            }
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
        match self.socks.get_mut(index).and_then(Option::take) {
            Some(PubSock::Control(link)) => {
                sink.remove(link.stream.as_raw_fd(), index);
                info!("Subscriber 0x{:X} detached", link.peer);
                events.push(PubEvent::SubscriberDisconnect { peer: link.peer });
            }
            Some(PubSock::Data(link)) => {
                if link.armed {
                    sink.remove(link.sock.as_raw_fd(), index);
                }
            }
            None => {}
        }
    }
}

struct SubLink {
    stream: UnixStream,
    peer: NodeId,
    /// Subscription-complete has been reported for this link.
    greeted: bool,
    egress: Vec<u8>,
    interest: PollAction,
}

enum SubSock {
    Data(UnixDatagram),
    Control(SubLink),
}

pub struct PairSubscriber {
    socks: Vec<Option<SubSock>>,
}

impl PairSubscriber {
    fn flush_link(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) -> io::Result<()> {
        let Some(SubSock::Control(link)) = self.socks.get_mut(index).and_then(Option::as_mut)
        else {
            return Ok(());
        };

        while !link.egress.is_empty() {
            match link.stream.write(&link.egress) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    link.egress.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let wanted = if link.egress.is_empty() {
            PollAction::READ
        } else {
            PollAction::READ_WRITE
        };

        if link.interest != wanted {
            sink.modify(link.stream.as_raw_fd(), index, link.interest, wanted);
            link.interest = wanted;
        }

        Ok(())
    }
}

impl Subscriber for PairSubscriber {
    fn socket_count(&self) -> usize {
        self.socks.iter().flatten().count()
    }

    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()> {
        for (index, sock) in self.socks.iter().enumerate() {
            match sock {
                Some(SubSock::Data(sock)) => sink.add(sock.as_raw_fd(), index, PollAction::READ),
                // First writable event reports the subscription.
                Some(SubSock::Control(link)) => {
                    sink.add(link.stream.as_raw_fd(), index, PollAction::WRITE)
                }
                None => {}
            }
        }
        Ok(())
    }

    fn write_control_message(
        &mut self,
        peer: NodeId,
        payload: &[u8],
        sink: &mut dyn InterestSink,
    ) -> Result<(), TransportError> {
        let index = self
            .socks
            .iter()
            .position(|s| matches!(s, Some(SubSock::Control(l)) if l.peer == peer))
            .ok_or(TransportError::UnknownPeer(peer))?;

        let framed = frame(payload);
        if let Some(SubSock::Control(link)) = self.socks[index].as_mut() {
            link.egress.extend_from_slice(&framed);
        }

        self.flush_link(index, sink)?;
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
        let mut closed = false;

        match self.socks.get_mut(index).and_then(Option::as_mut) {
            Some(SubSock::Data(sock)) => {
                let mut buf = vec![0u8; MAX_PAYLOAD];
                loop {
                    match sock.recv(&mut buf) {
                        Ok(n) => events.push(SubEvent::PacketReady {
                            payload: buf[..n].to_vec(),
                        }),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            Some(SubSock::Control(link)) => {
                let mut buf = [0u8; 256];
                loop {
                    match link.stream.read(&mut buf) {
                        Ok(0) => {
                            closed = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!("Control link read error: {e}");
                            closed = true;
                            break;
                        }
                    }
                }
            }
            None => {}
        }

        if closed {
            self.close_connection(index, sink);
        }

        Ok(())
    }

    fn write(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<SubEvent>,
    ) -> io::Result<()> {
        let mut completed = None;

        if let Some(SubSock::Control(link)) = self.socks.get_mut(index).and_then(Option::as_mut) {
            if !link.greeted {
                link.greeted = true;
                completed = Some(link.peer);
            }
        }

        if let Some(peer) = completed {
            events.push(SubEvent::SubscriptionComplete { peer });
        }

        self.flush_link(index, sink)
    }

    fn close_connection(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) {
        match self.socks.get_mut(index).and_then(Option::take) {
            Some(SubSock::Control(link)) => {
                debug!("Control link to publisher 0x{:X} closed", link.peer);
                sink.remove(link.stream.as_raw_fd(), index);
            }
            Some(SubSock::Data(sock)) => {
                sink.remove(sock.as_raw_fd(), index);
            }
            None => {}
        }
    }
}
