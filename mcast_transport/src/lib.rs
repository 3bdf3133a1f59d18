// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The transport seam beneath the RPC engine: a reliable-multicast
//! publisher that fans invocation packets out to every subscribed peer,
//! and a subscriber that receives packets and keeps a TCP control link
//! back to each publisher it has attached to.
//!
//! The engine consumes the [`Publisher`] and [`Subscriber`] traits and
//! never looks inside an implementation. Two implementations are bundled:
//! [`multicast`] (UDP multicast payload path, TCP control mesh, periodic
//! announcements) and [`pair`] (a socketpair-backed in-process mesh used
//! for testing).

pub mod multicast;
pub mod pair;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use log::*;

/// Identifies one peer process in the multicast group. Stable for the
/// lifetime of that peer's transport contexts.
pub type NodeId = u32;

/// Index of one socket within a publisher or subscriber context. Indices
/// are assigned by the transport and embedded into readiness tokens by
/// the caller.
pub type SocketIndex = usize;

/// Largest packet payload a bundled transport accepts in one
/// `queue_packet` call.
pub const MAX_PAYLOAD: usize = 63 * 1024;

/// The read/write interest a transport wants for one of its sockets.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PollAction {
    pub read: bool,
    pub write: bool,
}

impl PollAction {
    pub const READ: PollAction = PollAction { read: true, write: false };
    pub const WRITE: PollAction = PollAction { read: false, write: true };
    pub const READ_WRITE: PollAction = PollAction { read: true, write: true };

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Callback interface through which a transport registers its sockets
/// with the caller's readiness facility. Implemented by the engine's
/// poll adapter.
///
/// Registration failure is fatal to the process and handled inside the
/// sink; a failed removal is only a warning. `modify` with identical old
/// and new interest is a no-op.
pub trait InterestSink {
    fn add(&mut self, fd: RawFd, index: SocketIndex, action: PollAction);
    fn modify(&mut self, fd: RawFd, index: SocketIndex, old: PollAction, new: PollAction);
    fn remove(&mut self, fd: RawFd, index: SocketIndex);
}

/// Events surfaced by the publisher side's read/write entry points.
#[derive(Debug, PartialEq, Eq)]
pub enum PubEvent {
    /// A subscriber sent a control message over its TCP link.
    ControlMessage { peer: NodeId, payload: Vec<u8> },

    /// A subscriber's control link dropped; the peer is gone.
    SubscriberDisconnect { peer: NodeId },
}

/// Events surfaced by the subscriber side's read/write entry points.
#[derive(Debug, PartialEq, Eq)]
pub enum SubEvent {
    /// A complete packet payload is ready for dispatch.
    PacketReady { payload: Vec<u8> },

    /// The TCP control link to a publisher finished establishing.
    SubscriptionComplete { peer: NodeId },
}

/// The possible errors from transport operations that are not plain I/O
/// entry-point failures.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),

    /// `queue_packet` was called while outbound traffic is suspended.
    /// Callers are expected to check `traffic_suspended` first.
    Suspended,

    /// A control message was addressed to a peer with no established
    /// control link.
    UnknownPeer(NodeId),
}

impl std::error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Suspended => write!(f, "outbound traffic suspended"),
            Self::UnknownPeer(node) => write!(f, "no control link to peer 0x{node:X}"),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// The outbound half of a transport: multicasts packets to every
/// subscribed peer, accepts control links from subscribers, and reports
/// back-pressure through `traffic_suspended`.
pub trait Publisher {
    fn node_id(&self) -> NodeId;

    /// Largest payload one `queue_packet` call accepts. The engine sizes
    /// its bundling buffer from this.
    fn max_payload(&self) -> usize;

    fn socket_count(&self) -> usize;

    /// Register the context's initial sockets with the readiness
    /// facility. Called once during engine setup.
    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()>;

    /// Queue one packet for transmission to all subscribers.
    fn queue_packet(
        &mut self,
        payload: Vec<u8>,
        sink: &mut dyn InterestSink,
    ) -> Result<(), TransportError>;

    /// True while the in-flight packet count is above the suspension
    /// threshold. Cleared only after draining below the restart mark.
    fn traffic_suspended(&self) -> bool;

    fn set_throttling(&mut self, suspend_at: usize, restart_at: usize);

    fn set_announce_interval(&mut self, interval: Option<Duration>);
    fn announce_interval(&self) -> Option<Duration>;

    /// Absolute time of the next scheduled timer tick, if any.
    fn next_timeout(&self) -> Option<Instant>;

    fn process_timeout(&mut self, sink: &mut dyn InterestSink) -> io::Result<()>;

    fn read(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<PubEvent>,
    ) -> io::Result<()>;

    /// A write failure means the connection at `index` is dead; the
    /// caller must follow up with `close_connection`.
    fn write(&mut self, index: SocketIndex, sink: &mut dyn InterestSink) -> io::Result<()>;

    fn close_connection(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<PubEvent>,
    );
}

/// The inbound half of a transport: receives packets from every
/// publisher in the group and maintains an outbound TCP control link to
/// each publisher it has subscribed to.
pub trait Subscriber {
    fn socket_count(&self) -> usize;

    fn activate(&mut self, sink: &mut dyn InterestSink) -> io::Result<()>;

    /// Send one control message to a specific publisher over its
    /// control link.
    fn write_control_message(
        &mut self,
        peer: NodeId,
        payload: &[u8],
        sink: &mut dyn InterestSink,
    ) -> Result<(), TransportError>;

    fn next_timeout(&self) -> Option<Instant>;

    fn process_timeout(&mut self, sink: &mut dyn InterestSink) -> io::Result<()>;

    fn read(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<SubEvent>,
    ) -> io::Result<()>;

    fn write(
        &mut self,
        index: SocketIndex,
        sink: &mut dyn InterestSink,
        events: &mut Vec<SubEvent>,
    ) -> io::Result<()>;

    fn close_connection(&mut self, index: SocketIndex, sink: &mut dyn InterestSink);
}

/// A matched publisher/subscriber pair making up one peer's transport.
pub struct Transport {
    pub publisher: Box<dyn Publisher + Send>,
    pub subscriber: Box<dyn Subscriber + Send>,
}

/// Control links carry length-prefixed frames: a little-endian u32 byte
/// count followed by that many payload bytes.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Largest control frame either bundled transport will accept. Anything
/// longer means the stream has desynchronized.
const MAX_CONTROL_FRAME: usize = 4096;

/// Incremental parser for the control-link framing. Bytes go in as they
/// arrive from the stream; complete frames come out.
#[derive(Default)]
struct FrameBuf {
    buf: Vec<u8>,
}

impl FrameBuf {
    fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }

        let len = u32::from_le_bytes(self.buf[..4].try_into().unwrap()) as usize;
        if len > MAX_CONTROL_FRAME {
            warn!("Control frame of {len} bytes exceeds limit; dropping stream contents");
            self.buf.clear();
            return None;
        }

        if self.buf.len() < 4 + len {
            return None;
        }

        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reassemble_across_partial_reads() {
        let mut framer = FrameBuf::default();
        let wire = frame(b"hello");

        framer.extend(&wire[..3]);
        assert_eq!(framer.next(), None);

        framer.extend(&wire[3..]);
        assert_eq!(framer.next(), Some(b"hello".to_vec()));
        assert_eq!(framer.next(), None);
    }

    #[test]
    fn back_to_back_frames() {
        let mut framer = FrameBuf::default();
        let mut wire = frame(b"one");
        wire.extend_from_slice(&frame(b"two"));

        framer.extend(&wire);
        assert_eq!(framer.next(), Some(b"one".to_vec()));
        assert_eq!(framer.next(), Some(b"two".to_vec()));
        assert_eq!(framer.next(), None);
    }

    #[test]
    fn oversized_frame_is_dropped() {
        let mut framer = FrameBuf::default();
        framer.extend(&(u32::MAX).to_le_bytes());
        framer.extend(b"junk");
        assert_eq!(framer.next(), None);
    }
}
