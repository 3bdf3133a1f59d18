// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A symmetric, fire-and-forget RPC engine over reliable multicast.
//!
//! Each peer declares the server functions it implements and the client
//! functions it intends to invoke, then drives an event loop. Peers
//! discover each other through transport announcements, trade function
//! lists over per-peer control links, and ship invocations as bundled
//! multicast packets. There is no request/response pairing: a reply is
//! modeled as a one-shot callback the caller arms locally and the remote
//! end invokes by reference.
//!
//! The engine is single-threaded and cooperative. Nothing blocks except
//! the readiness wait inside [`Engine::process_single_event`], and every
//! dispatch runs to completion inside that call. Callers that share an
//! engine across threads must serialize access themselves.

pub mod config;

mod buffer;
mod codec;
mod engine;
mod event;
mod poll;
mod registry;
mod remote;

use std::fmt;
use std::io;

pub use engine::{Engine, Services};
pub use event::Tick;
pub use registry::ClientStub;

pub use mcast_transport as transport;
pub use mcast_transport::{NodeId, Transport};

/// Upper bound on entries in each symbol table (server functions, client
/// functions, armed callbacks, remote availability entries). Exceeding
/// it is a configuration error and aborts the process.
pub const SYMBOL_TABLE_SIZE: usize = 256;

/// Longest accepted function name, excluding the wire terminator.
pub const MAX_NAME_LEN: usize = 63;

/// One inbound invocation as handed to a dispatch function. `name` is
/// empty and `callback` set for callback-form invocations.
pub struct Invocation<'a> {
    pub caller: NodeId,
    pub name: &'a str,
    pub callback: Option<CallbackRef>,
    pub args: &'a [u8],
}

/// A server function: invoked for every matching inbound invocation,
/// with the engine's user state.
pub type ServerFn<T> = fn(&Invocation, &mut T);

/// A one-shot continuation armed with [`Engine::activate_callback`].
pub type CallbackFn<T> = Box<dyn FnOnce(&Invocation, &mut T) + Send>;

/// Opaque token identifying a one-shot continuation at the peer that
/// armed it. Minted by the engine and carried end-to-end through the
/// argument payload, so the remote end can invoke the continuation by
/// sending the token back in a callback-form invocation.
///
/// Internally an arena slot index plus a generation counter; a stale
/// token fails the generation check and the invocation is dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallbackRef(u64);

impl CallbackRef {
    /// The wire representation.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstitute a reference received in an argument payload.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    pub(crate) fn split(self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }
}

/// The possible failures of the queueing operations. Both are
/// recoverable; nothing was enqueued.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The bundling buffer cannot fit the new invocation. The caller is
    /// required to drive the event loop until space appears, then retry.
    Busy,

    /// Neither a usable function name nor a callback reference was
    /// supplied.
    InvalidIdentifier,
}

impl std::error::Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "outbound buffer full, run the event loop and retry"),
            Self::InvalidIdentifier => write!(f, "neither function name nor callback reference"),
        }
    }
}

/// The possible failures of engine setup.
#[derive(Debug)]
pub enum SetupError {
    /// The environment-configured default engine was already set up in
    /// this process.
    AlreadyInitialized,

    Io(io::Error),
}

impl std::error::Error for SetupError {}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "engine already set up"),
            Self::Io(e) => write!(f, "I/O error during setup: {e}"),
        }
    }
}

impl From<io::Error> for SetupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
