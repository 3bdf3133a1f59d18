// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Adapter between the transport's interest callbacks and the mio
//! registry. Each registration is tagged with a token carrying the
//! transport's socket index in the low bits and the side (publisher or
//! subscriber) in bit 31, so ready events route straight back to the
//! owning context.

use std::os::fd::RawFd;

use log::*;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use mcast_transport::{InterestSink, PollAction, SocketIndex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Side {
    Pub,
    Sub,
}

const PUB_BIT: usize = 1 << 31;
const INDEX_MASK: usize = PUB_BIT - 1;

pub(crate) fn token(side: Side, index: SocketIndex) -> Token {
    debug_assert!(index <= INDEX_MASK);
    match side {
        Side::Pub => Token(index | PUB_BIT),
        Side::Sub => Token(index),
    }
}

pub(crate) fn split(token: Token) -> (Side, SocketIndex) {
    if token.0 & PUB_BIT != 0 {
        (Side::Pub, token.0 & INDEX_MASK)
    } else {
        (Side::Sub, token.0 & INDEX_MASK)
    }
}

fn interest(action: PollAction) -> Option<Interest> {
    match (action.read, action.write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// One side's view of the engine's registry, handed to every transport
/// entry point that may change socket interest.
pub(crate) struct PollSink<'a> {
    pub registry: &'a Registry,
    pub side: Side,
}

impl InterestSink for PollSink<'_> {
    // A socket the readiness facility cannot track leaves the process in
    // a state it cannot recover from.
    fn add(&mut self, fd: RawFd, index: SocketIndex, action: PollAction) {
        let Some(interest) = interest(action) else {
            warn!("Registration of fd {fd} with empty interest ignored");
            return;
        };

        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), token(self.side, index), interest)
        {
            panic!("Readiness registration failed for fd {fd} index {index}: {e}");
        }
    }

    fn modify(&mut self, fd: RawFd, index: SocketIndex, old: PollAction, new: PollAction) {
        if old == new {
            return;
        }

        let Some(interest) = interest(new) else {
            self.remove(fd, index);
            return;
        };

        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&fd), token(self.side, index), interest)
        {
            panic!("Readiness modification failed for fd {fd} index {index}: {e}");
        }
    }

    fn remove(&mut self, fd: RawFd, index: SocketIndex) {
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            warn!("Readiness deregistration failed for fd {fd} index {index}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        assert_eq!(split(token(Side::Pub, 0)), (Side::Pub, 0));
        assert_eq!(split(token(Side::Sub, 0)), (Side::Sub, 0));
        assert_eq!(split(token(Side::Pub, 12345)), (Side::Pub, 12345));
        assert_eq!(split(token(Side::Sub, INDEX_MASK)), (Side::Sub, INDEX_MASK));
    }
}
