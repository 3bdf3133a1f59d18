// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The engine's main loop: wait for readiness or a transport timer,
//! route each ready descriptor to the publisher or subscriber side
//! named by its token, process timer expiries, and keep the bundling
//! buffer flowing.

use std::io;
use std::time::{Duration, Instant};

use log::*;
use mio::Token;

use crate::engine::Engine;
use crate::poll::{self, PollSink, Side};

/// What one event-loop pass accomplished.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tick {
    /// At least one descriptor was ready and has been dispatched.
    Ready,

    /// Nothing was ready before the wait ended.
    TimedOut,
}

impl<T> Engine<T> {
    /// Block on the readiness facility for up to `timeout` (None blocks
    /// indefinitely), dispatch whatever became ready, then process any
    /// transport timer that has come due and attempt a buffer flush.
    pub fn process_single_event(&mut self, timeout: Option<Duration>) -> Tick {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("Readiness wait failed: {e}"),
            }
        }

        // Hang-up and error conditions surface as read/write attempts
        // that fail; the loop never interprets them directly.
        let mut ready = Vec::new();
        for event in self.events.iter() {
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed();
            ready.push((event.token(), readable, writable));
        }

        let had_events = !ready.is_empty();
        for (token, readable, writable) in ready {
            self.dispatch_ready(token, readable, writable);
        }

        if self.get_timeout_ms() == 0 {
            self.process_timeout();
        }

        self.flush_pending_calls();

        if had_events {
            Tick::Ready
        } else {
            Tick::TimedOut
        }
    }

    /// Drive the loop against a caller deadline. `Some(ZERO)` is a
    /// single non-blocking pass; `None` loops forever. Each pass waits
    /// the shorter of the remaining deadline and the next transport
    /// timer, and `TimedOut` is returned only when the caller's deadline
    /// expired, never because an internal timer fired first.
    pub fn process_events(&mut self, timeout: Option<Duration>) -> Tick {
        if timeout == Some(Duration::ZERO) {
            return self.process_single_event(Some(Duration::ZERO));
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Tick::TimedOut;
                }
            }

            let caller_rel = deadline.map(|d| d.saturating_duration_since(now));
            let event_rel = match self.get_timeout_ms() {
                -1 => None,
                ms => Some(Duration::from_millis(ms as u64)),
            };

            let (wait, caller_is_shorter) = match (caller_rel, event_rel) {
                (None, None) => (None, false),
                (None, Some(event)) => (Some(event), false),
                (Some(caller), None) => (Some(caller), true),
                (Some(caller), Some(event)) => {
                    if event < caller {
                        (Some(event), false)
                    } else {
                        (Some(caller), true)
                    }
                }
            };

            if self.process_single_event(wait) == Tick::TimedOut && caller_is_shorter {
                return Tick::TimedOut;
            }
        }
    }

    /// Non-blocking passes until a pass finds nothing ready.
    pub fn process_pending_events(&mut self) {
        while self.process_single_event(Some(Duration::ZERO)) == Tick::Ready {}
    }

    /// Milliseconds until the earliest transport timer over both sides,
    /// 0 if it already passed, -1 if neither side has one pending.
    pub fn get_timeout_ms(&self) -> i64 {
        let next = match (self.publisher.next_timeout(), self.subscriber.next_timeout()) {
            (None, None) => return -1,
            (Some(t), None) | (None, Some(t)) => t,
            (Some(a), Some(b)) => a.min(b),
        };

        let now = Instant::now();
        if next <= now {
            0
        } else {
            (next - now).as_millis() as i64 + 1
        }
    }

    fn process_timeout(&mut self) {
        let registry = self.poll.registry();

        // Failures here are transient; the work is retried on the next
        // pass.
        let sink = &mut PollSink { registry, side: Side::Pub };
        if let Err(e) = self.publisher.process_timeout(sink) {
            debug!("Publisher timeout processing: {e}");
        }

        let sink = &mut PollSink { registry, side: Side::Sub };
        if let Err(e) = self.subscriber.process_timeout(sink) {
            debug!("Subscriber timeout processing: {e}");
        }
    }

    fn dispatch_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let (side, index) = poll::split(token);
        trace!(
            "{side:?} socket {index}:{}{}",
            if readable { " read" } else { "" },
            if writable { " write" } else { "" }
        );

        match side {
            Side::Pub => {
                let mut events = Vec::new();
                {
                    let registry = self.poll.registry();

                    if readable {
                        let sink = &mut PollSink { registry, side: Side::Pub };
                        if let Err(e) = self.publisher.read(index, sink, &mut events) {
                            warn!("Publisher read error on socket {index}: {e}");
                            let sink = &mut PollSink { registry, side: Side::Pub };
                            self.publisher.close_connection(index, sink, &mut events);
                        }
                    }

                    if writable {
                        let sink = &mut PollSink { registry, side: Side::Pub };
                        if let Err(e) = self.publisher.write(index, sink) {
                            warn!("Publisher write error on socket {index}: {e}");
                            let sink = &mut PollSink { registry, side: Side::Pub };
                            self.publisher.close_connection(index, sink, &mut events);
                        }
                    }
                }
                self.handle_pub_events(events);
            }
            Side::Sub => {
                let mut events = Vec::new();
                {
                    let registry = self.poll.registry();

                    if readable {
                        let sink = &mut PollSink { registry, side: Side::Sub };
                        if let Err(e) = self.subscriber.read(index, sink, &mut events) {
                            warn!("Subscriber read error on socket {index}: {e}");
                            let sink = &mut PollSink { registry, side: Side::Sub };
                            self.subscriber.close_connection(index, sink);
                        }
                    }

                    if writable {
                        let sink = &mut PollSink { registry, side: Side::Sub };
                        if let Err(e) = self.subscriber.write(index, sink, &mut events) {
                            warn!("Subscriber write error on socket {index}: {e}");
                            let sink = &mut PollSink { registry, side: Side::Sub };
                            self.subscriber.close_connection(index, sink);
                        }
                    }
                }
                self.handle_sub_events(events);
            }
        }
    }
}
