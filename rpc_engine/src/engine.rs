// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The engine context: registries, bundling buffer, transport handles,
//! and the operations generated stubs call. The event loop lives in the
//! sibling `event` module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::*;
use mio::{Events, Poll};

use mcast_transport::multicast;
use mcast_transport::{NodeId, PubEvent, Publisher, SubEvent, Subscriber, Transport, TransportError};

use crate::buffer::PayloadBuffer;
use crate::codec::{self, Identifier, ParseOutcome, WireId};
use crate::config::Config;
use crate::poll::{PollSink, Side};
use crate::registry::{CallbackTable, ClientTable, ServerTable};
use crate::remote::RemoteMap;
use crate::{CallbackRef, ClientStub, Invocation, QueueError, SetupError};

pub use crate::registry::Services;

/// Outbound queueing stops once this many packets are in flight...
const SUSPEND_TRAFFIC_THRESHOLD: usize = 3000;
/// ...and resumes only after draining below this, so the suspend state
/// cannot flap at the boundary.
const RESTART_TRAFFIC_THRESHOLD: usize = 2800;

/// How often a peer that needs inbound invocations solicits subscribers.
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(200);

/// Guards the environment-configured default setup path; explicit
/// contexts built with `setup_full` are unrestricted.
static DEFAULT_ENGINE_UP: AtomicBool = AtomicBool::new(false);

/// One peer's RPC engine. `T` is application state threaded through
/// every dispatch.
///
/// Not internally synchronized: the event loop, the registries, and the
/// bundling buffer all assume a single caller at a time.
pub struct Engine<T> {
    pub(crate) poll: Poll,
    pub(crate) events: Events,
    pub(crate) publisher: Box<dyn Publisher + Send>,
    pub(crate) subscriber: Box<dyn Subscriber + Send>,
    pub(crate) servers: ServerTable<T>,
    pub(crate) clients: ClientTable,
    pub(crate) callbacks: CallbackTable<T>,
    pub(crate) remotes: RemoteMap,
    pub(crate) payload: PayloadBuffer,
    pub(crate) buffered: bool,
    pub(crate) announcing: bool,
    pub(crate) state: T,
}

impl<T> Engine<T> {
    /// Set up the process-wide default engine: configuration from the
    /// environment, multicast transport, private readiness facility.
    /// A second call reports `AlreadyInitialized`.
    pub fn setup(services: Services<T>, state: T) -> Result<Self, SetupError> {
        claim_default()?;
        let config = Config::from_env();
        Self::build(&config, None, services, state)
    }

    /// Like `setup`, but registering transport sockets with a
    /// caller-provided mio `Poll` instead of creating one.
    pub fn setup_with_poll(poll: Poll, services: Services<T>, state: T) -> Result<Self, SetupError> {
        claim_default()?;
        let config = Config::from_env();
        Self::build(&config, Some(poll), services, state)
    }

    /// Fully explicit setup: every parameter supplied, including the
    /// transport. Builds as many engines as the caller wants.
    pub fn setup_full(
        config: &Config,
        transport: Transport,
        services: Services<T>,
        state: T,
    ) -> Result<Self, SetupError> {
        init_logging(config);
        Self::assemble(transport, None, services, state)
    }

    fn build(
        config: &Config,
        poll: Option<Poll>,
        services: Services<T>,
        state: T,
    ) -> Result<Self, SetupError> {
        init_logging(config);
        let transport = multicast::transport(&config.transport_config())?;
        Self::assemble(transport, poll, services, state)
    }

    fn assemble(
        transport: Transport,
        poll: Option<Poll>,
        services: Services<T>,
        state: T,
    ) -> Result<Self, SetupError> {
        let poll = match poll {
            Some(poll) => poll,
            None => Poll::new()?,
        };

        let Transport {
            mut publisher,
            mut subscriber,
        } = transport;

        publisher.set_throttling(SUSPEND_TRAFFIC_THRESHOLD, RESTART_TRAFFIC_THRESHOLD);

        // A peer with client functions needs servers to subscribe to it
        // before its invocations can reach anyone; a pure server stays
        // quiet. Arming a callback later also turns announcing on.
        let announcing = !services.clients.is_empty();
        if announcing {
            debug!(
                "{} client function(s) declared; enabling announcements",
                services.clients.len()
            );
            publisher.set_announce_interval(Some(ANNOUNCE_INTERVAL));
        }

        let capacity = publisher.max_payload();

        {
            let registry = poll.registry();
            publisher.activate(&mut PollSink { registry, side: Side::Pub })?;
            subscriber.activate(&mut PollSink { registry, side: Side::Sub })?;
        }

        info!(
            "Engine up: node 0x{:X}, {} server function(s)",
            publisher.node_id(),
            services.servers.len()
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            publisher,
            subscriber,
            servers: ServerTable::new(services.servers),
            clients: ClientTable::new(services.clients),
            callbacks: CallbackTable::new(),
            remotes: RemoteMap::new(),
            payload: PayloadBuffer::new(capacity),
            buffered: false,
            announcing,
            state,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.publisher.node_id()
    }

    pub fn get_socket_count(&self) -> usize {
        self.publisher.socket_count() + self.subscriber.socket_count()
    }

    /// The configured announce cadence, None for a peer that has no
    /// reason to solicit subscribers.
    pub fn announce_interval(&self) -> Option<Duration> {
        self.publisher.announce_interval()
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }

    /// Enqueue a named invocation for every remote peer implementing
    /// `name`.
    pub fn queue_func(&mut self, name: &str, args: &[u8]) -> Result<(), QueueError> {
        if name.is_empty() || name.contains('\0') {
            return Err(QueueError::InvalidIdentifier);
        }
        self.queue(WireId::Name(name), args)
    }

    /// Enqueue a callback invocation addressed at the peer that armed
    /// `reference`.
    pub fn queue_callback(&mut self, reference: CallbackRef, args: &[u8]) -> Result<(), QueueError> {
        if reference.as_u64() == 0 {
            return Err(QueueError::InvalidIdentifier);
        }
        self.queue(WireId::Callback(reference.as_u64()), args)
    }

    fn queue(&mut self, id: WireId, args: &[u8]) -> Result<(), QueueError> {
        let need = codec::record_len(&id, args.len());
        let node_id = self.publisher.node_id();

        let Some(region) = self.payload.alloc(need) else {
            debug!(
                "Payload buffer full ({} bytes in use, {} needed); caller must run the event loop",
                self.payload.in_use(),
                need
            );
            return Err(QueueError::Busy);
        };

        codec::encode_record(region, node_id, &id, args);

        // Unbuffered operation pushes immediately for low latency on
        // single calls; buffered operation leaves bundling to the event
        // loop so many calls share one packet.
        if !self.buffered {
            self.flush_pending_calls();
        }

        Ok(())
    }

    /// Toggle buffered operation. Off (the default) pushes after every
    /// enqueue; on defers to the event loop.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Hand the buffered records to the transport as a single packet,
    /// unless traffic is suspended or there is nothing to send.
    pub(crate) fn flush_pending_calls(&mut self) {
        if self.payload.is_empty() || self.publisher.traffic_suspended() {
            return;
        }

        let packet = self.payload.bytes().to_vec();
        let len = packet.len();
        let registry = self.poll.registry();

        match self
            .publisher
            .queue_packet(packet, &mut PollSink { registry, side: Side::Pub })
        {
            Ok(()) => {
                trace!("Queued {len} bytes from payload buffer");
                self.payload.reset();
            }
            // Raced into suspension; keep accumulating.
            Err(TransportError::Suspended) => {}
            Err(e) => panic!("Failed to queue packet: {e}"),
        }
    }

    /// Arm a one-shot continuation and mint the reference a remote peer
    /// will use to invoke it.
    pub fn activate_callback(
        &mut self,
        dispatch: impl FnOnce(&Invocation, &mut T) + Send + 'static,
    ) -> CallbackRef {
        let reference = self.callbacks.activate(Box::new(dispatch));

        if !self.announcing {
            debug!("First callback armed; enabling announcements");
            self.publisher.set_announce_interval(Some(ANNOUNCE_INTERVAL));
            self.announcing = true;
        }

        reference
    }

    /// Disarm a callback. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel_callback(&mut self, reference: CallbackRef) -> bool {
        self.callbacks.take(reference).is_some()
    }

    /// Is the declared client function implemented by any reachable
    /// peer?
    pub fn remote_function_available(&self, stub: ClientStub) -> bool {
        match self.clients.name_of(stub) {
            Some(name) => self.remotes.available_by_name(name),
            None => false,
        }
    }

    pub fn remote_function_available_by_name(&self, name: &str) -> bool {
        self.remotes.available_by_name(name)
    }

    /// Dispatch every invocation record bundled in one inbound packet.
    pub(crate) fn process_packet(&mut self, payload: &[u8]) {
        let mut ind = 0;
        while ind < payload.len() {
            ind += self.process_call(&payload[ind..]);
        }
    }

    /// Dispatch the record at the front of `data`, returning how many
    /// bytes it occupied.
    fn process_call(&mut self, data: &[u8]) -> usize {
        let (outcome, consumed) = codec::parse_record(data);
        let ParseOutcome::Call(record) = outcome else {
            return consumed;
        };

        match record.identifier {
            Identifier::Named(name) => match self.servers.find(name) {
                Some(dispatch) => {
                    trace!(
                        "Local call: node 0x{:X} name [{name}] args {} byte(s)",
                        record.node_id,
                        record.args.len()
                    );
                    let invocation = Invocation {
                        caller: record.node_id,
                        name,
                        callback: None,
                        args: record.args,
                    };
                    dispatch(&invocation, &mut self.state);
                }
                None => debug!("Function [{name}] not loaded. Ignored"),
            },
            Identifier::Callback(raw) => {
                let reference = CallbackRef::from_raw(raw);
                match self.callbacks.take(reference) {
                    Some(dispatch) => {
                        let invocation = Invocation {
                            caller: record.node_id,
                            name: "",
                            callback: Some(reference),
                            args: record.args,
                        };
                        dispatch(&invocation, &mut self.state);
                    }
                    None => debug!("Callback [0x{raw:X}] not armed. Ignored"),
                }
            }
        }

        consumed
    }

    pub(crate) fn handle_pub_events(&mut self, events: Vec<PubEvent>) {
        for event in events {
            match event {
                PubEvent::ControlMessage { peer, payload } => {
                    match codec::parse_control(&payload) {
                        Some((node_id, name)) => self.remotes.register(node_id, name),
                        None => warn!("Unparseable control message from node 0x{peer:X}"),
                    }
                }
                PubEvent::SubscriberDisconnect { peer } => self.remotes.unregister_peer(peer),
            }
        }
    }

    pub(crate) fn handle_sub_events(&mut self, events: Vec<SubEvent>) {
        for event in events {
            match event {
                SubEvent::PacketReady { payload } => self.process_packet(&payload),
                SubEvent::SubscriptionComplete { peer } => self.advertise_functions(peer),
            }
        }
    }

    /// A control link to a publisher just came up: tell it which
    /// functions this peer can execute, one control message each.
    fn advertise_functions(&mut self, peer: NodeId) {
        debug!("Subscription to 0x{peer:X} complete. Sending supported functions");

        let node_id = self.publisher.node_id();
        let registry = self.poll.registry();

        for name in self.servers.names() {
            trace!("  [{name}]");
            let message = codec::encode_control(node_id, name);
            let sink = &mut PollSink { registry, side: Side::Sub };
            if let Err(e) = self.subscriber.write_control_message(peer, &message, sink) {
                warn!("Could not advertise [{name}] to node 0x{peer:X}: {e}");
            }
        }
    }
}

fn claim_default() -> Result<(), SetupError> {
    if DEFAULT_ENGINE_UP.swap(true, Ordering::SeqCst) {
        return Err(SetupError::AlreadyInitialized);
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let _ = env_logger::Builder::new()
        .filter_level(config.log_level)
        .try_init();
}
