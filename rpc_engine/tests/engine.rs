// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Whole-engine scenarios over the in-process pair transport: two (or
//! one) engines wired through socketpairs, driven by interleaving their
//! event loops on the test thread.

use std::time::Duration;

use rpc_engine::config::Config;
use rpc_engine::transport::pair;
use rpc_engine::{CallbackRef, Engine, Invocation, QueueError, Services, SetupError};

const STEP: Duration = Duration::from_millis(1);

/// Interleave two engines until `done` holds or the pass limit runs
/// out.
fn drive_until<A, B>(
    a: &mut Engine<A>,
    b: &mut Engine<B>,
    passes: usize,
    mut done: impl FnMut(&Engine<A>, &Engine<B>) -> bool,
) -> bool {
    for _ in 0..passes {
        if done(a, b) {
            return true;
        }
        a.process_events(Some(STEP));
        b.process_events(Some(STEP));
    }
    done(a, b)
}

#[derive(Default)]
struct Loopback {
    name: Option<String>,
    age: Option<i32>,
}

fn loopback_server(inv: &Invocation, state: &mut Loopback) {
    let field = &inv.args[..32];
    let nul = field.iter().position(|&b| b == 0).unwrap_or(32);
    state.name = Some(String::from_utf8_lossy(&field[..nul]).into_owned());
    state.age = Some(i32::from_le_bytes(inv.args[32..36].try_into().unwrap()));
}

#[test]
fn loopback_call_reaches_local_server() {
    let mut transports = pair::mesh(&[100]).unwrap();
    let transport = transports.pop().unwrap();

    let mut services = Services::new();
    services.add_server("loopback", loopback_server);
    let stub = services.add_client("loopback");

    let mut engine =
        Engine::setup_full(&Config::default(), transport, services, Loopback::default()).unwrap();

    assert_eq!(engine.node_id(), 100);
    assert!(engine.get_socket_count() > 0);

    for _ in 0..200 {
        if engine.remote_function_available(stub) {
            break;
        }
        engine.process_events(Some(STEP));
    }
    assert!(engine.remote_function_available(stub));

    let mut args = [0u8; 36];
    args[..9].copy_from_slice(b"Bob Smith");
    args[32..].copy_from_slice(&25i32.to_le_bytes());
    engine.queue_func("loopback", &args).unwrap();

    for _ in 0..200 {
        if engine.state().age.is_some() {
            break;
        }
        engine.process_events(Some(STEP));
    }

    assert_eq!(engine.state().name.as_deref(), Some("Bob Smith"));
    assert_eq!(engine.state().age, Some(25));
}

#[derive(Default)]
struct Observed {
    values: Vec<i32>,
    done: bool,
}

fn set_value(inv: &Invocation, state: &mut Observed) {
    let value = i32::from_le_bytes(inv.args[..4].try_into().unwrap());
    if value == -1 {
        state.done = true;
    } else {
        state.values.push(value);
    }
}

/// Buffered-mode stress: a burst of calls must arrive complete and in
/// order, bundled however the engine saw fit.
#[test]
fn buffered_calls_arrive_in_order_without_gaps() {
    const COUNT: i32 = 10_000;

    let (ta, tb) = pair::pair(1, 2).unwrap();

    let mut client_services: Services<()> = Services::new();
    let stub = client_services.add_client("set_value");
    let mut client = Engine::setup_full(&Config::default(), ta, client_services, ()).unwrap();

    let mut server_services = Services::new();
    server_services.add_server("set_value", set_value);
    let mut server =
        Engine::setup_full(&Config::default(), tb, server_services, Observed::default()).unwrap();

    assert!(drive_until(&mut client, &mut server, 200, |c, _| {
        c.remote_function_available(stub)
    }));

    client.set_buffered(true);
    for value in 0..COUNT {
        loop {
            match client.queue_func("set_value", &value.to_le_bytes()) {
                Ok(()) => break,
                Err(QueueError::Busy) => {
                    client.process_events(Some(STEP));
                    server.process_events(Some(STEP));
                }
                Err(e) => panic!("queue_func: {e}"),
            }
        }
    }

    client.set_buffered(false);
    loop {
        match client.queue_func("set_value", &(-1i32).to_le_bytes()) {
            Ok(()) => break,
            Err(QueueError::Busy) => {
                client.process_events(Some(STEP));
                server.process_events(Some(STEP));
            }
            Err(e) => panic!("queue_func: {e}"),
        }
    }

    assert!(drive_until(&mut client, &mut server, 2000, |_, s| s.state().done));

    let values = &server.state().values;
    assert_eq!(values.len(), COUNT as usize);
    for (expected, &got) in values.iter().enumerate() {
        assert_eq!(got, expected as i32);
    }
}

fn noop_server(_inv: &Invocation, _state: &mut ()) {}

#[test]
fn departed_peer_functions_become_unavailable() {
    let (ta, tb) = pair::pair(1, 2).unwrap();

    let mut watcher = Engine::setup_full(&Config::default(), ta, Services::new(), ()).unwrap();

    let mut services = Services::new();
    services.add_server("foo", noop_server);
    let mut provider = Engine::setup_full(&Config::default(), tb, services, ()).unwrap();

    assert!(drive_until(&mut watcher, &mut provider, 200, |w, _| {
        w.remote_function_available_by_name("foo")
    }));

    drop(provider);

    for _ in 0..200 {
        if !watcher.remote_function_available_by_name("foo") {
            break;
        }
        watcher.process_events(Some(STEP));
    }
    assert!(!watcher.remote_function_available_by_name("foo"));
}

#[derive(Default)]
struct Requests {
    pending: Vec<(u64, Vec<u8>)>,
}

fn greet_server(inv: &Invocation, state: &mut Requests) {
    let reference = u64::from_le_bytes(inv.args[..8].try_into().unwrap());
    state.pending.push((reference, inv.args[8..].to_vec()));
}

#[derive(Default)]
struct Replies {
    fired: u32,
    payloads: Vec<Vec<u8>>,
}

/// A callback reference embedded in the request payload comes back as a
/// callback-form invocation, fires the armed continuation exactly once,
/// and a replay of the same reference is dropped.
#[test]
fn callback_fires_once_and_replay_is_dropped() {
    let (ta, tb) = pair::pair(1, 2).unwrap();

    let mut client_services: Services<Replies> = Services::new();
    let stub = client_services.add_client("greet");
    let mut client =
        Engine::setup_full(&Config::default(), ta, client_services, Replies::default()).unwrap();

    let mut server_services = Services::new();
    server_services.add_server("greet", greet_server);
    let mut server =
        Engine::setup_full(&Config::default(), tb, server_services, Requests::default()).unwrap();

    assert!(drive_until(&mut client, &mut server, 200, |c, _| {
        c.remote_function_available(stub)
    }));

    let reference = client.activate_callback(|inv: &Invocation, state: &mut Replies| {
        state.fired += 1;
        state.payloads.push(inv.args.to_vec());
    });

    let mut request = reference.as_u64().to_le_bytes().to_vec();
    request.extend_from_slice(b"hello");
    client.queue_func("greet", &request).unwrap();

    assert!(drive_until(&mut client, &mut server, 200, |_, s| {
        !s.state().pending.is_empty()
    }));

    let (raw, payload) = server.state().pending[0].clone();
    assert_eq!(payload, b"hello");

    server.queue_callback(CallbackRef::from_raw(raw), b"pong").unwrap();
    assert!(drive_until(&mut client, &mut server, 200, |c, _| c.state().fired == 1));
    assert_eq!(client.state().payloads[0], b"pong");

    // Same reference again: the slot was cleared on first fire.
    server.queue_callback(CallbackRef::from_raw(raw), b"pong again").unwrap();
    drive_until(&mut client, &mut server, 50, |_, _| false);

    assert_eq!(client.state().fired, 1);
}

/// Sustained queueing with nobody draining trips transport suspension
/// first (the queue threshold), then fills the bundling buffer, and
/// only then does the facade push back with Busy. Running the event
/// loop recovers.
#[test]
fn back_pressure_reports_busy_then_recovers() {
    let mut transports = pair::mesh(&[9]).unwrap();
    let transport = transports.pop().unwrap();

    let mut services = Services::new();
    services.add_server("sink", noop_server);
    let mut engine = Engine::setup_full(&Config::default(), transport, services, ()).unwrap();

    let mut queued = 0usize;
    let hit_busy = loop {
        match engine.queue_func("sink", &[0u8; 32]) {
            Ok(()) => queued += 1,
            Err(QueueError::Busy) => break true,
            Err(e) => panic!("queue_func: {e}"),
        }
        if queued > 100_000 {
            break false;
        }
    };

    assert!(hit_busy);
    // Suspension engages at the packet threshold, well before the
    // bundling buffer can fill.
    assert!(queued >= 3000, "busy after only {queued} calls");

    let mut recovered = false;
    for _ in 0..500 {
        engine.process_events(Some(STEP));
        if engine.queue_func("sink", &[0u8; 32]).is_ok() {
            recovered = true;
            break;
        }
    }
    assert!(recovered);
}

#[test]
fn queueing_without_an_identifier_is_invalid() {
    let mut transports = pair::mesh(&[5]).unwrap();
    let transport = transports.pop().unwrap();

    let mut engine =
        Engine::setup_full(&Config::default(), transport, Services::<()>::new(), ()).unwrap();

    assert_eq!(engine.queue_func("", b"args"), Err(QueueError::InvalidIdentifier));
    assert_eq!(
        engine.queue_callback(CallbackRef::from_raw(0), b"args"),
        Err(QueueError::InvalidIdentifier)
    );
}

#[test]
fn pure_server_does_not_announce() {
    let mut transports = pair::mesh(&[21]).unwrap();
    let mut services = Services::new();
    services.add_server("quiet", noop_server);
    let mut engine =
        Engine::setup_full(&Config::default(), transports.pop().unwrap(), services, ()).unwrap();
    assert_eq!(engine.announce_interval(), None);

    // Arming a callback makes the peer a receiver and starts announcing.
    engine.activate_callback(|_inv: &Invocation, _state: &mut ()| {});
    assert!(engine.announce_interval().is_some());

    let mut transports = pair::mesh(&[22]).unwrap();
    let mut services: Services<()> = Services::new();
    services.add_client("chatty");
    let engine =
        Engine::setup_full(&Config::default(), transports.pop().unwrap(), services, ()).unwrap();
    assert!(engine.announce_interval().is_some());
}

#[test]
fn cancelled_callback_does_not_fire() {
    let mut transports = pair::mesh(&[31]).unwrap();
    let mut engine = Engine::setup_full(
        &Config::default(),
        transports.pop().unwrap(),
        Services::<u32>::new(),
        0u32,
    )
    .unwrap();

    let reference = engine.activate_callback(|_inv, state: &mut u32| *state += 1);
    assert!(engine.cancel_callback(reference));
    assert!(!engine.cancel_callback(reference));

    engine.queue_callback(reference, b"late").unwrap();
    for _ in 0..50 {
        engine.process_events(Some(STEP));
    }
    assert_eq!(*engine.state(), 0);
}

/// The environment-driven default setup may run once per process; the
/// second attempt reports busy no matter how the first one fared.
#[test]
fn default_setup_claims_the_process_slot_once() {
    let first = Engine::setup(Services::<()>::new(), ());
    let second = Engine::setup(Services::<()>::new(), ());

    assert!(matches!(second, Err(SetupError::AlreadyInitialized)));
    drop(first);
}
