// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! One engine talking to itself over the real multicast transport:
//! announce, subscribe back to its own control port, advertise, invoke.
//! Ignored by default because it needs a multicast-capable interface.

use std::time::Duration;

use rpc_engine::config::Config;
use rpc_engine::transport::multicast::{self, McastConfig};
use rpc_engine::{Engine, Invocation, Services};

fn echo_server(inv: &Invocation, state: &mut Vec<u8>) {
    state.extend_from_slice(inv.args);
}

#[test]
#[ignore = "needs a multicast-capable network environment"]
fn multicast_loopback_end_to_end() {
    let transport = multicast::transport(&McastConfig::default()).unwrap();

    let mut services = Services::new();
    services.add_server("echo", echo_server);
    let stub = services.add_client("echo");

    let mut engine =
        Engine::setup_full(&Config::default(), transport, services, Vec::new()).unwrap();

    for _ in 0..2000 {
        if engine.remote_function_available(stub) {
            break;
        }
        engine.process_events(Some(Duration::from_millis(5)));
    }
    assert!(engine.remote_function_available(stub));

    engine.queue_func("echo", b"over the wire").unwrap();

    for _ in 0..2000 {
        if !engine.state().is_empty() {
            break;
        }
        engine.process_events(Some(Duration::from_millis(5)));
    }
    assert_eq!(engine.state().as_slice(), b"over the wire");
}
