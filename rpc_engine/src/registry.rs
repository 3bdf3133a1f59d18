// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The three local symbol tables: server functions, client function
//! identities, and armed one-shot callbacks. All are bounded by
//! [`SYMBOL_TABLE_SIZE`] and searched linearly; they are small and, for
//! the first two, populated once before setup.

use log::*;

use crate::{CallbackFn, CallbackRef, ServerFn, MAX_NAME_LEN, SYMBOL_TABLE_SIZE};

/// Opaque identity of one declared client function, handed out by
/// [`Services::add_client`] and used only to ask whether the function is
/// available remotely.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClientStub(pub(crate) usize);

/// The startup list of local declarations an engine consumes on
/// construction. Generated stubs (or applications directly) fill one of
/// these in before calling setup.
pub struct Services<T> {
    pub(crate) servers: Vec<(String, ServerFn<T>)>,
    pub(crate) clients: Vec<String>,
}

impl<T> Default for Services<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Services<T> {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// Declare a server function callable by remote peers.
    pub fn add_server(&mut self, name: &str, dispatch: ServerFn<T>) {
        validate_name(name);
        if self.servers.len() == SYMBOL_TABLE_SIZE {
            panic!("Server function table overflow registering [{name}]: limit {SYMBOL_TABLE_SIZE}");
        }
        self.servers.push((name.to_string(), dispatch));
    }

    /// Declare a client function this process may invoke, returning its
    /// identity handle.
    pub fn add_client(&mut self, name: &str) -> ClientStub {
        validate_name(name);
        if self.clients.len() == SYMBOL_TABLE_SIZE {
            panic!("Client function table overflow registering [{name}]: limit {SYMBOL_TABLE_SIZE}");
        }
        self.clients.push(name.to_string());
        ClientStub(self.clients.len() - 1)
    }
}

/// A name that cannot be framed on the wire is a configuration error,
/// not a runtime condition.
fn validate_name(name: &str) {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || !name.is_ascii()
        || name.contains('\0')
    {
        panic!("Invalid function name [{name}]: need 1..={MAX_NAME_LEN} ASCII bytes, no NUL");
    }
}

pub(crate) struct ServerTable<T> {
    entries: Vec<(String, ServerFn<T>)>,
}

impl<T> ServerTable<T> {
    pub fn new(entries: Vec<(String, ServerFn<T>)>) -> Self {
        Self { entries }
    }

    pub fn find(&self, name: &str) -> Option<ServerFn<T>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, dispatch)| *dispatch)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

pub(crate) struct ClientTable {
    names: Vec<String>,
}

impl ClientTable {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_of(&self, stub: ClientStub) -> Option<&str> {
        self.names.get(stub.0).map(String::as_str)
    }
}

struct CallbackSlot<T> {
    generation: u32,
    dispatch: Option<CallbackFn<T>>,
}

/// Arena of armed one-shot callbacks. The reference handed to remote
/// peers is the slot index plus the slot's generation; taking the
/// dispatch clears the slot and the next arming of that slot bumps the
/// generation, so a replayed reference dies quietly.
pub(crate) struct CallbackTable<T> {
    slots: Vec<CallbackSlot<T>>,
}

impl<T> CallbackTable<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Arm a callback in the lowest free slot, extending the arena only
    /// when every slot is armed.
    pub fn activate(&mut self, dispatch: CallbackFn<T>) -> CallbackRef {
        if let Some(index) = self.slots.iter().position(|s| s.dispatch.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation = match slot.generation.wrapping_add(1) {
                0 => 1,
                generation => generation,
            };
            slot.dispatch = Some(dispatch);
            return CallbackRef::new(index as u32, slot.generation);
        }

        if self.slots.len() == SYMBOL_TABLE_SIZE {
            panic!("Callback table overflow: limit {SYMBOL_TABLE_SIZE}");
        }

        self.slots.push(CallbackSlot {
            generation: 1,
            dispatch: Some(dispatch),
        });
        CallbackRef::new(self.slots.len() as u32 - 1, 1)
    }

    /// One-shot retrieval: a hit clears the slot.
    pub fn take(&mut self, reference: CallbackRef) -> Option<CallbackFn<T>> {
        let (index, generation) = reference.split();
        let slot = self.slots.get_mut(index as usize)?;

        if slot.generation != generation {
            debug!("Stale callback reference [0x{:X}]", reference.as_u64());
            return None;
        }

        slot.dispatch.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Invocation;

    fn noop(_inv: &Invocation, _state: &mut u32) {}

    #[test]
    fn server_lookup_by_name() {
        let mut services: Services<u32> = Services::new();
        services.add_server("alpha", noop);
        services.add_server("beta", noop);

        let table = ServerTable::new(services.servers);
        assert!(table.find("beta").is_some());
        assert!(table.find("gamma").is_none());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    }

    #[test]
    #[should_panic]
    fn empty_name_is_rejected() {
        let mut services: Services<u32> = Services::new();
        services.add_server("", noop);
    }

    #[test]
    fn client_stub_resolves_to_its_name() {
        let mut services: Services<u32> = Services::new();
        let first = services.add_client("first");
        let second = services.add_client("second");

        let table = ClientTable::new(services.clients);
        assert_eq!(table.name_of(first), Some("first"));
        assert_eq!(table.name_of(second), Some("second"));
    }

    #[test]
    fn callback_fires_at_most_once() {
        let mut table: CallbackTable<u32> = CallbackTable::new();
        let reference = table.activate(Box::new(|_inv, state| *state += 1));

        assert!(table.take(reference).is_some());
        assert!(table.take(reference).is_none());
    }

    #[test]
    fn freed_slot_is_reused_with_a_new_generation() {
        let mut table: CallbackTable<u32> = CallbackTable::new();
        let first = table.activate(Box::new(|_, _| {}));
        let _second = table.activate(Box::new(|_, _| {}));

        assert!(table.take(first).is_some());

        let reused = table.activate(Box::new(|_, _| {}));
        let (index, generation) = reused.split();
        assert_eq!(index, 0);
        assert_eq!(generation, 2);

        // The old reference to slot 0 must no longer resolve.
        assert!(table.take(first).is_none());
        assert!(table.take(reused).is_some());
    }

    #[test]
    fn references_are_never_zero() {
        let mut table: CallbackTable<u32> = CallbackTable::new();
        let reference = table.activate(Box::new(|_, _| {}));
        assert_ne!(reference.as_u64(), 0);
    }
}
