// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Which functions are reachable remotely, and through which peers.
//! Populated from inbound control messages, pruned when a peer's control
//! link drops.

use log::*;

use crate::{NodeId, SYMBOL_TABLE_SIZE};

struct RemoteEntry {
    node_id: NodeId,
    name: String,
}

/// A multiset of (peer, function name) pairs. A peer appears once per
/// function it advertises. Departed peers leave empty slots behind which
/// later registrations reuse; no compaction.
pub(crate) struct RemoteMap {
    entries: Vec<Option<RemoteEntry>>,
}

impl RemoteMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(&mut self, node_id: NodeId, name: &str) {
        let duplicate = self
            .entries
            .iter()
            .flatten()
            .any(|e| e.node_id == node_id && e.name == name);
        if duplicate {
            warn!("Remote function [{name}] registered several times by node 0x{node_id:X}");
            return;
        }

        let entry = RemoteEntry {
            node_id,
            name: name.to_string(),
        };

        match self.entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(entry),
            None => {
                if self.entries.len() == SYMBOL_TABLE_SIZE {
                    panic!("Remote function table overflow: limit {SYMBOL_TABLE_SIZE}");
                }
                self.entries.push(Some(entry));
            }
        }

        info!("Remote [{name}] now supported by node 0x{node_id:X}");
    }

    /// Forget everything a departed peer advertised.
    pub fn unregister_peer(&mut self, node_id: NodeId) {
        for slot in &mut self.entries {
            if slot.as_ref().is_some_and(|e| e.node_id == node_id) {
                let entry = slot.take().unwrap();
                info!("Unregistering node 0x{node_id:X} function [{}]", entry.name);
            }
        }
    }

    pub fn available_by_name(&self, name: &str) -> bool {
        self.entries.iter().flatten().any(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_suppressed() {
        let mut map = RemoteMap::new();
        map.register(1, "foo");
        map.register(1, "foo");

        map.unregister_peer(1);
        assert!(!map.available_by_name("foo"));
    }

    #[test]
    fn availability_survives_while_any_peer_remains() {
        let mut map = RemoteMap::new();
        map.register(1, "foo");
        map.register(2, "foo");
        map.register(2, "bar");

        map.unregister_peer(2);
        assert!(map.available_by_name("foo"));
        assert!(!map.available_by_name("bar"));

        map.unregister_peer(1);
        assert!(!map.available_by_name("foo"));
    }

    #[test]
    fn cleared_slots_are_reused() {
        let mut map = RemoteMap::new();
        map.register(1, "foo");
        map.register(2, "bar");
        map.unregister_peer(1);

        map.register(3, "baz");
        assert_eq!(map.entries.len(), 2);
        assert!(map.available_by_name("baz"));
    }
}
