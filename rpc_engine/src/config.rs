// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Engine configuration, optionally read from the environment. Every
//! option has a default; an unparseable value is logged and the default
//! kept, so a bad environment can degrade behavior but never abort
//! startup.

use std::env;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use log::*;

use mcast_transport::multicast::McastConfig;
use mcast_transport::NodeId;

pub const ENV_NODE_ID: &str = "MCRPC_NODE_ID";
pub const ENV_MAX_NODES: &str = "MCRPC_MAX_NODES";
pub const ENV_MCAST_GROUP_ADDR: &str = "MCRPC_MCAST_GROUP_ADDR";
pub const ENV_MCAST_GROUP_PORT: &str = "MCRPC_MCAST_GROUP_PORT";
pub const ENV_MCAST_IFACE_ADDR: &str = "MCRPC_MCAST_IFACE_ADDR";
pub const ENV_MCAST_TTL: &str = "MCRPC_MCAST_TTL";
pub const ENV_CONTROL_LISTEN_IFACE: &str = "MCRPC_CONTROL_LISTEN_IFACE";
pub const ENV_CONTROL_LISTEN_PORT: &str = "MCRPC_CONTROL_LISTEN_PORT";
pub const ENV_LOG_LEVEL: &str = "MCRPC_LOG_LEVEL";

#[derive(Clone, Debug)]
pub struct Config {
    /// This peer's node id; 0 lets the transport allocate one.
    pub node_id: NodeId,

    /// Upper bound on concurrently attached peers.
    pub max_nodes: usize,

    pub mcast_group_addr: Ipv4Addr,
    pub mcast_group_port: u16,

    /// Interface for multicast send and group join; unspecified means
    /// the routing default.
    pub mcast_iface_addr: Ipv4Addr,

    pub mcast_ttl: u32,

    pub control_listen_iface_addr: Ipv4Addr,

    /// 0 picks an ephemeral port, advertised through announcements.
    pub control_listen_port: u16,

    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            max_nodes: 32,
            mcast_group_addr: Ipv4Addr::new(239, 40, 41, 42),
            mcast_group_port: 4723,
            mcast_iface_addr: Ipv4Addr::UNSPECIFIED,
            mcast_ttl: 1,
            control_listen_iface_addr: Ipv4Addr::UNSPECIFIED,
            control_listen_port: 0,
            log_level: LevelFilter::Error,
        }
    }
}

impl Config {
    /// Defaults overridden by whatever `MCRPC_*` variables are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        parse_var(ENV_NODE_ID, &mut config.node_id);
        parse_var(ENV_MAX_NODES, &mut config.max_nodes);
        parse_var(ENV_MCAST_GROUP_ADDR, &mut config.mcast_group_addr);
        parse_var(ENV_MCAST_GROUP_PORT, &mut config.mcast_group_port);
        parse_var(ENV_MCAST_IFACE_ADDR, &mut config.mcast_iface_addr);
        parse_var(ENV_MCAST_TTL, &mut config.mcast_ttl);
        parse_var(ENV_CONTROL_LISTEN_IFACE, &mut config.control_listen_iface_addr);
        parse_var(ENV_CONTROL_LISTEN_PORT, &mut config.control_listen_port);
        parse_var(ENV_LOG_LEVEL, &mut config.log_level);

        config
    }

    pub(crate) fn transport_config(&self) -> McastConfig {
        McastConfig {
            node_id: self.node_id,
            max_peers: self.max_nodes,
            group: SocketAddrV4::new(self.mcast_group_addr, self.mcast_group_port),
            iface: self.mcast_iface_addr,
            ttl: self.mcast_ttl,
            listen_iface: self.control_listen_iface_addr,
            listen_port: self.control_listen_port,
        }
    }
}

fn parse_var<V>(name: &str, value: &mut V)
where
    V: FromStr,
    V::Err: fmt::Display,
{
    let Ok(raw) = env::var(name) else {
        return;
    };

    match raw.parse() {
        Ok(parsed) => *value = parsed,
        Err(e) => warn!("Ignoring {name}={raw}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.node_id, 0);
        assert!(config.mcast_group_addr.is_multicast());
        assert_eq!(config.control_listen_port, 0);
        assert_eq!(config.log_level, LevelFilter::Error);
    }
}
