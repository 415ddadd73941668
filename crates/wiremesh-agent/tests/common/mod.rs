// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ipnetwork::Ipv4Network;

use wiremesh_agent::AgentConfig;
use wiremesh_agent::device::Device;
use wiremesh_agent::firewall::{Firewall, FirewallError};
use wiremesh_agent::netlink::{
    InterfaceConfig, PeerConfig, PeerStats, Platform, PlatformError, RouteChanges, RouteTable,
};
use wiremesh_agent::reconcile::Context;
use wiremesh_store::MemoryStore;

// -- Platform --

#[derive(Debug, Clone, PartialEq)]
pub struct Iface {
    pub listen_port: u16,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub peers: BTreeMap<String, PeerConfig>,
}

#[derive(Debug, Default)]
struct PlatformState {
    interfaces: BTreeMap<String, Iface>,
    removed: Vec<String>,
    created: usize,
    resets: usize,
    upserts: usize,
    fail_writes: bool,
    routes: RouteTable,
}

impl PlatformState {
    fn route(&mut self, name: &str, changes: RouteChanges) {
        for net in changes.remove {
            self.routes.mark_removed(name, net);
        }
        for net in changes.add {
            self.routes.mark_installed(name, net);
        }
    }
}

/// Records what would have been programmed into WireGuard.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl MockPlatform {
    pub fn interfaces(&self) -> BTreeMap<String, Iface> {
        self.state.lock().unwrap().interfaces.clone()
    }

    pub fn interface(&self, name: &str) -> Option<Iface> {
        self.state.lock().unwrap().interfaces.get(name).cloned()
    }

    pub fn peer_keys(&self, name: &str) -> Vec<String> {
        self.interface(name)
            .map(|i| i.peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Routes installed through `name` beyond its connected network.
    pub fn routes(&self, name: &str) -> BTreeSet<Ipv4Network> {
        self.state.lock().unwrap().routes.installed(name)
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub fn upserts(&self) -> usize {
        self.state.lock().unwrap().upserts
    }

    /// Make every write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Pretend an interface survived from a previous run.
    pub fn preexisting(&self, name: &str, address: Ipv4Addr) {
        self.state.lock().unwrap().interfaces.insert(
            name.to_string(),
            Iface {
                listen_port: 0,
                address,
                prefix: 24,
                peers: BTreeMap::new(),
            },
        );
    }
}

fn injected() -> PlatformError {
    PlatformError::Interface("injected failure".into())
}

impl Platform for MockPlatform {
    async fn interface_exists(&self, name: &str) -> Result<bool, PlatformError> {
        Ok(self.state.lock().unwrap().interfaces.contains_key(name))
    }

    async fn create_interface(&self, config: &InterfaceConfig) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(injected());
        }
        state.created += 1;
        state.interfaces.insert(
            config.name.clone(),
            Iface {
                listen_port: config.listen_port,
                address: config.address,
                prefix: config.prefix,
                peers: config
                    .peers
                    .iter()
                    .map(|p| (p.public_key.clone(), p.clone()))
                    .collect(),
            },
        );
        state
            .routes
            .set_connected(&config.name, config.address, config.prefix);
        let changes = state.routes.replace_peers(&config.name, &config.peers);
        state.route(&config.name, changes);
        Ok(())
    }

    async fn remove_interface(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.interfaces.remove(name).is_some() {
            state.removed.push(name.to_string());
        }
        state.routes.remove_interface(name);
        Ok(())
    }

    async fn replace_peers(&self, name: &str, peers: &[PeerConfig]) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(injected());
        }
        state.resets += 1;
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| PlatformError::NoSuchInterface(name.to_string()))?;
        iface.peers = peers
            .iter()
            .map(|p| (p.public_key.clone(), p.clone()))
            .collect();
        let changes = state.routes.replace_peers(name, peers);
        state.route(name, changes);
        Ok(())
    }

    async fn upsert_peer(&self, name: &str, peer: &PeerConfig) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(injected());
        }
        state.upserts += 1;
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| PlatformError::NoSuchInterface(name.to_string()))?;
        iface.peers.insert(peer.public_key.clone(), peer.clone());
        let changes = state.routes.upsert_peer(name, peer);
        state.route(name, changes);
        Ok(())
    }

    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(injected());
        }
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| PlatformError::NoSuchInterface(name.to_string()))?;
        iface.peers.remove(public_key);
        let changes = state.routes.remove_peer(name, public_key);
        state.route(name, changes);
        Ok(())
    }

    async fn peer_stats(&self, name: &str) -> Result<Vec<PeerStats>, PlatformError> {
        let state = self.state.lock().unwrap();
        let iface = state
            .interfaces
            .get(name)
            .ok_or_else(|| PlatformError::NoSuchInterface(name.to_string()))?;
        Ok(iface
            .peers
            .keys()
            .map(|key| PeerStats {
                public_key: key.clone(),
                last_handshake: None,
                rx_bytes: 0,
                tx_bytes: 0,
            })
            .collect())
    }
}

// -- Firewall --

/// Keeps installed rules as readable strings.
#[derive(Debug, Clone, Default)]
pub struct MockFirewall {
    rules: Arc<Mutex<BTreeSet<String>>>,
}

impl MockFirewall {
    pub fn rules(&self) -> BTreeSet<String> {
        self.rules.lock().unwrap().clone()
    }
}

impl Firewall for MockFirewall {
    async fn install_masquerade(&self, iface: &str, subnet: Ipv4Network) -> Result<(), FirewallError> {
        self.rules
            .lock()
            .unwrap()
            .insert(format!("masquerade {iface} {subnet}"));
        Ok(())
    }

    async fn remove_masquerade(&self, iface: &str, subnet: Ipv4Network) -> Result<(), FirewallError> {
        self.rules
            .lock()
            .unwrap()
            .remove(&format!("masquerade {iface} {subnet}"));
        Ok(())
    }

    async fn install_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        self.rules
            .lock()
            .unwrap()
            .insert(format!("netmap {iface} {virt} {subnet}"));
        Ok(())
    }

    async fn remove_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        self.rules
            .lock()
            .unwrap()
            .remove(&format!("netmap {iface} {virt} {subnet}"));
        Ok(())
    }
}

// -- Helpers --

/// No STUN, OS-chosen ports, and short timeouts.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        server: "127.0.0.1:9".into(),
        stun_servers: Vec::new(),
        base_listen_port: 0,
        request_timeout_secs: 2,
        probe_timeout_ms: 200,
        stun_timeout_ms: 200,
        ..AgentConfig::default()
    }
}

pub fn context(
    device: &Device,
    platform: &MockPlatform,
    firewall: &MockFirewall,
    store: &MemoryStore,
) -> Context<MockPlatform, MockFirewall, MemoryStore> {
    Context::new(
        test_config(),
        device,
        Arc::new(platform.clone()),
        Arc::new(firewall.clone()),
        store.clone(),
    )
}

/// A syntactically valid key for a peer that is not this device.
pub fn key(seed: u8) -> String {
    BASE64.encode([seed; 32])
}

pub fn cidr(s: &str) -> Ipv4Network {
    s.parse().unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
