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

//! Relay and subnet-router transforms over a network's peer list.
//!
//! Both the server and the agent run these. The agent always rebuilds the
//! whole peer set from [`compute_peer_set`] when the shape of the mesh
//! changes; patching single entries after a relay or subnet change leaves
//! stale allowed-ips behind.

use std::collections::BTreeSet;

use ipnetwork::Ipv4Network;

use crate::error::MeshError;
use crate::model::{Network, NetworkPeer};

/// Keepalive interval for entries that go through a relay.
pub const RELAY_KEEPALIVE_SECS: u16 = 25;

/// One entry of a directly-routable peer set.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedPeer {
    /// The member this entry points at.
    pub peer: NetworkPeer,
    /// Routes to install for it.
    pub allowed_ips: Vec<Ipv4Network>,
    /// Persistent keepalive, if any.
    pub keepalive: Option<u16>,
}

/// The relay carrying `key`, computed from the authoritative relay sets.
pub fn relay_for<'a>(network: &'a Network, key: &str) -> Option<&'a NetworkPeer> {
    network
        .peers
        .iter()
        .find(|r| r.public_key != key && r.is_relay && r.relayed_peers.contains(key))
}

/// Whether some other member relays `key`.
pub fn is_relayed(network: &Network, key: &str) -> bool {
    relay_for(network, key).is_some()
}

/// Bring every member's stored `is_relayed` flag in line with the relay
/// sets. Returns the keys whose flag changed.
///
/// Every path that touches `is_relay` or `relayed_peers` must call this.
pub fn recompute_relayed(network: &mut Network) -> Vec<String> {
    let relayed: BTreeSet<String> = network
        .peers
        .iter()
        .filter(|r| r.is_relay)
        .flat_map(|r| {
            r.relayed_peers
                .iter()
                .filter(move |k| **k != r.public_key)
                .cloned()
        })
        .collect();

    let mut changed = Vec::new();
    for peer in &mut network.peers {
        let now = relayed.contains(&peer.public_key);
        if peer.is_relayed != now {
            peer.is_relayed = now;
            changed.push(peer.public_key.clone());
        }
    }
    changed
}

/// Check that making `relay` carry `relayed` keeps the relay graph one
/// level deep: no peer may be both relay and relayed.
pub fn validate_relay(
    network: &Network,
    relay: &str,
    relayed: &BTreeSet<String>,
) -> Result<(), MeshError> {
    let relay_peer = network.peer(relay).ok_or(MeshError::NotMember)?;

    if relayed.is_empty() {
        return Err(MeshError::InvalidRequest("relayed set is empty".into()));
    }
    if relayed.contains(relay) {
        return Err(MeshError::RelayConflict("a peer cannot relay itself".into()));
    }
    if is_relayed(network, relay) {
        return Err(MeshError::RelayConflict(format!("{relay} is itself relayed")));
    }

    for key in relayed {
        let peer = network.peer(key).ok_or(MeshError::NotMember)?;
        if peer.is_relay {
            return Err(MeshError::RelayConflict(format!("{key} is a relay")));
        }
        if let Some(other) = relay_for(network, key)
            && other.public_key != relay_peer.public_key
        {
            return Err(MeshError::RelayConflict(format!(
                "{key} is already relayed by {}",
                other.public_key
            )));
        }
    }
    Ok(())
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Check a subnet-router assignment against the network and every other
/// router in it.
pub fn validate_subnet_router(
    network: &Network,
    key: &str,
    subnet: Ipv4Network,
    virt_subnet: Option<Ipv4Network>,
) -> Result<(), MeshError> {
    if !network.contains(key) {
        return Err(MeshError::NotMember);
    }
    if let Some(virt) = virt_subnet
        && virt.prefix() != subnet.prefix()
    {
        return Err(MeshError::InvalidRequest(format!(
            "virtual subnet {virt} must have the same prefix length as {subnet}"
        )));
    }

    let advertised = virt_subnet.unwrap_or(subnet);
    if overlaps(advertised, network.cidr) {
        return Err(MeshError::SubnetInUse(advertised.to_string()));
    }

    for other in network.peers.iter().filter(|p| p.public_key != key) {
        if let Some(taken) = other.advertised_subnet()
            && overlaps(taken, advertised)
        {
            return Err(MeshError::SubnetInUse(advertised.to_string()));
        }
    }
    Ok(())
}

fn push_unique(routes: &mut Vec<Ipv4Network>, net: Ipv4Network) {
    if !routes.contains(&net) {
        routes.push(net);
    }
}

/// Routes to install for `peer` as seen by someone who is not relayed.
fn direct_routes(network: &Network, peer: &NetworkPeer, viewer: &str) -> Vec<Ipv4Network> {
    let mut routes = vec![peer.host_route()];
    if let Some(subnet) = peer.advertised_subnet() {
        push_unique(&mut routes, subnet);
    }
    if peer.is_relay {
        for key in &peer.relayed_peers {
            if key == viewer || key == &peer.public_key {
                continue;
            }
            if let Some(carried) = network.peer(key) {
                push_unique(&mut routes, carried.host_route());
                if let Some(subnet) = carried.advertised_subnet() {
                    push_unique(&mut routes, subnet);
                }
            }
        }
    }
    routes
}

/// The peer set `viewer` should program into its WireGuard interface.
///
/// A relayed viewer sees only its relay, routed for the whole network. Any
/// other viewer sees every member that is not relayed, plus the members it
/// relays itself; relays carry the `/32`s of their charges.
pub fn compute_peer_set(network: &Network, viewer: &str) -> Vec<RoutedPeer> {
    if let Some(relay) = relay_for(network, viewer) {
        let mut allowed_ips = vec![network.cidr];
        if let Some(subnet) = relay.advertised_subnet() {
            push_unique(&mut allowed_ips, subnet);
        }
        return vec![RoutedPeer {
            peer: relay.clone(),
            allowed_ips,
            keepalive: Some(RELAY_KEEPALIVE_SECS),
        }];
    }

    let my_charges = network
        .peer(viewer)
        .filter(|me| me.is_relay)
        .map(|me| &me.relayed_peers);

    network
        .peers
        .iter()
        .filter(|p| p.public_key != viewer)
        .filter(|p| {
            !is_relayed(network, &p.public_key)
                || my_charges.is_some_and(|charges| charges.contains(&p.public_key))
        })
        .map(|p| RoutedPeer {
            peer: p.clone(),
            allowed_ips: direct_routes(network, p, viewer),
            keepalive: p.is_relay.then_some(RELAY_KEEPALIVE_SECS),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const A: &str = "QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=";
    const B: &str = "QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkI=";
    const C: &str = "Q0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0M=";

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn lab() -> Network {
        let mut network = Network::new("lab", net("10.0.0.0/24"));
        network.upsert_peer(NetworkPeer::new(A, Ipv4Addr::new(10, 0, 0, 1)));
        network.upsert_peer(NetworkPeer::new(B, Ipv4Addr::new(10, 0, 0, 2)));
        network.upsert_peer(NetworkPeer::new(C, Ipv4Addr::new(10, 0, 0, 3)));
        network
    }

    fn make_relay(network: &mut Network, relay: &str, relayed: &[&str]) {
        let peer = network.peer_mut(relay).unwrap();
        peer.is_relay = true;
        peer.relayed_peers = relayed.iter().map(|k| k.to_string()).collect();
        recompute_relayed(network);
    }

    fn keys(set: &[RoutedPeer]) -> Vec<&str> {
        set.iter().map(|r| r.peer.public_key.as_str()).collect()
    }

    #[test]
    fn plain_mesh_routes_host_addresses() {
        let network = lab();
        let set = compute_peer_set(&network, A);
        assert_eq!(keys(&set), vec![B, C]);
        assert_eq!(set[0].allowed_ips, vec![net("10.0.0.2/32")]);
        assert_eq!(set[0].keepalive, None);
    }

    #[test]
    fn relayed_viewer_sees_only_relay() {
        let mut network = lab();
        make_relay(&mut network, A, &[B]);

        let set = compute_peer_set(&network, B);
        assert_eq!(keys(&set), vec![A]);
        assert_eq!(set[0].allowed_ips, vec![net("10.0.0.0/24")]);
        assert_eq!(set[0].keepalive, Some(RELAY_KEEPALIVE_SECS));
    }

    #[test]
    fn relay_viewer_keeps_its_charges() {
        let mut network = lab();
        make_relay(&mut network, A, &[B]);

        let set = compute_peer_set(&network, A);
        assert_eq!(keys(&set), vec![B, C]);
        assert_eq!(set[0].allowed_ips, vec![net("10.0.0.2/32")]);
    }

    #[test]
    fn bystander_routes_relayed_through_relay() {
        let mut network = lab();
        make_relay(&mut network, A, &[B]);

        let set = compute_peer_set(&network, C);
        assert_eq!(keys(&set), vec![A]);
        assert_eq!(
            set[0].allowed_ips,
            vec![net("10.0.0.1/32"), net("10.0.0.2/32")]
        );
    }

    #[test]
    fn subnet_router_advertises_virtual_subnet() {
        let mut network = lab();
        let router = network.peer_mut(B).unwrap();
        router.is_subnet_router = true;
        router.subnet = Some(net("192.168.1.0/24"));
        router.virt_subnet = Some(net("172.30.0.0/24"));
        router.use_virt_subnet = true;

        let set = compute_peer_set(&network, A);
        assert_eq!(
            set[0].allowed_ips,
            vec![net("10.0.0.2/32"), net("172.30.0.0/24")]
        );
    }

    #[test]
    fn recompute_tracks_relay_removal() {
        let mut network = lab();
        make_relay(&mut network, A, &[B, C]);
        assert!(network.peer(B).unwrap().is_relayed);
        assert!(network.peer(C).unwrap().is_relayed);

        let relay = network.peer_mut(A).unwrap();
        relay.is_relay = false;
        relay.relayed_peers.clear();
        let changed: BTreeSet<String> = recompute_relayed(&mut network).into_iter().collect();

        assert_eq!(changed, BTreeSet::from([B.to_string(), C.to_string()]));
        assert!(network.peers.iter().all(|p| !p.is_relayed));
    }

    #[test]
    fn validate_relay_rejects_cycles() {
        let mut network = lab();
        let set = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>();

        assert!(validate_relay(&network, A, &set(&[B])).is_ok());
        assert!(matches!(
            validate_relay(&network, A, &set(&[A])),
            Err(MeshError::RelayConflict(_))
        ));

        make_relay(&mut network, A, &[B]);
        assert!(matches!(
            validate_relay(&network, B, &set(&[C])),
            Err(MeshError::RelayConflict(_))
        ));
        assert!(matches!(
            validate_relay(&network, C, &set(&[A])),
            Err(MeshError::RelayConflict(_))
        ));
        assert!(matches!(
            validate_relay(&network, C, &set(&[B])),
            Err(MeshError::RelayConflict(_))
        ));
    }

    #[test]
    fn validate_subnet_router_rules() {
        let mut network = lab();
        assert!(validate_subnet_router(&network, A, net("192.168.1.0/24"), None).is_ok());
        assert!(matches!(
            validate_subnet_router(&network, A, net("192.168.1.0/24"), Some(net("172.30.0.0/16"))),
            Err(MeshError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_subnet_router(&network, A, net("10.0.0.128/25"), None),
            Err(MeshError::SubnetInUse(_))
        ));

        let router = network.peer_mut(B).unwrap();
        router.is_subnet_router = true;
        router.subnet = Some(net("192.168.0.0/16"));

        assert!(matches!(
            validate_subnet_router(&network, A, net("192.168.1.0/24"), None),
            Err(MeshError::SubnetInUse(_))
        ));
        assert!(
            validate_subnet_router(&network, A, net("192.168.1.0/24"), Some(net("172.30.1.0/24")))
                .is_ok()
        );
    }
}
