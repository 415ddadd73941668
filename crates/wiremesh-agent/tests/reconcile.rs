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

mod common;

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use wiremesh_agent::device::Device;
use wiremesh_agent::reconcile::{InterfaceState, Outcome, ReconcileError, Reconciler};
use wiremesh_agent::records::LocalRecords;
use wiremesh_store::MemoryStore;
use wiremesh_types::topology::RELAY_KEEPALIVE_SECS;
use wiremesh_types::{Action, DirectUpdate, Network, NetworkEvent, NetworkPeer};

use common::{MockFirewall, MockPlatform, cidr, context, key};

struct Fixture {
    device: Device,
    platform: MockPlatform,
    firewall: MockFirewall,
    store: MemoryStore,
    reconciler: Reconciler<MockPlatform, MockFirewall, MemoryStore>,
}

fn fixture() -> Fixture {
    let device = Device::generate();
    let platform = MockPlatform::default();
    let firewall = MockFirewall::default();
    let store = MemoryStore::new();
    let reconciler = Reconciler::new("lab", context(&device, &platform, &firewall, &store));
    Fixture {
        device,
        platform,
        firewall,
        store,
        reconciler,
    }
}

fn peer(seed: u8, host: u8) -> NetworkPeer {
    let mut peer = NetworkPeer::new(key(seed), Ipv4Addr::new(10, 0, 0, host));
    peer.listen_port = 51820;
    peer.endpoint = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, host)));
    peer
}

/// This device at .1 and peer 2 at .2.
fn lab(device: &Device) -> Network {
    let mut network = Network::new("lab", cidr("10.0.0.0/24"));
    network.upsert_peer(NetworkPeer::new(device.public_key.clone(), Ipv4Addr::new(10, 0, 0, 1)));
    network.upsert_peer(peer(2, 2));
    network
}

fn event(action: Action, peer: Option<NetworkPeer>) -> NetworkEvent {
    NetworkEvent {
        action,
        network: "lab".into(),
        peer,
    }
}

fn keys(seeds: &[u8]) -> Vec<String> {
    let set: BTreeSet<String> = seeds.iter().map(|s| key(*s)).collect();
    set.into_iter().collect()
}

#[tokio::test]
async fn start_programs_interface_and_reports_ports() {
    let mut f = fixture();
    let outcome = f.reconciler.start(lab(&f.device)).await.unwrap();

    assert_eq!(f.reconciler.state(), InterfaceState::Running);
    let iface = f.platform.interface("wm0").unwrap();
    assert_eq!(iface.address, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(iface.prefix, 24);
    assert_ne!(iface.listen_port, 0);

    let b = &iface.peers[&key(2)];
    assert_eq!(b.allowed_ips, vec![cidr("10.0.0.2/32")]);
    assert_eq!(b.endpoint, Some(SocketAddr::from(([203, 0, 113, 2], 51820))));
    assert_eq!(b.keepalive, None);

    match outcome {
        Outcome::Report(req) => {
            assert_eq!(req.network, "lab");
            assert_eq!(req.listen_port, iface.listen_port);
            assert_eq!(req.public_listen_port, iface.listen_port);
        }
        other => panic!("expected a port report, got {other:?}"),
    }

    let saved = LocalRecords::new(f.store.clone())
        .get_membership("lab")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.interface, "wm0");
    assert_eq!(saved.listen_port, iface.listen_port);
}

#[tokio::test]
async fn missing_self_record_is_rejected() {
    let mut f = fixture();
    let mut network = Network::new("lab", cidr("10.0.0.0/24"));
    network.upsert_peer(peer(2, 2));

    let err = f.reconciler.start(network).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NoSelfAddress(name) if name == "lab"));
    assert_eq!(f.reconciler.state(), InterfaceState::Absent);
    assert_eq!(f.platform.created(), 0);
}

#[tokio::test]
async fn repeated_add_peer_is_idempotent() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();
    let upserts = f.platform.upserts();

    for _ in 0..2 {
        let outcome = f
            .reconciler
            .apply_event(event(Action::AddPeer, Some(peer(3, 3))))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
    }

    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2, 3]));
    assert_eq!(f.platform.upserts(), upserts + 1);
    let members = f.reconciler.membership().unwrap().network.peers.len();
    assert_eq!(members, 3);
}

#[tokio::test]
async fn peer_update_patches_single_entry() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();
    let resets = f.platform.resets();

    let mut moved = peer(2, 2);
    moved.endpoint = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
    moved.public_listen_port = 40000;
    f.reconciler
        .apply_event(event(Action::UpdatePeer, Some(moved)))
        .await
        .unwrap();

    let iface = f.platform.interface("wm0").unwrap();
    assert_eq!(
        iface.peers[&key(2)].endpoint,
        Some(SocketAddr::from(([198, 51, 100, 7], 40000)))
    );
    assert_eq!(f.platform.resets(), resets);
}

#[tokio::test]
async fn deleted_peer_is_removed() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();
    f.reconciler
        .apply_event(event(Action::AddPeer, Some(peer(3, 3))))
        .await
        .unwrap();

    f.reconciler
        .apply_event(event(Action::DeletePeer, Some(peer(2, 2))))
        .await
        .unwrap();
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[3]));
    assert!(!f.reconciler.membership().unwrap().network.contains(&key(2)));
}

#[tokio::test]
async fn own_deletion_tears_down() {
    let mut f = fixture();
    let network = lab(&f.device);
    let me = network.peer(&f.device.public_key).cloned();
    f.reconciler.start(network).await.unwrap();

    let outcome = f
        .reconciler
        .apply_event(event(Action::DeletePeer, me))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Removed);
    assert_eq!(f.reconciler.state(), InterfaceState::TornDown);
    assert!(f.platform.interfaces().is_empty());
    assert_eq!(f.platform.removed(), vec!["wm0".to_string()]);

    let saved = LocalRecords::new(f.store.clone()).get_membership("lab").await.unwrap();
    assert!(saved.is_none());
}

#[tokio::test]
async fn network_deletion_tears_down() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();

    let outcome = f
        .reconciler
        .apply_event(event(Action::DeleteNetwork, None))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Removed);
    assert!(f.platform.interfaces().is_empty());
}

#[tokio::test]
async fn relay_changes_rebuild_peer_set() {
    let mut f = fixture();
    let mut network = lab(&f.device);
    network.upsert_peer(peer(3, 3));
    f.reconciler.start(network.clone()).await.unwrap();
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2, 3]));
    let resets = f.platform.resets();

    let mut relay = network.peer(&key(2)).cloned().unwrap();
    relay.is_relay = true;
    relay.relayed_peers = [key(3)].into_iter().collect();
    f.reconciler
        .apply_event(event(Action::AddRelay, Some(relay.clone())))
        .await
        .unwrap();

    assert_eq!(f.platform.resets(), resets + 1);
    let iface = f.platform.interface("wm0").unwrap();
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2]));
    let entry = &iface.peers[&key(2)];
    assert_eq!(entry.allowed_ips, vec![cidr("10.0.0.2/32"), cidr("10.0.0.3/32")]);
    assert_eq!(entry.keepalive, Some(RELAY_KEEPALIVE_SECS));
    let snapshot = &f.reconciler.membership().unwrap().network;
    assert!(snapshot.peer(&key(3)).unwrap().is_relayed);

    relay.is_relay = false;
    relay.relayed_peers.clear();
    f.reconciler
        .apply_event(event(Action::DeleteRelay, Some(relay)))
        .await
        .unwrap();
    assert_eq!(f.platform.resets(), resets + 2);
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2, 3]));
}

#[tokio::test]
async fn failed_write_keeps_programmed_state() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();

    f.platform.fail_writes(true);
    let result = f
        .reconciler
        .apply_event(event(Action::AddPeer, Some(peer(3, 3))))
        .await;
    assert!(matches!(result, Err(ReconcileError::Platform(_))));
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2]));
    assert_eq!(f.reconciler.applied().count(), 1);
    assert_eq!(f.reconciler.state(), InterfaceState::Running);

    f.platform.fail_writes(false);
    f.reconciler
        .apply_event(event(Action::AddPeer, Some(peer(3, 3))))
        .await
        .unwrap();
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2, 3]));
}

#[tokio::test]
async fn existing_interface_is_reapplied() {
    let mut f = fixture();
    f.platform.preexisting("wm0", Ipv4Addr::new(10, 0, 0, 1));

    let outcome = f.reconciler.start(lab(&f.device)).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert_eq!(f.platform.created(), 0);
    assert_eq!(f.platform.resets(), 1);
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2]));
    assert_eq!(f.reconciler.state(), InterfaceState::Running);
}

#[tokio::test]
async fn subnet_router_updates_manage_rules() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();

    let add = DirectUpdate::AddSubnetRouter {
        network: "lab".into(),
        subnet: cidr("192.168.1.0/24"),
        virt_subnet: Some(cidr("172.30.1.0/24")),
        use_nat: true,
    };
    f.reconciler.apply_direct(add).await.unwrap();
    let expected: BTreeSet<String> = [
        "masquerade wm0 192.168.1.0/24".to_string(),
        "netmap wm0 172.30.1.0/24 192.168.1.0/24".to_string(),
    ]
    .into_iter()
    .collect();
    assert_eq!(f.firewall.rules(), expected);

    let delete = DirectUpdate::DeleteSubnetRouter {
        network: "lab".into(),
        subnet: cidr("192.168.1.0/24"),
        virt_subnet: Some(cidr("172.30.1.0/24")),
        use_nat: true,
    };
    f.reconciler.apply_direct(delete).await.unwrap();
    assert!(f.firewall.rules().is_empty());
}

#[tokio::test]
async fn removed_subnet_router_withdraws_its_route() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();
    assert!(f.platform.routes("wm0").is_empty());

    let mut router = peer(2, 2);
    router.is_subnet_router = true;
    router.subnet = Some(cidr("192.168.1.0/24"));
    f.reconciler
        .apply_event(event(Action::UpdatePeer, Some(router)))
        .await
        .unwrap();
    assert_eq!(
        f.platform.routes("wm0"),
        BTreeSet::from([cidr("192.168.1.0/24")])
    );
    assert_eq!(
        f.platform.interface("wm0").unwrap().peers[&key(2)].allowed_ips,
        vec![cidr("10.0.0.2/32"), cidr("192.168.1.0/24")]
    );

    f.reconciler
        .apply_event(event(Action::UpdatePeer, Some(peer(2, 2))))
        .await
        .unwrap();
    assert!(f.platform.routes("wm0").is_empty());
    assert_eq!(
        f.platform.interface("wm0").unwrap().peers[&key(2)].allowed_ips,
        vec![cidr("10.0.0.2/32")]
    );
}

#[tokio::test]
async fn own_router_record_installs_rules_until_teardown() {
    let mut f = fixture();
    let mut network = lab(&f.device);
    let me = network.peer_mut(&f.device.public_key).unwrap();
    me.is_subnet_router = true;
    me.subnet = Some(cidr("192.168.7.0/24"));
    me.use_nat = true;

    f.reconciler.start(network).await.unwrap();
    assert!(f.firewall.rules().contains("masquerade wm0 192.168.7.0/24"));

    f.reconciler.teardown(true).await;
    assert!(f.firewall.rules().is_empty());
}

#[tokio::test]
async fn listen_port_update_restarts_interface() {
    let mut f = fixture();
    f.reconciler.start(lab(&f.device)).await.unwrap();
    assert_eq!(f.platform.created(), 1);

    let outcome = f
        .reconciler
        .apply_direct(DirectUpdate::ListenPort {
            network: "lab".into(),
        })
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Report(_)));
    assert_eq!(f.platform.created(), 2);
    assert_eq!(f.platform.removed(), vec!["wm0".to_string()]);
    assert_eq!(f.platform.peer_keys("wm0"), keys(&[2]));
    assert_eq!(f.reconciler.state(), InterfaceState::Running);
}
