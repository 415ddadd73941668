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

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use ipnetwork::Ipv4Network;

use wiremesh_bus::identity::encode_verifying_key;
use wiremesh_bus::{Broker, Bus, BusError, Credentials, LocalConnection, Subscription, request_json};
use wiremesh_server::{Authority, AuthorityError, Dispatcher};
use wiremesh_store::MemoryStore;
use wiremesh_types::proto::{
    AddRelayRequest, AddSubnetRouterRequest, CheckinRequest, CreateInviteRequest,
    CreateNetworkRequest, DeleteRelayRequest, JoinRequest, RegisterRequest, RegisterResponse,
    UpdatePortsRequest,
};
use wiremesh_types::subject::{PeerOp, REGISTER, admin_subject, peer_subject, update_namespace};
use wiremesh_types::topology::compute_peer_set;
use wiremesh_types::{
    Action, ConnectivitySample, DirectUpdate, MeshError, Network, NetworkEvent, NetworkPeer, Reply,
};

// -- Helpers --

struct Harness {
    authority: Arc<Authority<MemoryStore>>,
    broker: Broker,
    bus: LocalConnection,
    token: String,
}

struct Device {
    key: String,
    signing: SigningKey,
}

async fn harness() -> Harness {
    let broker = Broker::new(Some("admin-secret".into()));
    let bus = broker.connect(&Credentials::Server).unwrap();
    let authority = Arc::new(Authority::new(MemoryStore::new(), broker.clone(), bus.clone()));
    let token = authority
        .create_invite(CreateInviteRequest {
            uses: 100,
            ttl_secs: None,
        })
        .await
        .unwrap()
        .token;
    Harness {
        authority,
        broker,
        bus,
        token,
    }
}

fn device(seed: u8) -> Device {
    Device {
        key: BASE64.encode([seed; 32]),
        signing: SigningKey::from_bytes(&[seed; 32]),
    }
}

fn register_request(dev: &Device, token: &str) -> RegisterRequest {
    RegisterRequest {
        token: token.to_string(),
        public_key: dev.key.clone(),
        signing_key: encode_verifying_key(&dev.signing.verifying_key()),
        hostname: "host".into(),
        os: "linux".into(),
        version: "test".into(),
        endpoint: None,
    }
}

async fn registered(h: &Harness, seed: u8) -> Device {
    let dev = device(seed);
    h.authority
        .register(register_request(&dev, &h.token))
        .await
        .unwrap();
    dev
}

fn join_request(network: &str) -> JoinRequest {
    JoinRequest {
        network: network.to_string(),
        listen_port: 51820,
        public_listen_port: 51820,
        endpoint: None,
        private_endpoint: None,
        hostname: "host".into(),
    }
}

async fn create_network(h: &Harness, name: &str, cidr: &str) {
    h.authority
        .create_network(CreateNetworkRequest {
            name: name.into(),
            cidr: cidr.into(),
        })
        .await
        .unwrap();
}

fn code<T: std::fmt::Debug>(result: Result<T, AuthorityError>) -> MeshError {
    MeshError::from(result.unwrap_err())
}

async fn next_event(sub: &mut Subscription) -> NetworkEvent {
    let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed");
    msg.json().unwrap()
}

fn cidr(s: &str) -> Ipv4Network {
    s.parse().unwrap()
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

// -- Membership --

#[tokio::test]
async fn lab_scenario_allocates_and_relays() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let b = registered(&h, 2).await;

    let pa = h.authority.join(&a.key, join_request("lab")).await.unwrap();
    let pb = h.authority.join(&b.key, join_request("lab")).await.unwrap();
    assert_eq!(pa.address, v4(10, 0, 0, 1));
    assert_eq!(pb.address, v4(10, 0, 0, 2));

    h.authority
        .add_relay(AddRelayRequest {
            network: "lab".into(),
            relay: a.key.clone(),
            relayed: BTreeSet::from([b.key.clone()]),
        })
        .await
        .unwrap();

    let network = h.authority.records().get_network("lab").await.unwrap().unwrap();
    assert!(network.peer(&b.key).unwrap().is_relayed);

    let b_view = compute_peer_set(&network, &b.key);
    assert_eq!(b_view.len(), 1);
    assert_eq!(b_view[0].peer.public_key, a.key);
    assert_eq!(b_view[0].allowed_ips, vec![cidr("10.0.0.0/24")]);

    let a_view = compute_peer_set(&network, &a.key);
    assert_eq!(a_view.len(), 1);
    assert_eq!(a_view[0].peer.public_key, b.key);
    assert_eq!(a_view[0].allowed_ips, vec![cidr("10.0.0.2/32")]);
}

#[tokio::test]
async fn join_errors() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;

    assert_eq!(
        code(h.authority.join(&a.key, join_request("nope")).await),
        MeshError::NetworkNotFound
    );
    h.authority.join(&a.key, join_request("lab")).await.unwrap();
    assert_eq!(
        code(h.authority.join(&a.key, join_request("lab")).await),
        MeshError::AlreadyMember
    );

    let stranger = device(9);
    assert_eq!(
        code(h.authority.join(&stranger.key, join_request("lab")).await),
        MeshError::PeerNotFound
    );
}

#[tokio::test]
async fn join_into_full_network_is_exhausted() {
    let h = harness().await;
    create_network(&h, "tiny", "192.168.50.0/30").await;
    for seed in 1..=2 {
        let dev = registered(&h, seed).await;
        h.authority.join(&dev.key, join_request("tiny")).await.unwrap();
    }
    let third = registered(&h, 3).await;
    assert_eq!(
        code(h.authority.join(&third.key, join_request("tiny")).await),
        MeshError::Exhausted
    );
}

#[tokio::test]
async fn concurrent_joins_get_distinct_addresses() {
    let h = harness().await;
    create_network(&h, "lab", "10.1.0.0/24").await;

    let mut devices = Vec::new();
    for seed in 1..=32 {
        devices.push(registered(&h, seed).await);
    }

    let mut tasks = Vec::new();
    for dev in &devices {
        let authority = h.authority.clone();
        let key = dev.key.clone();
        tasks.push(tokio::spawn(async move {
            authority.join(&key, join_request("lab")).await.unwrap()
        }));
    }
    let mut addresses = BTreeSet::new();
    for task in tasks {
        addresses.insert(task.await.unwrap().address);
    }
    assert_eq!(addresses.len(), 32);

    let network = h.authority.records().get_network("lab").await.unwrap().unwrap();
    assert_eq!(network.peers.len(), 32);
    for peer in &network.peers {
        assert_ne!(peer.address, network.cidr.network());
        assert_ne!(peer.address, network.cidr.broadcast());
    }
}

#[tokio::test]
async fn join_sends_snapshot_then_broadcasts() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;

    let mut direct = h.bus.subscribe(&update_namespace(&a.key)).await.unwrap();
    let mut events = h.bus.subscribe("networks.lab").await.unwrap();

    h.authority.join(&a.key, join_request("lab")).await.unwrap();

    let msg = direct.next().await.unwrap();
    assert!(msg.subject.ends_with(".join"));
    let DirectUpdate::Join { network } = msg.json().unwrap() else {
        panic!("expected join update");
    };
    assert!(network.contains(&a.key));

    let event = next_event(&mut events).await;
    assert_eq!(event.action, Action::AddPeer);
    assert_eq!(event.peer.unwrap().public_key, a.key);
}

#[tokio::test]
async fn leave_broadcasts_full_record() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let joined = h.authority.join(&a.key, join_request("lab")).await.unwrap();

    let mut events = h.bus.subscribe("networks.lab").await.unwrap();
    h.authority.leave(&a.key, "lab").await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.action, Action::DeletePeer);
    assert_eq!(event.peer, Some(joined));

    assert_eq!(
        code(h.authority.leave(&a.key, "lab").await),
        MeshError::NotMember
    );
}

#[tokio::test]
async fn leaving_charge_is_dropped_from_relay_set() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let b = registered(&h, 2).await;
    h.authority.join(&a.key, join_request("lab")).await.unwrap();
    h.authority.join(&b.key, join_request("lab")).await.unwrap();
    h.authority
        .add_relay(AddRelayRequest {
            network: "lab".into(),
            relay: a.key.clone(),
            relayed: BTreeSet::from([b.key.clone()]),
        })
        .await
        .unwrap();

    h.authority.leave(&b.key, "lab").await.unwrap();
    let network = h.authority.records().get_network("lab").await.unwrap().unwrap();
    assert!(network.peer(&a.key).unwrap().relayed_peers.is_empty());
}

// -- Registration --

#[tokio::test]
async fn register_validates_tokens_and_duplicates() {
    let h = harness().await;
    let a = device(1);

    let bogus = register_request(&a, "not-a-token");
    assert_eq!(code(h.authority.register(bogus).await), MeshError::InvalidToken);

    let unknown = register_request(&a, &wiremesh_server::tokens::generate_token());
    assert_eq!(code(h.authority.register(unknown).await), MeshError::InvalidToken);

    h.authority
        .register(register_request(&a, &h.token))
        .await
        .unwrap();
    assert_eq!(
        code(h.authority.register(register_request(&a, &h.token)).await),
        MeshError::DuplicatePeer
    );
}

#[tokio::test]
async fn single_use_invite_admits_one_device() {
    let h = harness().await;
    let token = h
        .authority
        .create_invite(CreateInviteRequest {
            uses: 1,
            ttl_secs: Some(3600),
        })
        .await
        .unwrap()
        .token;

    h.authority
        .register(register_request(&device(1), &token))
        .await
        .unwrap();
    assert_eq!(
        code(h.authority.register(register_request(&device(2), &token)).await),
        MeshError::InvalidToken
    );
}

#[tokio::test]
async fn register_installs_scoped_identity() {
    let h = harness().await;
    let a = registered(&h, 1).await;
    let b = device(2);

    let conn = h
        .broker
        .connect(&Credentials::Device(a.signing.clone()))
        .unwrap();
    conn.subscribe("networks.>").await.unwrap();
    conn.subscribe(&update_namespace(&a.key)).await.unwrap();
    assert!(matches!(
        conn.subscribe(&update_namespace(&b.key)).await,
        Err(BusError::PermissionDenied { .. })
    ));
    assert!(matches!(
        conn.publish(&peer_subject(&b.key, PeerOp::Join), vec![]).await,
        Err(BusError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn signing_key_cannot_be_rebound() {
    let h = harness().await;
    let victim = registered(&h, 1).await;
    let intruder = Device {
        key: BASE64.encode([42u8; 32]),
        signing: victim.signing.clone(),
    };

    assert_eq!(
        code(h.authority.register(register_request(&intruder, &h.token)).await),
        MeshError::DuplicatePeer
    );
    assert!(h.authority.records().get_peer(&intruder.key).await.unwrap().is_none());

    let conn = h
        .broker
        .connect(&Credentials::Device(victim.signing.clone()))
        .unwrap();
    conn.subscribe(&update_namespace(&victim.key)).await.unwrap();
    assert!(h.broker.is_authorized(&encode_verifying_key(&victim.signing.verifying_key())));
}

// -- Checkin & ports --

#[tokio::test]
async fn unknown_networks_leave_no_lock_behind() {
    let h = harness().await;
    let dev = registered(&h, 1).await;

    for name in ["nope", "Not A Name!", ""] {
        let result = h.authority.join(&dev.key, join_request(name)).await;
        assert_eq!(code(result), MeshError::NetworkNotFound);
        let result = h.authority.leave(&dev.key, name).await;
        assert_eq!(code(result), MeshError::NetworkNotFound);
    }
    assert_eq!(h.authority.network_lock_count(), 0);

    create_network(&h, "lab", "10.0.0.0/24").await;
    h.authority.join(&dev.key, join_request("lab")).await.unwrap();
    assert_eq!(h.authority.network_lock_count(), 1);

    h.authority.delete_network("lab").await.unwrap();
    assert_eq!(h.authority.network_lock_count(), 0);
    let result = h.authority.leave(&dev.key, "lab").await;
    assert_eq!(code(result), MeshError::NetworkNotFound);
    assert_eq!(h.authority.network_lock_count(), 0);
}

#[tokio::test]
async fn checkin_propagates_endpoint_and_scores() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    h.authority.join(&a.key, join_request("lab")).await.unwrap();

    let mut events = h.bus.subscribe("networks.lab").await.unwrap();
    let endpoint = IpAddr::V4(v4(203, 0, 113, 7));
    let resp = h
        .authority
        .checkin(
            &a.key,
            CheckinRequest {
                endpoint: Some(endpoint),
                version: "test2".into(),
                samples: vec![ConnectivitySample {
                    network: "lab".into(),
                    score: 1.7,
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.networks, vec!["lab".to_string()]);

    let event = next_event(&mut events).await;
    assert_eq!(event.action, Action::UpdatePeer);
    let peer = event.peer.unwrap();
    assert_eq!(peer.endpoint, Some(endpoint));
    assert_eq!(peer.connectivity, 1.0);

    let stored = h.authority.records().get_peer(&a.key).await.unwrap().unwrap();
    assert_eq!(stored.version, "test2");
    assert_eq!(stored.endpoint, Some(endpoint));
}

#[tokio::test]
async fn update_ports_broadcasts_only_on_change() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    h.authority.join(&a.key, join_request("lab")).await.unwrap();
    let mut events = h.bus.subscribe("networks.lab").await.unwrap();

    let req = UpdatePortsRequest {
        network: "lab".into(),
        listen_port: 51820,
        public_listen_port: 40000,
        endpoint: None,
        private_endpoint: Some(IpAddr::V4(v4(192, 168, 1, 20))),
    };
    let updated = h.authority.update_ports(&a.key, req.clone()).await.unwrap();
    assert_eq!(updated.public_listen_port, 40000);
    assert_eq!(next_event(&mut events).await.action, Action::UpdatePeer);

    h.authority.update_ports(&a.key, req).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(100), events.next()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn stale_peers_are_marked_disconnected() {
    let h = harness().await;
    let a = registered(&h, 1).await;

    let swept = h
        .authority
        .sweep_stale(Utc::now() + chrono::Duration::minutes(10), chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(swept, 1);
    let peer = h.authority.records().get_peer(&a.key).await.unwrap().unwrap();
    assert!(!peer.connected);
}

// -- Leave server --

#[tokio::test]
async fn leave_server_removes_memberships_and_identity() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    create_network(&h, "ops", "10.2.0.0/24").await;
    let a = registered(&h, 1).await;
    h.authority.join(&a.key, join_request("lab")).await.unwrap();
    h.authority.join(&a.key, join_request("ops")).await.unwrap();

    let mut events = h.bus.subscribe("networks.>").await.unwrap();
    let peer = h.authority.leave_server(&a.key).await.unwrap();
    h.authority.revoke(&peer);

    let mut deleted = BTreeSet::new();
    for _ in 0..2 {
        let event = next_event(&mut events).await;
        assert_eq!(event.action, Action::DeletePeer);
        deleted.insert(event.network);
    }
    assert_eq!(deleted, BTreeSet::from(["lab".to_string(), "ops".to_string()]));

    assert!(h.authority.records().get_peer(&a.key).await.unwrap().is_none());
    assert!(!h.broker.is_authorized(&encode_verifying_key(&a.signing.verifying_key())));
    assert_eq!(
        code(h.authority.reload(&a.key).await),
        MeshError::PeerNotFound
    );
}

// -- Relays & subnet routers --

#[tokio::test]
async fn delete_relay_clears_derived_flags() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let b = registered(&h, 2).await;
    let c = registered(&h, 3).await;
    for dev in [&a, &b, &c] {
        h.authority.join(&dev.key, join_request("lab")).await.unwrap();
    }
    h.authority
        .add_relay(AddRelayRequest {
            network: "lab".into(),
            relay: a.key.clone(),
            relayed: BTreeSet::from([b.key.clone(), c.key.clone()]),
        })
        .await
        .unwrap();

    let mut events = h.bus.subscribe("networks.lab").await.unwrap();
    let relay = h
        .authority
        .delete_relay(DeleteRelayRequest {
            network: "lab".into(),
            relay: a.key.clone(),
        })
        .await
        .unwrap();
    assert!(!relay.is_relay);
    assert!(relay.relayed_peers.is_empty());

    let network = h.authority.records().get_network("lab").await.unwrap().unwrap();
    assert!(network.peers.iter().all(|p| !p.is_relayed));

    let first = next_event(&mut events).await;
    assert_eq!(first.action, Action::DeleteRelay);
    let mut updated: Vec<NetworkPeer> = Vec::new();
    for _ in 0..2 {
        let event = next_event(&mut events).await;
        assert_eq!(event.action, Action::UpdatePeer);
        updated.push(event.peer.unwrap());
    }
    assert!(updated.iter().all(|p| !p.is_relayed));
}

#[tokio::test]
async fn relay_conflicts_are_rejected() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let b = registered(&h, 2).await;
    for dev in [&a, &b] {
        h.authority.join(&dev.key, join_request("lab")).await.unwrap();
    }
    h.authority
        .add_relay(AddRelayRequest {
            network: "lab".into(),
            relay: a.key.clone(),
            relayed: BTreeSet::from([b.key.clone()]),
        })
        .await
        .unwrap();

    let result = h
        .authority
        .add_relay(AddRelayRequest {
            network: "lab".into(),
            relay: b.key.clone(),
            relayed: BTreeSet::from([a.key.clone()]),
        })
        .await;
    assert!(matches!(code(result), MeshError::RelayConflict(_)));
}

#[tokio::test]
async fn overlapping_subnet_routers_are_rejected() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let a = registered(&h, 1).await;
    let b = registered(&h, 2).await;
    for dev in [&a, &b] {
        h.authority.join(&dev.key, join_request("lab")).await.unwrap();
    }

    let mut direct = h.bus.subscribe(&update_namespace(&a.key)).await.unwrap();
    h.authority
        .add_subnet_router(AddSubnetRouterRequest {
            network: "lab".into(),
            public_key: a.key.clone(),
            subnet: cidr("192.168.1.0/24"),
            virt_subnet: None,
            use_nat: true,
        })
        .await
        .unwrap();
    let msg = direct.next().await.unwrap();
    assert!(matches!(
        msg.json::<DirectUpdate>().unwrap(),
        DirectUpdate::AddSubnetRouter { use_nat: true, .. }
    ));

    let result = h
        .authority
        .add_subnet_router(AddSubnetRouterRequest {
            network: "lab".into(),
            public_key: b.key.clone(),
            subnet: cidr("192.168.1.128/25"),
            virt_subnet: None,
            use_nat: false,
        })
        .await;
    assert!(matches!(code(result), MeshError::SubnetInUse(_)));
}

// -- Over the bus --

#[tokio::test]
async fn device_requests_through_dispatcher() {
    let h = harness().await;
    create_network(&h, "lab", "10.0.0.0/24").await;
    let _dispatcher = Dispatcher::new(h.authority.clone(), h.bus.clone())
        .spawn(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    let dev = device(7);
    let invite = h
        .broker
        .connect(&Credentials::Invite(h.token.clone()))
        .unwrap();
    let reply: Reply<RegisterResponse> = request_json(
        &invite,
        REGISTER,
        &register_request(&dev, &h.token),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(reply.into_result().unwrap().peer.public_key, dev.key);

    let conn = h
        .broker
        .connect(&Credentials::Device(dev.signing.clone()))
        .unwrap();
    let reply: Reply<NetworkPeer> = request_json(
        &conn,
        &peer_subject(&dev.key, PeerOp::Join),
        &join_request("lab"),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(reply.into_result().unwrap().address, v4(10, 0, 0, 1));

    let reply: Reply<NetworkPeer> = request_json(
        &conn,
        &peer_subject(&dev.key, PeerOp::Join),
        &join_request("lab"),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(reply.into_result(), Err(MeshError::AlreadyMember));
}

#[tokio::test]
async fn admin_requests_through_dispatcher() {
    let h = harness().await;
    let _dispatcher = Dispatcher::new(h.authority.clone(), h.bus.clone())
        .spawn(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    let admin = h
        .broker
        .connect(&Credentials::Admin("admin-secret".into()))
        .unwrap();
    let reply: Reply<Network> = request_json(
        &admin,
        &admin_subject("createNetwork"),
        &CreateNetworkRequest {
            name: "ops".into(),
            cidr: "10.1.0.0/24".into(),
        },
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(reply.into_result().unwrap().name, "ops");
    assert!(h.authority.records().get_network("ops").await.unwrap().is_some());
}
