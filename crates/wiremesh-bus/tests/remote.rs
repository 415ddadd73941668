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

use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use wiremesh_bus::identity::encode_verifying_key;
use wiremesh_bus::{Broker, Bus, BusError, Credentials, Permissions, RemoteConnection, remote};

// -- Helpers --

async fn start_endpoint(broker: &Broker) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(remote::serve(listener, broker.clone(), shutdown.clone()));
    (addr, shutdown)
}

fn device(seed: u8) -> (SigningKey, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let identity = encode_verifying_key(&key.verifying_key());
    (key, identity)
}

// -- Tests --

#[tokio::test]
async fn remote_device_receives_broadcasts_in_order() {
    let broker = Broker::new(None);
    let (addr, _shutdown) = start_endpoint(&broker).await;
    let (key, identity) = device(1);
    broker.authorize(
        &identity,
        Permissions {
            publish: vec![format!("{identity}.>")],
            subscribe: vec!["networks.>".into()],
        },
    );

    let remote = RemoteConnection::connect(addr, &Credentials::Device(key))
        .await
        .unwrap();
    let mut sub = remote.subscribe("networks.>").await.unwrap();

    let server = broker.connect(&Credentials::Server).unwrap();
    for i in 0..10u8 {
        server.publish("networks.lab", vec![i]).await.unwrap();
    }
    for i in 0..10u8 {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "networks.lab");
        assert_eq!(msg.payload, vec![i]);
    }
}

#[tokio::test]
async fn remote_request_reaches_local_responder() {
    let broker = Broker::new(None);
    let (addr, _shutdown) = start_endpoint(&broker).await;
    let (key, identity) = device(2);
    broker.authorize(
        &identity,
        Permissions {
            publish: vec![format!("{identity}.>")],
            subscribe: vec![],
        },
    );

    let server = broker.connect(&Credentials::Server).unwrap();
    let mut requests = server.subscribe("*.checkin").await.unwrap();
    tokio::spawn(async move {
        while let Some(req) = requests.next().await {
            let reply = req.reply.clone().unwrap();
            server.publish(&reply, req.payload.clone()).await.unwrap();
        }
    });

    let remote = RemoteConnection::connect(addr, &Credentials::Device(key))
        .await
        .unwrap();
    let reply = remote
        .request(
            &format!("{identity}.checkin"),
            b"hello".to_vec(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, b"hello");
}

#[tokio::test]
async fn remote_permission_errors_are_reported() {
    let broker = Broker::new(None);
    let (addr, _shutdown) = start_endpoint(&broker).await;

    let invite = RemoteConnection::connect(addr, &Credentials::Invite("abc".into()))
        .await
        .unwrap();
    assert!(matches!(
        invite.publish("networks.lab", vec![]).await,
        Err(BusError::PermissionDenied { op: "publish", .. })
    ));
    assert!(matches!(
        invite.subscribe("networks.>").await,
        Err(BusError::PermissionDenied { op: "subscribe", .. })
    ));
    invite.publish("register", vec![]).await.unwrap();
}

#[tokio::test]
async fn unknown_device_cannot_connect() {
    let broker = Broker::new(None);
    let (addr, _shutdown) = start_endpoint(&broker).await;
    let (key, _) = device(3);

    let result = RemoteConnection::connect(addr, &Credentials::Device(key)).await;
    assert!(matches!(result, Err(BusError::Unauthorized)));
}

#[tokio::test]
async fn revoke_closes_remote_connection() {
    let broker = Broker::new(None);
    let (addr, _shutdown) = start_endpoint(&broker).await;
    let (key, identity) = device(4);
    broker.authorize(
        &identity,
        Permissions {
            publish: vec![],
            subscribe: vec!["networks.>".into()],
        },
    );

    let remote = RemoteConnection::connect(addr, &Credentials::Device(key))
        .await
        .unwrap();
    let mut sub = remote.subscribe("networks.>").await.unwrap();
    assert_eq!(broker.revoke(&identity), 1);

    let next = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap();
    assert!(next.is_none());
    assert!(remote.is_closed());
}
