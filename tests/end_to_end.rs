//! Two messenger instances talking through the public API.

use secure_wallet_messenger::transport::relay::RelayServer;
use secure_wallet_messenger::utils::{
    DataChannelConfig, MessengerConfig, NetworkConfig, RadioConfig, RelayConfig, SocketConfig, TransportConfig,
};
use secure_wallet_messenger::{
    Address, App, ChainType, MessageId, MessageStatus, MessagingEvent, PeerId, Platform, TransportKind, UserProfile,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(10);

fn socket_only() -> SocketConfig {
    SocketConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        enable_multicast: false,
        ..SocketConfig::default()
    }
}

fn config(transports: Vec<TransportConfig>) -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.network = NetworkConfig {
        transports,
        dial_timeout_ms: 2_000,
        dial_attempts: 1,
        backoff_base_ms: 10,
        backoff_max_ms: 20,
        ..NetworkConfig::default()
    };
    config.crypto.prekey_count = 5;
    config
}

async fn node(address: &str, name: &str, config: MessengerConfig) -> (App, mpsc::Receiver<MessagingEvent>) {
    let profile = UserProfile::new(PeerId::new(address, ChainType::Ethereum, name));
    let platform = Platform::standalone(&profile.peer);
    let mut app = App::new(config, profile, platform).await.unwrap();
    app.start().await.unwrap();
    let events = app.take_events().unwrap();
    (app, events)
}

fn address_of(app: &App, kind: TransportKind) -> Address {
    app.manager()
        .local_addresses()
        .into_iter()
        .find(|address| address.kind() == kind)
        .unwrap()
}

async fn wait_status(events: &mut mpsc::Receiver<MessagingEvent>, target: MessageId, wanted: MessageStatus) {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event channel closed") {
                MessagingEvent::StatusChanged { id, status } if id == target && status == wanted => return,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for status");
}

async fn next_text(events: &mut mpsc::Receiver<MessagingEvent>) -> (PeerId, String) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let MessagingEvent::MessageReceived { peer, text, .. } =
                events.recv().await.expect("event channel closed")
            {
                return (peer, text);
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

#[tokio::test]
async fn test_alice_sends_hello_to_bob() {
    let (alice, mut alice_events) = node("0xA11CE", "Alice", config(vec![TransportConfig::Socket(socket_only())])).await;
    let (bob, mut bob_events) = node("0xB0B", "Bob", config(vec![TransportConfig::Socket(socket_only())])).await;

    let bob_peer = bob.profile().peer.clone();
    alice
        .manager()
        .add_address(&bob_peer, address_of(&bob, TransportKind::Socket));
    let bundle = bob.messaging().export_bundle().unwrap();
    assert_eq!(alice.messaging().import_bundle(&bundle).await.unwrap(), bob_peer);

    let id = assert_ok!(
        alice
            .messaging()
            .send_message("alice-bob", "0xb0b", ChainType::Ethereum, "hello")
            .await
    );
    wait_status(&mut alice_events, id, MessageStatus::Sending).await;
    wait_status(&mut alice_events, id, MessageStatus::Sent).await;

    let (from, text) = next_text(&mut bob_events).await;
    assert_eq!(from, alice.profile().peer);
    assert_eq!(text, "hello");

    let history = bob.messaging().conversation("alice-bob").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].1, "hello");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_relay_used_when_it_is_the_only_known_route() {
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), "test-relay", Duration::from_secs(15))
        .await
        .unwrap();
    let relay_addr = server.local_addr().unwrap();
    let relay_task = server.spawn();

    let transports = || {
        vec![
            TransportConfig::Radio(RadioConfig::default()),
            TransportConfig::DataChannel(DataChannelConfig::default()),
            TransportConfig::Socket(socket_only()),
            TransportConfig::Relay(RelayConfig {
                server_id: "test-relay".to_string(),
                server_addr: relay_addr.to_string(),
                ..RelayConfig::default()
            }),
        ]
    };
    let (alice, mut alice_events) = node("0xA11CE", "Alice", config(transports())).await;
    let (bob, mut bob_events) = node("0xB0B", "Bob", config(transports())).await;
    assert_eq!(
        alice.transport_kinds(),
        vec![
            TransportKind::Radio,
            TransportKind::DataChannel,
            TransportKind::Socket,
            TransportKind::Relay,
        ]
    );

    let bob_peer = bob.profile().peer.clone();
    alice
        .manager()
        .add_address(&bob_peer, address_of(&bob, TransportKind::Relay));
    assert_eq!(alice.manager().connect(&bob_peer).await.unwrap(), TransportKind::Relay);

    let bundle = bob.messaging().export_bundle().unwrap();
    alice.messaging().import_bundle(&bundle).await.unwrap();
    for text in ["first", "second"] {
        let id = alice
            .messaging()
            .send_message("relayed", "0xb0b", ChainType::Ethereum, text)
            .await
            .unwrap();
        wait_status(&mut alice_events, id, MessageStatus::Sent).await;
        let (_, received) = next_text(&mut bob_events).await;
        assert_eq!(received, text);
    }

    // The first connect opened the circuit; both sends reused it
    assert_eq!(alice.manager().stats().dial_attempts, 1);

    alice.shutdown().await;
    bob.shutdown().await;
    relay_task.abort();
}

#[tokio::test]
async fn test_unknown_peer_fails_and_is_retried() {
    let (alice, mut alice_events) = node("0xA11CE", "Alice", config(vec![TransportConfig::Socket(socket_only())])).await;
    let (bob, mut bob_events) = node("0xB0B", "Bob", config(vec![TransportConfig::Socket(socket_only())])).await;

    let bundle = bob.messaging().export_bundle().unwrap();
    let bob_peer = alice.messaging().import_bundle(&bundle).await.unwrap();

    // No address for Bob yet
    let id = assert_ok!(
        alice
            .messaging()
            .send_message("later", "0xb0b", ChainType::Ethereum, "queued")
            .await
    );
    wait_status(&mut alice_events, id, MessageStatus::Failed).await;
    assert_eq!(alice.messaging().message(&id).unwrap().status, MessageStatus::Failed);
    assert_err!(alice.messaging().mark_read(&id).await);

    alice
        .manager()
        .add_address(&bob_peer, address_of(&bob, TransportKind::Socket));
    alice.messaging().retry_message(&id).await.unwrap();
    wait_status(&mut alice_events, id, MessageStatus::Sent).await;

    let (_, text) = next_text(&mut bob_events).await;
    assert_eq!(text, "queued");

    alice.shutdown().await;
    bob.shutdown().await;
}
