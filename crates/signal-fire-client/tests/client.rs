mod support;

use std::time::Duration;

use serde_json::json;
use signal_fire_client::client::Outbound;
use signal_fire_client::protocol::{Command, ProtocolError, close_code};
use signal_fire_client::{
    ClientConfig, ClientError, ClientEvent, EngineConfig, IceServer, IceTransportPolicy, Message,
};
use support::{Harness, LOCAL_ID, within};

#[tokio::test]
async fn welcome_assigns_identity_and_merges_server_config() {
    let mut harness = Harness::start(ClientConfig::default());
    assert_eq!(harness.client.local_id(), None);

    harness.server.push(json!({
        "cmd": "welcome",
        "data": {
            "id": "peer-a",
            "config": { "iceServers": [{ "urls": ["turn:relay.example.com"] }] }
        }
    }));

    match harness.next_event().await {
        ClientEvent::Welcome(id) => assert_eq!(id, "peer-a"),
        other => panic!("expected welcome, got {other:?}"),
    }
    assert_eq!(harness.client.local_id().as_deref(), Some("peer-a"));
    let config = harness.client.config();
    assert_eq!(
        config.ice_servers,
        Some(vec![IceServer::new("turn:relay.example.com")])
    );
}

#[tokio::test]
async fn repeated_welcome_is_reported_and_ignored() {
    let mut harness = Harness::welcomed().await;
    harness.server.welcome("someone-else");

    match harness.next_event().await {
        ClientEvent::Error(ClientError::AlreadyWelcomed) => {}
        other => panic!("expected AlreadyWelcomed, got {other:?}"),
    }
    assert_eq!(harness.client.local_id().as_deref(), Some(LOCAL_ID));
}

#[tokio::test]
async fn responses_are_correlated_by_id() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.send(Message::request(Command::SessionStart, "peer-1")).await }
    });
    let first_request = harness.server.next_message().await;
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.send(Message::request(Command::SessionStart, "peer-2")).await }
    });
    let second_request = harness.server.next_message().await;

    assert_ne!(first_request.id, second_request.id);
    assert!(first_request.id.is_some());
    assert_eq!(first_request.target.as_deref(), Some("peer-1"));
    assert_eq!(second_request.cmd.as_deref(), Some("session-start"));

    // Answer out of order.
    harness
        .server
        .respond_with_reason(&second_request, false, "busy");
    harness.server.respond(&first_request, true);

    let second = within(second).await.unwrap().expect("second response");
    assert!(!second.is_ok());
    assert_eq!(second.reason().as_deref(), Some("busy"));
    let first = within(first).await.unwrap().expect("first response");
    assert!(first.is_ok());
}

#[tokio::test]
async fn requests_to_self_fail_before_the_wire() {
    let mut harness = Harness::welcomed().await;
    let err = harness
        .client
        .send(Message::request(Command::SessionStart, LOCAL_ID))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::SelfTarget);
    harness.server.expect_silence().await;
}

#[tokio::test]
async fn duplicate_request_ids_are_refused() {
    let mut harness = Harness::welcomed().await;
    let mut message = Message::request(Command::Ice, "peer-b");
    message.id = Some("fixed".into());

    let client = harness.client.clone();
    let pending = tokio::spawn({
        let message = message.clone();
        async move { client.send(message).await }
    });
    harness.server.next_message().await;

    let err = harness.client.send(message).await.unwrap_err();
    assert_eq!(err, ClientError::DuplicateRequestId("fixed".into()));

    harness.server.push(json!({ "id": "fixed", "ok": true }));
    assert!(within(pending).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn request_timeout_forgets_the_request() {
    let config = ClientConfig::builder()
        .request_timeout(Duration::from_millis(50))
        .build();
    let mut harness = Harness::welcomed_with(config).await;

    let err = harness
        .client
        .send(Message::request(Command::Offer, "peer-b"))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Timeout);

    // A late answer is dropped without disturbing the connection.
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    let client = harness.client.clone();
    let next = tokio::spawn(async move { client.send(Message::request(Command::Ice, "peer-b")).await });
    let ice = harness.server.next_message().await;
    harness.server.respond(&ice, true);
    assert!(within(next).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn closing_the_connection_fails_pending_requests() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let pending =
        tokio::spawn(async move { client.send(Message::request(Command::Offer, "peer-b")).await });
    harness.server.next_message().await;

    harness.server.close();

    assert_eq!(
        within(pending).await.unwrap().unwrap_err(),
        ClientError::ConnectionClosed
    );
    assert!(matches!(harness.next_event().await, ClientEvent::Close));
    assert!(!harness.client.is_open());
    let err = harness
        .client
        .send(Message::request(Command::Offer, "peer-b"))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::NotOpen);
}

#[tokio::test]
async fn malformed_frames_close_with_policy_violation() {
    let mut harness = Harness::welcomed().await;
    harness.server.send_raw("{not json");

    match harness.next_event().await {
        ClientEvent::Error(ClientError::Protocol(ProtocolError::Malformed(_))) => {}
        other => panic!("expected malformed error, got {other:?}"),
    }
    assert!(matches!(harness.next_event().await, ClientEvent::Close));
    match harness.server.next_outbound().await {
        Outbound::Close { code, .. } => assert_eq!(code, close_code::POLICY_VIOLATION),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn binary_frames_close_with_unsupported_payload() {
    let mut harness = Harness::welcomed().await;
    let _ = harness
        .server
        .link()
        .inbound
        .send(signal_fire_client::client::WireEvent::Binary(vec![1, 2, 3]));

    match harness.next_event().await {
        ClientEvent::Error(ClientError::Protocol(ProtocolError::UnsupportedPayload)) => {}
        other => panic!("expected unsupported payload, got {other:?}"),
    }
    match harness.server.next_outbound().await {
        Outbound::Close { code, .. } => assert_eq!(code, close_code::UNSUPPORTED_PAYLOAD),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn push_missing_required_fields_is_a_protocol_error() {
    let mut harness = Harness::welcomed().await;
    harness.server.push(json!({ "cmd": "offer", "origin": "peer-b" }));

    match harness.next_event().await {
        ClientEvent::Error(ClientError::Protocol(ProtocolError::MissingField { .. })) => {}
        other => panic!("expected missing field, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_commands_are_ignored() {
    let mut harness = Harness::welcomed().await;
    harness
        .server
        .push(json!({ "cmd": "broadcast", "origin": "peer-b", "data": {} }));
    harness.server.push(json!({ "id": "nobody-asked", "ok": true }));

    let client = harness.client.clone();
    let pending =
        tokio::spawn(async move { client.send(Message::request(Command::Ice, "peer-b")).await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    assert!(within(pending).await.unwrap().unwrap().is_ok());
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn close_sends_normal_closure() {
    let mut harness = Harness::welcomed().await;
    harness.client.close();

    match harness.server.next_outbound().await {
        Outbound::Close { code, .. } => assert_eq!(code, close_code::NORMAL),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(matches!(harness.next_event().await, ClientEvent::Close));
    assert_eq!(
        harness.client.wait_for_welcome().await,
        Ok(LOCAL_ID.to_string())
    );
}

#[tokio::test]
async fn dropping_every_handle_closes_the_link() {
    let Harness {
        client,
        events,
        mut server,
        factory,
    } = Harness::welcomed().await;
    drop(client);
    drop(events);
    drop(factory);

    match server.next_outbound().await {
        Outbound::Close { code, .. } => assert_eq!(code, close_code::NORMAL),
        other => panic!("expected close frame, got {other:?}"),
    }
    server.expect_closed().await;
}

#[tokio::test]
async fn sessions_do_not_keep_the_connection_alive() {
    let mut harness = Harness::welcomed().await;
    harness.server.from_peer("session-start", "peer-b", None);
    let session = match harness.next_event().await {
        ClientEvent::Session(session) => session,
        other => panic!("expected incoming session, got {other:?}"),
    };

    let Harness {
        client,
        events,
        mut server,
        ..
    } = harness;
    drop(client);
    drop(events);

    match server.next_outbound().await {
        Outbound::Close { code, .. } => assert_eq!(code, close_code::NORMAL),
        other => panic!("expected close frame, got {other:?}"),
    }
    server.expect_closed().await;
    assert_eq!(
        session.reject(None).await.unwrap_err(),
        ClientError::NotOpen
    );
}

#[tokio::test]
async fn protocol_error_before_welcome_is_returned_to_the_waiter() {
    let mut harness = Harness::start(ClientConfig::default());
    harness.server.send_raw(r#"{"cmd":"welcome"}"#);

    let err = within(harness.client.wait_for_welcome()).await.unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Protocol(ProtocolError::MissingField { .. })
        ),
        "unexpected error: {err:?}"
    );
    match harness.next_event().await {
        ClientEvent::Error(ClientError::Protocol(ProtocolError::MissingField { .. })) => {}
        other => panic!("expected missing field, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_for_welcome_fails_when_closed_first() {
    let harness = Harness::start(ClientConfig::default());
    harness.server.close();
    assert_eq!(
        within(harness.client.wait_for_welcome()).await,
        Err(ClientError::ConnectionClosed)
    );
}

#[tokio::test]
async fn create_peer_connection_applies_overrides_and_rejects_duplicates() {
    let harness = Harness::welcomed_with(
        ClientConfig::builder()
            .add_ice_server(vec!["stun:base.example.com".into()])
            .build(),
    )
    .await;

    let overrides = EngineConfig {
        ice_transport_policy: Some(IceTransportPolicy::Relay),
        ..Default::default()
    };
    let connection = harness
        .client
        .create_peer_connection("peer-b", Some(overrides))
        .await
        .expect("create");
    assert_eq!(connection.peer(), "peer-b");

    let engine = harness.engine(1).await;
    assert_eq!(
        engine.config().ice_transport_policy,
        Some(IceTransportPolicy::Relay)
    );
    assert_eq!(
        engine.config().ice_servers,
        Some(vec![IceServer::new("stun:base.example.com")])
    );

    let err = harness
        .client
        .create_peer_connection("peer-b", None)
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::PeerConnectionExists("peer-b".into()));

    let err = harness
        .client
        .create_peer_connection(LOCAL_ID, None)
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::SelfTarget);

    let found = harness.client.peer_connection("peer-b").await.expect("registered");
    assert_eq!(found.peer(), "peer-b");
    assert!(harness.client.peer_connection("peer-c").await.is_none());
}

#[tokio::test]
async fn engine_setup_failure_is_returned() {
    let harness = Harness::welcomed().await;
    harness.factory.fail_next();
    let err = harness
        .client
        .create_peer_connection("peer-b", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Engine(_)));
    assert!(harness.client.peer_connection("peer-b").await.is_none());
}
