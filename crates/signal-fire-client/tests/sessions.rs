mod support;

use serde_json::json;
use signal_fire_client::engine::mock::EngineCall;
use signal_fire_client::protocol::SessionDescription;
use signal_fire_client::{ClientError, ClientEvent, IncomingSession, SessionEvent, SessionState};
use support::{Harness, LOCAL_ID, next_broadcast, sdp, within};

async fn incoming_session(harness: &mut Harness, peer: &str) -> IncomingSession {
    harness.server.from_peer("session-start", peer, None);
    match harness.next_event().await {
        ClientEvent::Session(session) => session,
        other => panic!("expected incoming session, got {other:?}"),
    }
}

#[tokio::test]
async fn outgoing_session_accepted_opens_peer_connection() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });

    let request = harness.server.next_message().await;
    assert_eq!(request.cmd.as_deref(), Some("session-start"));
    assert_eq!(request.target.as_deref(), Some("peer-b"));

    // Still waiting for the server's acknowledgement.
    let err = harness.client.create_session("peer-b").await.unwrap_err();
    assert_eq!(err, ClientError::SessionActive("peer-b".into()));

    harness.server.respond(&request, true);
    let session = within(creating).await.unwrap().expect("session acknowledged");
    assert_eq!(session.peer(), "peer-b");
    assert!(matches!(session.state(), SessionState::Pending));
    let mut events = session.subscribe();

    harness.server.from_peer("session-accept", "peer-b", None);

    match next_broadcast(&mut events).await {
        SessionEvent::Accepted(connection) => assert_eq!(connection.peer(), "peer-b"),
        other => panic!("expected accepted, got {other:?}"),
    }
    assert!(matches!(
        next_broadcast(&mut events).await,
        SessionEvent::Settled
    ));
    assert!(matches!(session.state(), SessionState::Accepted(_)));
    assert_eq!(harness.factory.created(), 1);
    assert!(harness.client.peer_connection("peer-b").await.is_some());

    // The accepted peer now has a connection, so a new request is refused.
    let err = harness.client.create_session("peer-b").await.unwrap_err();
    assert_eq!(err, ClientError::PeerConnectionExists("peer-b".into()));
}

#[tokio::test]
async fn acknowledged_outgoing_session_blocks_a_second_request() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    let session = within(creating).await.unwrap().unwrap();
    assert!(matches!(session.state(), SessionState::Pending));

    let err = harness.client.create_session("peer-b").await.unwrap_err();
    assert_eq!(err, ClientError::SessionActive("peer-b".into()));
    harness.server.expect_silence().await;
}

#[tokio::test]
async fn pending_incoming_session_blocks_an_outgoing_request() {
    let mut harness = Harness::welcomed().await;
    let _session = incoming_session(&mut harness, "peer-b").await;

    let err = harness.client.create_session("peer-b").await.unwrap_err();
    assert_eq!(err, ClientError::SessionActive("peer-b".into()));
    harness.server.expect_silence().await;
}

#[tokio::test]
async fn peer_connection_may_open_while_a_session_is_pending() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;

    // Only an existing connection blocks a new one.
    let connection = harness
        .client
        .create_peer_connection("peer-b", None)
        .await
        .expect("connection alongside pending session");
    assert_eq!(connection.peer(), "peer-b");
    assert!(matches!(session.state(), SessionState::Pending));
    harness.server.expect_silence().await;

    let err = harness.client.create_session("peer-b").await.unwrap_err();
    assert_eq!(err, ClientError::PeerConnectionExists("peer-b".into()));
}

#[tokio::test]
async fn outgoing_session_rejected_with_reason() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    let session = within(creating).await.unwrap().unwrap();
    let mut events = session.subscribe();

    harness.server.from_peer(
        "session-reject",
        "peer-b",
        Some(json!({ "message": "busy" })),
    );

    match next_broadcast(&mut events).await {
        SessionEvent::Rejected(reason) => assert_eq!(reason.as_deref(), Some("busy")),
        other => panic!("expected rejected, got {other:?}"),
    }
    assert!(matches!(
        next_broadcast(&mut events).await,
        SessionEvent::Settled
    ));
    assert_eq!(harness.factory.created(), 0);

    // Settled sessions leave the registry.
    let client = harness.client.clone();
    let again = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    assert_eq!(request.cmd.as_deref(), Some("session-start"));
    harness.server.respond(&request, true);
    within(again).await.unwrap().expect("second request");
}

#[tokio::test]
async fn refused_session_start_reports_reason() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness
        .server
        .respond_with_reason(&request, false, "peer-b is not connected");

    let err = within(creating).await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::Request("peer-b is not connected".into()));

    // The reservation is released.
    let client = harness.client.clone();
    let again = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    within(again).await.unwrap().expect("retry");
}

#[tokio::test]
async fn session_to_self_is_refused() {
    let mut harness = Harness::welcomed().await;
    let err = harness.client.create_session(LOCAL_ID).await.unwrap_err();
    assert_eq!(err, ClientError::SelfTarget);
    harness.server.expect_silence().await;
}

#[tokio::test]
async fn cancel_settles_once() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    let session = within(creating).await.unwrap().unwrap();

    let cancelling = tokio::spawn({
        let session = session.clone();
        async move { session.cancel(Some("changed my mind".into())).await }
    });
    let request = harness.server.next_message().await;
    assert_eq!(request.cmd.as_deref(), Some("session-cancel"));
    assert_eq!(request.target.as_deref(), Some("peer-b"));
    assert_eq!(request.reason().as_deref(), Some("changed my mind"));
    harness.server.respond(&request, true);
    within(cancelling).await.unwrap().expect("cancelled");

    match session.state() {
        SessionState::Canceled(reason) => assert_eq!(reason.as_deref(), Some("changed my mind")),
        other => panic!("expected canceled, got {other:?}"),
    }
    assert_eq!(
        session.cancel(None).await.unwrap_err(),
        ClientError::AlreadySettled
    );
    harness.server.expect_silence().await;

    // A late accept for the cancelled session is ignored.
    harness.server.from_peer("session-accept", "peer-b", None);
    harness.server.expect_silence().await;
    assert_eq!(harness.factory.created(), 0);
}

#[tokio::test]
async fn timeouts_settle_both_directions() {
    let mut harness = Harness::welcomed().await;
    let client = harness.client.clone();
    let creating = tokio::spawn(async move { client.create_session("peer-b").await });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    let outgoing = within(creating).await.unwrap().unwrap();

    let incoming = incoming_session(&mut harness, "peer-c").await;

    harness.server.from_peer("session-timeout", "peer-b", None);
    harness.server.from_peer("session-timeout", "peer-c", None);

    assert!(matches!(
        within(outgoing.settled()).await,
        SessionState::TimedOut
    ));
    assert!(matches!(
        within(incoming.settled()).await,
        SessionState::TimedOut
    ));
}

#[tokio::test]
async fn incoming_session_accept_waits_for_the_requesters_offer() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;
    assert_eq!(session.peer(), "peer-b");
    let mut events = session.subscribe();

    let accepting = tokio::spawn({
        let session = session.clone();
        async move { session.accept().await }
    });
    let request = harness.server.next_message().await;
    assert_eq!(request.cmd.as_deref(), Some("session-accept"));
    assert_eq!(request.target.as_deref(), Some("peer-b"));
    harness.server.respond(&request, true);

    harness
        .server
        .from_peer("offer", "peer-b", Some(sdp("offer", "remote-offer")));

    match harness.next_event().await {
        ClientEvent::Incoming(connection) => assert_eq!(connection.peer(), "peer-b"),
        other => panic!("expected incoming connection, got {other:?}"),
    }
    let connection = within(accepting).await.unwrap().expect("accepted");
    assert_eq!(connection.peer(), "peer-b");
    assert!(matches!(
        next_broadcast(&mut events).await,
        SessionEvent::Accepted(_)
    ));
    assert!(matches!(
        next_broadcast(&mut events).await,
        SessionEvent::Settled
    ));

    let answer = harness.server.next_message().await;
    assert_eq!(answer.cmd.as_deref(), Some("answer"));
    assert_eq!(answer.target.as_deref(), Some("peer-b"));
    assert_eq!(
        answer.data.as_ref().unwrap()["sdp"],
        json!({ "type": "answer", "sdp": "mock-answer" })
    );

    let engine = harness.engine(1).await;
    assert_eq!(
        engine.calls()[..3],
        [
            EngineCall::SetRemoteDescription(SessionDescription::offer("remote-offer")),
            EngineCall::CreateAnswer,
            EngineCall::SetLocalDescription(SessionDescription::answer("mock-answer")),
        ]
    );
}

#[tokio::test]
async fn cancel_while_accepting_fails_the_accept() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;

    let accepting = tokio::spawn({
        let session = session.clone();
        async move { session.accept().await }
    });
    let request = harness.server.next_message().await;
    harness.server.respond(&request, true);
    harness.server.from_peer(
        "session-cancel",
        "peer-b",
        Some(json!({ "message": "gave up" })),
    );

    let err = within(accepting).await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::SessionSettled("canceled".into()));
    match session.state() {
        SessionState::Canceled(reason) => assert_eq!(reason.as_deref(), Some("gave up")),
        other => panic!("expected canceled, got {other:?}"),
    }
}

#[tokio::test]
async fn settled_incoming_session_cannot_be_accepted() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;
    harness.server.from_peer("session-cancel", "peer-b", None);

    assert!(matches!(
        within(session.settled()).await,
        SessionState::Canceled(None)
    ));
    assert_eq!(
        session.accept().await.unwrap_err(),
        ClientError::AlreadySettled
    );
    harness.server.expect_silence().await;
}

#[tokio::test]
async fn incoming_session_reject_sends_reason() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;

    let rejecting = tokio::spawn({
        let session = session.clone();
        async move { session.reject(Some("not now".into())).await }
    });
    let request = harness.server.next_message().await;
    assert_eq!(request.cmd.as_deref(), Some("session-reject"));
    assert_eq!(request.reason().as_deref(), Some("not now"));
    harness.server.respond(&request, true);
    within(rejecting).await.unwrap().expect("rejected");

    match session.state() {
        SessionState::Rejected(reason) => assert_eq!(reason.as_deref(), Some("not now")),
        other => panic!("expected rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn refused_accept_settles_with_error() {
    let mut harness = Harness::welcomed().await;
    let session = incoming_session(&mut harness, "peer-b").await;

    let accepting = tokio::spawn({
        let session = session.clone();
        async move { session.accept().await }
    });
    let request = harness.server.next_message().await;
    harness
        .server
        .respond_with_reason(&request, false, "session expired");

    let err = within(accepting).await.unwrap().unwrap_err();
    assert_eq!(err, ClientError::Request("session expired".into()));
    assert!(matches!(session.state(), SessionState::Error(_)));
}

#[tokio::test]
async fn second_session_from_same_peer_is_reported() {
    let mut harness = Harness::welcomed().await;
    let _first = incoming_session(&mut harness, "peer-b").await;
    harness.server.from_peer("session-start", "peer-b", None);

    match harness.next_event().await {
        ClientEvent::Error(ClientError::SessionActive(peer)) => assert_eq!(peer, "peer-b"),
        other => panic!("expected SessionActive, got {other:?}"),
    }
}
