#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use signal_fire_client::client::{LinkRemote, Outbound};
use signal_fire_client::engine::mock::{MockEngine, MockEngineFactory};
use signal_fire_client::{Client, ClientConfig, ClientEvent, ClientEvents, Link, Message};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub const LOCAL_ID: &str = "local-peer";
const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

/// Yields to the runtime until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub async fn next_event(events: &mut ClientEvents) -> ClientEvent {
    within(events.recv()).await.expect("client events closed")
}

pub async fn next_broadcast<T: Clone>(events: &mut broadcast::Receiver<T>) -> T {
    within(events.recv()).await.expect("event stream closed")
}

/// Plays the signaling server on the far end of an in-process link.
pub struct FakeServer {
    remote: LinkRemote,
}

impl FakeServer {
    pub async fn next_outbound(&mut self) -> Outbound {
        within(self.remote.recv()).await.expect("client link closed")
    }

    pub async fn next_message(&mut self) -> Message {
        match self.next_outbound().await {
            Outbound::Text(text) => Message::decode(&text).expect("client wrote valid json"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Asserts the client wrote nothing for a short while.
    pub async fn expect_silence(&mut self) {
        let waited = timeout(Duration::from_millis(50), self.remote.recv()).await;
        if let Ok(Some(frame)) = waited {
            panic!("unexpected frame from client: {frame:?}");
        }
    }

    /// Asserts the client dropped its end of the link.
    pub async fn expect_closed(&mut self) {
        if let Some(frame) = within(self.remote.recv()).await {
            panic!("expected the link to end, got {frame:?}");
        }
    }

    pub fn push(&self, value: Value) {
        assert!(self.remote.send_text(value.to_string()), "client gone");
    }

    pub fn send_raw(&self, text: &str) {
        assert!(self.remote.send_text(text), "client gone");
    }

    pub fn welcome(&self, id: &str) {
        self.push(json!({ "cmd": "welcome", "data": { "id": id } }));
    }

    pub fn respond(&self, request: &Message, ok: bool) {
        self.push(json!({ "id": request.id, "ok": ok }));
    }

    pub fn respond_with_reason(&self, request: &Message, ok: bool, reason: &str) {
        self.push(json!({ "id": request.id, "ok": ok, "data": { "message": reason } }));
    }

    pub fn from_peer(&self, cmd: &str, origin: &str, data: Option<Value>) {
        let mut message = json!({ "cmd": cmd, "origin": origin });
        if let Some(data) = data {
            message["data"] = data;
        }
        self.push(message);
    }

    pub fn close(&self) {
        self.remote.close(Some(1000), "server going away");
    }

    pub fn link(&self) -> &LinkRemote {
        &self.remote
    }
}

pub struct Harness {
    pub client: Client,
    pub events: ClientEvents,
    pub server: FakeServer,
    pub factory: Arc<MockEngineFactory>,
}

impl Harness {
    /// Spawns a client over an in-process link without welcoming it.
    pub fn start(config: ClientConfig) -> Self {
        init_tracing();
        let (link, remote) = Link::pair();
        let factory = MockEngineFactory::new();
        let (client, events) = Client::spawn(link, factory.clone(), config);
        Self {
            client,
            events,
            server: FakeServer { remote },
            factory,
        }
    }

    /// Spawns a client and completes the welcome as [`LOCAL_ID`].
    pub async fn welcomed() -> Self {
        Self::welcomed_with(ClientConfig::default()).await
    }

    pub async fn welcomed_with(config: ClientConfig) -> Self {
        let mut harness = Self::start(config);
        harness.server.welcome(LOCAL_ID);
        match next_event(&mut harness.events).await {
            ClientEvent::Welcome(id) => assert_eq!(id, LOCAL_ID),
            other => panic!("expected welcome, got {other:?}"),
        }
        harness
    }

    pub async fn next_event(&mut self) -> ClientEvent {
        next_event(&mut self.events).await
    }

    /// Waits until the factory has created `count` engines and returns the last.
    pub async fn engine(&self, count: usize) -> Arc<MockEngine> {
        let factory = self.factory.clone();
        eventually(|| factory.created() >= count).await;
        self.factory.engines()[count - 1].clone()
    }
}

pub fn sdp(kind: &str, sdp: &str) -> Value {
    json!({ "sdp": { "type": kind, "sdp": sdp } })
}

pub fn candidate(value: &str) -> Value {
    json!({ "candidate": { "candidate": value, "sdpMid": "0", "sdpMLineIndex": 0 } })
}
