//! The signaling hub.
//!
//! A [`Client`] is a cheap handle onto a dispatcher task which owns the
//! connection and every registry: pending requests, pending sessions in both
//! directions, and live peer connections. Handles talk to it over a command
//! channel, so registry checks and inserts never interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::config::{ClientConfig, EngineConfig};
use crate::engine::EngineFactory;
use crate::error::ClientError;
use crate::peer::PeerConnection;
use crate::protocol::Message;
use crate::session::{Direction, IncomingSession, OutgoingSession};

mod dispatcher;
mod link;
mod websocket;

pub use link::{Link, LinkRemote, Outbound, WireEvent};
pub use websocket::connect_with;

pub type ClientEvents = mpsc::UnboundedReceiver<ClientEvent>;

#[derive(Debug)]
pub enum ClientEvent {
    /// The server assigned our identity.
    Welcome(String),
    /// Another peer asked for a session.
    Session(IncomingSession),
    /// A peer connection was opened on behalf of a remote peer's signaling.
    Incoming(PeerConnection),
    Error(ClientError),
    Close,
}

/// Connection status published by the dispatcher.
#[derive(Debug, Clone, Default)]
pub(crate) struct Status {
    pub(crate) open: bool,
    pub(crate) local_id: Option<String>,
    pub(crate) config: EngineConfig,
    /// The error that tore the connection down, if any.
    pub(crate) closed_by: Option<ClientError>,
}

pub(crate) enum Request {
    Send {
        message: Message,
        reply: oneshot::Sender<Result<Message, ClientError>>,
    },
    Forget {
        id: String,
    },
    CreateSession {
        peer: String,
        id: String,
        reply: oneshot::Sender<Result<OutgoingSession, ClientError>>,
    },
    CreatePeerConnection {
        peer: String,
        config: Option<EngineConfig>,
        reply: oneshot::Sender<Result<PeerConnection, ClientError>>,
    },
    AwaitPeerConnection {
        peer: String,
        reply: oneshot::Sender<PeerConnection>,
    },
    PeerConnection {
        peer: String,
        reply: oneshot::Sender<Option<PeerConnection>>,
    },
    SessionSettled {
        direction: Direction,
        peer: String,
        token: u64,
    },
    PeerConnectionClosed {
        peer: String,
        token: u64,
    },
    Close {
        reason: String,
    },
}

/// Handle onto the signaling connection.
///
/// The dispatcher keeps running while an application handle exists. Once the
/// last `Client` clone is dropped the connection is closed, even if sessions
/// or peer connections are still held.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    requests: Requests,
    status: watch::Receiver<Status>,
    request_timeout: Option<Duration>,
}

/// Command channel into the dispatcher. Handles given to sessions and peer
/// connections hold the weak side so the registries never keep the
/// dispatcher alive.
#[derive(Clone)]
enum Requests {
    Owned(mpsc::UnboundedSender<Request>),
    Weak(mpsc::WeakUnboundedSender<Request>),
}

impl Requests {
    fn send(&self, request: Request) -> Result<(), ClientError> {
        let sent = match self {
            Requests::Owned(tx) => tx.send(request),
            Requests::Weak(tx) => match tx.upgrade() {
                Some(tx) => tx.send(request),
                None => return Err(ClientError::ConnectionClosed),
            },
        };
        sent.map_err(|_| ClientError::ConnectionClosed)
    }

    fn downgrade(&self) -> Requests {
        match self {
            Requests::Owned(tx) => Requests::Weak(tx.downgrade()),
            Requests::Weak(tx) => Requests::Weak(tx.clone()),
        }
    }
}

impl Client {
    /// Starts the dispatcher over an already open link. The first event is
    /// normally [`ClientEvent::Welcome`].
    pub fn spawn(
        link: Link,
        factory: Arc<dyn EngineFactory>,
        config: ClientConfig,
    ) -> (Client, ClientEvents) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            open: true,
            local_id: None,
            config: config.engine.clone(),
            closed_by: None,
        });
        let client = Client {
            inner: Arc::new(ClientInner {
                requests: Requests::Owned(requests_tx),
                status: status_rx,
                request_timeout: config.request_timeout,
            }),
        };
        let dispatcher = dispatcher::Dispatcher::new(
            client.downgrade(),
            link,
            requests_rx,
            events_tx,
            status_tx,
            factory,
        );
        tokio::spawn(dispatcher.run());
        (client, events_rx)
    }

    /// Identity assigned by the server's welcome, if it arrived.
    pub fn local_id(&self) -> Option<String> {
        self.inner.status.borrow().local_id.clone()
    }

    /// Engine configuration used for new peer connections.
    pub fn config(&self) -> EngineConfig {
        self.inner.status.borrow().config.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.status.borrow().open
    }

    /// Resolves with the local identity once the welcome arrives. If the
    /// connection closes first, fails with the error that closed it.
    pub async fn wait_for_welcome(&self) -> Result<String, ClientError> {
        let mut status = self.inner.status.clone();
        let status = status
            .wait_for(|status| status.local_id.is_some() || !status.open)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        match &status.local_id {
            Some(id) => Ok(id.clone()),
            None => Err(status
                .closed_by
                .clone()
                .unwrap_or(ClientError::ConnectionClosed)),
        }
    }

    /// Asks `peer` for a session. Resolves once the server acknowledges the
    /// request; the returned session settles when the peer answers.
    pub async fn create_session(&self, peer: &str) -> Result<OutgoingSession, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        self.request(Request::CreateSession {
            peer: peer.to_string(),
            id: id.clone(),
            reply,
        })?;
        self.await_reply(id, rx).await
    }

    /// Opens a peer connection to `peer` without a session handshake.
    /// `config` overrides the client's engine configuration field by field.
    pub async fn create_peer_connection(
        &self,
        peer: &str,
        config: Option<EngineConfig>,
    ) -> Result<PeerConnection, ClientError> {
        self.call(|reply| Request::CreatePeerConnection {
            peer: peer.to_string(),
            config,
            reply,
        })
        .await?
    }

    pub async fn peer_connection(&self, peer: &str) -> Option<PeerConnection> {
        self.call(|reply| Request::PeerConnection {
            peer: peer.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    /// Sends a request and waits for the response carrying the same id. A
    /// fresh id is assigned when the message has none.
    pub async fn send(&self, message: Message) -> Result<Message, ClientError> {
        self.submit(message)?.wait().await
    }

    /// Closes the connection. Pending requests fail with
    /// [`ClientError::ConnectionClosed`].
    pub fn close(&self) {
        let _ = self.inner.requests.send(Request::Close {
            reason: "client closed".to_string(),
        });
    }

    /// Queues `message` for sending right away and returns the pending
    /// response. Messages submitted in order are written in order.
    pub(crate) fn submit(&self, mut message: Message) -> Result<PendingResponse, ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotOpen);
        }
        let id = message
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let (reply, rx) = oneshot::channel();
        self.request(Request::Send { message, reply })?;
        Ok(PendingResponse {
            client: self.clone(),
            id,
            rx,
        })
    }

    pub(crate) async fn await_peer_connection(
        &self,
        peer: &str,
    ) -> Result<PeerConnection, ClientError> {
        self.call(|reply| Request::AwaitPeerConnection {
            peer: peer.to_string(),
            reply,
        })
        .await
    }

    pub(crate) fn session_settled(&self, direction: Direction, peer: &str, token: u64) {
        let _ = self.inner.requests.send(Request::SessionSettled {
            direction,
            peer: peer.to_string(),
            token,
        });
    }

    pub(crate) fn peer_connection_closed(&self, peer: &str, token: u64) {
        let _ = self.inner.requests.send(Request::PeerConnectionClosed {
            peer: peer.to_string(),
            token,
        });
    }

    /// A handle that does not keep the dispatcher running.
    fn downgrade(&self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                requests: self.inner.requests.downgrade(),
                status: self.inner.status.clone(),
                request_timeout: self.inner.request_timeout,
            }),
        }
    }

    fn request(&self, request: Request) -> Result<(), ClientError> {
        self.inner.requests.send(request)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(build(reply))?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    async fn await_reply<T>(
        &self,
        id: String,
        rx: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let outcome = match self.inner.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(request_id = %id, "request timed out");
                    let _ = self.inner.requests.send(Request::Forget { id });
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.status.borrow();
        f.debug_struct("Client")
            .field("local_id", &status.local_id)
            .field("open", &status.open)
            .finish()
    }
}

/// A request written to the wire whose response has not arrived yet.
pub(crate) struct PendingResponse {
    client: Client,
    id: String,
    rx: oneshot::Receiver<Result<Message, ClientError>>,
}

impl PendingResponse {
    pub(crate) async fn wait(self) -> Result<Message, ClientError> {
        self.client.await_reply(self.id, self.rx).await
    }
}

