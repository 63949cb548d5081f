use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::{Client, ClientEvent, Link, Outbound, Request, Status, WireEvent};
use crate::config::EngineConfig;
use crate::engine::EngineFactory;
use crate::error::ClientError;
use crate::peer::PeerConnection;
use crate::protocol::{Command, Message, ProtocolError, Push, close_code};
use crate::session::{Direction, IncomingSession, OutgoingSession, request_error};

enum Pending {
    Reply(oneshot::Sender<Result<Message, ClientError>>),
    SessionStart {
        peer: String,
        reply: oneshot::Sender<Result<OutgoingSession, ClientError>>,
    },
}

pub(super) struct Dispatcher {
    client: Client,
    link: Link,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<Status>,
    factory: Arc<dyn EngineFactory>,
    pending: HashMap<String, Pending>,
    starting: HashSet<String>,
    incoming: HashMap<String, IncomingSession>,
    outgoing: HashMap<String, OutgoingSession>,
    connections: HashMap<String, PeerConnection>,
    waiters: HashMap<String, Vec<oneshot::Sender<PeerConnection>>>,
    next_token: u64,
}

impl Dispatcher {
    pub(super) fn new(
        client: Client,
        link: Link,
        requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedSender<ClientEvent>,
        status: watch::Sender<Status>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            client,
            link,
            requests,
            events,
            status,
            factory,
            pending: HashMap::new(),
            starting: HashSet::new(),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            connections: HashMap::new(),
            waiters: HashMap::new(),
            next_token: 0,
        }
    }

    pub(super) async fn run(mut self) {
        debug!("signaling dispatcher started");
        loop {
            let flow = tokio::select! {
                event = self.link.inbound.recv() => match event {
                    Some(event) => self.on_wire(event).await,
                    None => {
                        debug!("signaling transport dropped");
                        self.shutdown();
                        ControlFlow::Break(())
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => {
                        debug!("every client handle dropped");
                        self.close("client dropped".to_string())
                    }
                },
            };
            if flow.is_break() {
                break;
            }
        }
        debug!("signaling dispatcher stopped");
    }

    async fn on_wire(&mut self, event: WireEvent) -> ControlFlow<()> {
        match event {
            WireEvent::Text(text) => {
                trace!(frame = %text, "received signaling frame");
                match Message::decode(&text) {
                    Ok(message) => self.dispatch(message).await,
                    Err(err) => self.fail(err),
                }
            }
            WireEvent::Binary(data) => {
                debug!(len = data.len(), "received binary signaling frame");
                self.fail(ProtocolError::UnsupportedPayload)
            }
            WireEvent::Error(err) => {
                warn!(error = %err, "signaling transport error");
                self.emit(ClientEvent::Error(ClientError::Transport(err)));
                ControlFlow::Continue(())
            }
            WireEvent::Closed { code, reason } => {
                info!(code = ?code, reason = %reason, "signaling connection closed");
                self.shutdown();
                ControlFlow::Break(())
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> ControlFlow<()> {
        if let Some(pending) = message.id.as_deref().and_then(|id| self.pending.remove(id)) {
            self.resolve(pending, message);
            return ControlFlow::Continue(());
        }
        if message.ok.is_some() {
            debug!(id = ?message.id, "response for unknown or abandoned request");
            return ControlFlow::Continue(());
        }
        match Push::decode(&message) {
            Ok(Some(push)) => {
                self.on_push(push).await;
                ControlFlow::Continue(())
            }
            Ok(None) => {
                debug!(cmd = ?message.cmd, id = ?message.id, "ignoring unrecognised message");
                ControlFlow::Continue(())
            }
            Err(err) => self.fail(err),
        }
    }

    fn resolve(&mut self, pending: Pending, response: Message) {
        match pending {
            Pending::Reply(reply) => {
                let _ = reply.send(Ok(response));
            }
            Pending::SessionStart { peer, reply } => {
                self.starting.remove(&peer);
                if !response.is_ok() {
                    let _ = reply.send(Err(request_error(&response)));
                    return;
                }
                let token = self.next_token();
                let session = OutgoingSession::new(self.client.clone(), peer.clone(), token);
                info!(peer_id = %peer, "session request acknowledged");
                self.outgoing.insert(peer, session.clone());
                if reply.send(Ok(session)).is_err() {
                    debug!("session requester went away before the acknowledgement");
                }
            }
        }
    }

    async fn on_push(&mut self, push: Push) {
        match push {
            Push::Welcome { id, config } => self.on_welcome(id, config),
            Push::SessionStart { origin } => self.on_session_start(origin),
            Push::SessionAccept { origin } => {
                if self.incoming.contains_key(&origin) {
                    debug!(peer_id = %origin, "ignoring accept for incoming session");
                } else if let Some(session) = self.outgoing.get(&origin).cloned() {
                    self.on_outgoing_accepted(session).await;
                } else {
                    debug!(peer_id = %origin, "accept for unknown session");
                }
            }
            Push::SessionReject { origin, reason } => {
                if self.incoming.contains_key(&origin) {
                    debug!(peer_id = %origin, "ignoring reject for incoming session");
                } else if let Some(session) = self.outgoing.get(&origin) {
                    session.handle_reject(reason);
                } else {
                    debug!(peer_id = %origin, "reject for unknown session");
                }
            }
            Push::SessionCancel { origin, reason } => {
                if let Some(session) = self.incoming.get(&origin) {
                    session.handle_cancel(reason);
                } else {
                    debug!(peer_id = %origin, "cancel for unknown session");
                }
            }
            Push::SessionTimeout { origin } => {
                if let Some(session) = self.incoming.get(&origin) {
                    session.handle_timeout();
                } else if let Some(session) = self.outgoing.get(&origin) {
                    session.handle_timeout();
                } else {
                    debug!(peer_id = %origin, "timeout for unknown session");
                }
            }
            push @ (Push::Offer { .. } | Push::Answer { .. } | Push::Ice { .. }) => {
                let Some(origin) = push.origin().map(str::to_string) else {
                    return;
                };
                let connection = match self.connections.get(&origin) {
                    Some(connection) => connection.clone(),
                    None => match self.open_peer_connection(origin.clone(), None).await {
                        Ok(connection) => {
                            info!(peer_id = %origin, cmd = %push.command(), "peer connection opened by remote signaling");
                            self.emit(ClientEvent::Incoming(connection.clone()));
                            connection
                        }
                        Err(err) => {
                            warn!(peer_id = %origin, error = %err, "failed to open peer connection");
                            self.emit(ClientEvent::Error(err));
                            return;
                        }
                    },
                };
                connection.deliver(push);
            }
        }
    }

    fn on_welcome(&mut self, id: String, config: Option<EngineConfig>) {
        if let Some(current) = self.status.borrow().local_id.clone() {
            warn!(local_id = %current, offered = %id, "ignoring repeated welcome");
            self.emit(ClientEvent::Error(ClientError::AlreadyWelcomed));
            return;
        }
        info!(local_id = %id, "welcomed by signaling server");
        self.status.send_modify(|status| {
            status.local_id = Some(id.clone());
            if let Some(config) = &config {
                status.config = status.config.merge(config);
            }
        });
        self.emit(ClientEvent::Welcome(id));
    }

    fn on_session_start(&mut self, origin: String) {
        if self.connections.contains_key(&origin)
            || self.incoming.contains_key(&origin)
            || self.outgoing.contains_key(&origin)
            || self.starting.contains(&origin)
        {
            warn!(peer_id = %origin, "session request while another is active");
            self.emit(ClientEvent::Error(ClientError::SessionActive(origin)));
            return;
        }
        let token = self.next_token();
        let session = IncomingSession::new(self.client.clone(), origin.clone(), token);
        info!(peer_id = %origin, "incoming session request");
        self.incoming.insert(origin, session.clone());
        self.emit(ClientEvent::Session(session));
    }

    async fn on_outgoing_accepted(&mut self, session: OutgoingSession) {
        if session.is_settled() {
            debug!(peer_id = %session.peer(), "accept for settled session");
            return;
        }
        match self
            .open_peer_connection(session.peer().to_string(), None)
            .await
        {
            Ok(connection) => {
                if let Err(err) = session.handle_accept(connection) {
                    debug!(peer_id = %session.peer(), error = %err, "session settled before accept");
                }
            }
            Err(err) => {
                warn!(peer_id = %session.peer(), error = %err, "failed to open accepted peer connection");
                session.handle_error(err.clone());
                self.emit(ClientEvent::Error(err));
            }
        }
    }

    async fn on_request(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::Send { message, reply } => {
                self.write(message, Pending::Reply(reply));
            }
            Request::Forget { id } => {
                if let Some(Pending::SessionStart { peer, .. }) = self.pending.remove(&id) {
                    self.starting.remove(&peer);
                }
            }
            Request::CreateSession { peer, id, reply } => {
                if let Err(err) = self.check_session_target(&peer) {
                    let _ = reply.send(Err(err));
                    return ControlFlow::Continue(());
                }
                let mut message = Message::request(Command::SessionStart, peer.clone());
                message.id = Some(id);
                self.starting.insert(peer.clone());
                self.write(message, Pending::SessionStart { peer, reply });
            }
            Request::CreatePeerConnection {
                peer,
                config,
                reply,
            } => {
                let _ = reply.send(self.open_peer_connection(peer, config).await);
            }
            Request::AwaitPeerConnection { peer, reply } => match self.connections.get(&peer) {
                Some(connection) => {
                    let _ = reply.send(connection.clone());
                }
                None => {
                    prune_waiters(&mut self.waiters, &peer);
                    self.waiters.entry(peer).or_default().push(reply);
                }
            },
            Request::PeerConnection { peer, reply } => {
                let _ = reply.send(self.connections.get(&peer).cloned());
            }
            Request::SessionSettled {
                direction,
                peer,
                token,
            } => match direction {
                Direction::Incoming => {
                    if self.incoming.get(&peer).is_some_and(|s| s.token() == token) {
                        self.incoming.remove(&peer);
                    }
                    prune_waiters(&mut self.waiters, &peer);
                }
                Direction::Outgoing => {
                    if self.outgoing.get(&peer).is_some_and(|s| s.token() == token) {
                        self.outgoing.remove(&peer);
                    }
                }
            },
            Request::PeerConnectionClosed { peer, token } => {
                if self
                    .connections
                    .get(&peer)
                    .is_some_and(|connection| connection.token() == token)
                {
                    debug!(peer_id = %peer, "removing closed peer connection");
                    self.connections.remove(&peer);
                }
            }
            Request::Close { reason } => return self.close(reason),
        }
        ControlFlow::Continue(())
    }

    fn close(&mut self, reason: String) -> ControlFlow<()> {
        info!(reason = %reason, "closing signaling connection");
        let _ = self.link.outbound.send(Outbound::Close {
            code: close_code::NORMAL,
            reason,
        });
        self.shutdown();
        ControlFlow::Break(())
    }

    fn check_session_target(&self, peer: &str) -> Result<(), ClientError> {
        if self.is_local(peer) {
            return Err(ClientError::SelfTarget);
        }
        if self.connections.contains_key(peer) {
            return Err(ClientError::PeerConnectionExists(peer.to_string()));
        }
        if self.starting.contains(peer)
            || self.incoming.contains_key(peer)
            || self.outgoing.contains_key(peer)
        {
            return Err(ClientError::SessionActive(peer.to_string()));
        }
        Ok(())
    }

    /// Writes a request and registers it for its response. Failures settle
    /// `pending` immediately.
    fn write(&mut self, mut message: Message, pending: Pending) {
        let id = message
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let result = if message.target.as_deref().is_some_and(|t| self.is_local(t)) {
            Err(ClientError::SelfTarget)
        } else if self.pending.contains_key(&id) {
            Err(ClientError::DuplicateRequestId(id.clone()))
        } else {
            message.encode().map_err(ClientError::from).and_then(|text| {
                self.link
                    .outbound
                    .send(Outbound::Text(text))
                    .map_err(|_| ClientError::ConnectionClosed)
            })
        };
        match result {
            Ok(()) => {
                trace!(request_id = %id, cmd = ?message.cmd, "request sent");
                self.pending.insert(id, pending);
            }
            Err(err) => {
                debug!(request_id = %id, error = %err, "request not sent");
                match pending {
                    Pending::Reply(reply) => {
                        let _ = reply.send(Err(err));
                    }
                    Pending::SessionStart { peer, reply } => {
                        self.starting.remove(&peer);
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }

    async fn open_peer_connection(
        &mut self,
        peer: String,
        overrides: Option<EngineConfig>,
    ) -> Result<PeerConnection, ClientError> {
        if self.is_local(&peer) {
            return Err(ClientError::SelfTarget);
        }
        if self.connections.contains_key(&peer) {
            return Err(ClientError::PeerConnectionExists(peer));
        }
        let base = self.status.borrow().config.clone();
        let config = match overrides {
            Some(overrides) => base.merge(&overrides),
            None => base,
        };
        let handle = self.factory.create(&config).await?;
        let token = self.next_token();
        let connection = PeerConnection::spawn(self.client.clone(), peer.clone(), handle, token);
        info!(peer_id = %peer, "peer connection created");
        if let Some(waiters) = self.waiters.remove(&peer) {
            for waiter in waiters {
                let _ = waiter.send(connection.clone());
            }
        }
        self.connections.insert(peer, connection.clone());
        Ok(connection)
    }

    /// Reports a protocol violation and closes the connection with the
    /// matching code.
    fn fail(&mut self, err: ProtocolError) -> ControlFlow<()> {
        warn!(error = %err, code = err.close_code(), "signaling protocol violation");
        let _ = self.link.outbound.send(Outbound::Close {
            code: err.close_code(),
            reason: err.to_string(),
        });
        let err = ClientError::from(err);
        self.status
            .send_modify(|status| status.closed_by = Some(err.clone()));
        self.emit(ClientEvent::Error(err));
        self.shutdown();
        ControlFlow::Break(())
    }

    /// Marks the connection closed. Dropping the pending replies fails their
    /// requests with `ConnectionClosed`; sessions stay as they are.
    fn shutdown(&mut self) {
        self.status.send_modify(|status| status.open = false);
        self.pending.clear();
        self.starting.clear();
        self.waiters.clear();
        self.emit(ClientEvent::Close);
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            trace!("client events receiver dropped");
        }
    }

    fn is_local(&self, peer: &str) -> bool {
        self.status.borrow().local_id.as_deref() == Some(peer)
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Drops waiters for `peer` whose caller stopped listening.
fn prune_waiters(
    waiters: &mut HashMap<String, Vec<oneshot::Sender<PeerConnection>>>,
    peer: &str,
) {
    if let Some(pending) = waiters.get_mut(peer) {
        pending.retain(|waiter| !waiter.is_closed());
        if pending.is_empty() {
            waiters.remove(peer);
        }
    }
}
