//! Per-peer negotiation.
//!
//! Each [`PeerConnection`] owns a driver task that serialises engine
//! notifications and inbound signaling for one remote peer. Offers are only
//! produced when the engine asks for negotiation, so whichever side adds media
//! or channels first becomes the offerer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::engine::{
    ConnectionState, EngineEvent, EngineHandle, LocalTrack, NegotiationEngine, RemoteTrack,
};
use crate::error::{ClientError, EngineError};
use crate::protocol::{IceCandidate, Message, Push, SessionDescription};

mod data_channel;

use data_channel::ChannelRegistry;
pub use data_channel::{ChannelState, DataChannel, DataChannelEvent};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub enum PeerConnectionEvent {
    Connected,
    /// Negotiation failed; a `Close` follows.
    Failed,
    Close,
    Track(RemoteTrack),
    DataChannel(DataChannel),
}

impl fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConnectionEvent::Connected => f.write_str("Connected"),
            PeerConnectionEvent::Failed => f.write_str("Failed"),
            PeerConnectionEvent::Close => f.write_str("Close"),
            PeerConnectionEvent::Track(track) => {
                f.debug_tuple("Track").field(&track.id()).finish()
            }
            PeerConnectionEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(channel).finish()
            }
        }
    }
}

/// Inbound signaling and local requests for the driver task.
pub(crate) enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
    Close,
}

#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    peer: String,
    token: u64,
    client: Client,
    engine: Arc<dyn NegotiationEngine>,
    channels: ChannelRegistry,
    events: broadcast::Sender<PeerConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl PeerConnection {
    /// Wraps a freshly created engine and starts its driver task.
    pub(crate) fn spawn(client: Client, peer: String, handle: EngineHandle, token: u64) -> Self {
        let EngineHandle { engine, events } = handle;
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(Inner {
                peer,
                token,
                client,
                engine,
                channels: Arc::new(Mutex::new(HashMap::new())),
                events: broadcast::channel(EVENT_CAPACITY).0,
                state: watch::Sender::new(ConnectionState::New),
                signals,
            }),
        };
        tokio::spawn(connection.clone().drive(events, signals_rx));
        connection
    }

    /// The remote peer.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The engine behind this connection.
    pub fn engine(&self) -> &Arc<dyn NegotiationEngine> {
        &self.inner.engine
    }

    /// Opens a channel with `label`. Labels are unique per connection.
    pub async fn create_data_channel(&self, label: &str) -> Result<DataChannel, ClientError> {
        let mut channels = self.inner.channels.lock().await;
        if channels.contains_key(label) {
            return Err(ClientError::DataChannelExists(label.to_string()));
        }
        let raw = self.inner.engine.create_data_channel(label).await?;
        let channel = DataChannel::wrap(raw, Arc::downgrade(&self.inner.channels));
        channels.insert(label.to_string(), channel.clone());
        debug!(peer_id = %self.inner.peer, label, "created data channel");
        Ok(channel)
    }

    pub async fn data_channel(&self, label: &str) -> Option<DataChannel> {
        self.inner.channels.lock().await.get(label).cloned()
    }

    /// Adds a local media track; the engine asks for renegotiation.
    pub async fn add_track(&self, track: LocalTrack) -> Result<(), ClientError> {
        Ok(self.inner.engine.add_track(track).await?)
    }

    /// Closes the engine and waits for the connection to wind down.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner.engine.close().await?;
        let _ = self.inner.signals.send(Signal::Close);
        self.closed().await;
        Ok(())
    }

    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    pub(crate) fn token(&self) -> u64 {
        self.inner.token
    }

    /// Hands a negotiation push for this peer to the driver task.
    pub(crate) fn deliver(&self, push: Push) {
        let signal = match push {
            Push::Offer { sdp, .. } => Signal::Offer(sdp),
            Push::Answer { sdp, .. } => Signal::Answer(sdp),
            Push::Ice { candidate, .. } => Signal::Ice(candidate),
            other => {
                debug!(
                    peer_id = %self.inner.peer,
                    cmd = %other.command(),
                    "ignoring non-negotiation push"
                );
                return;
            }
        };
        if self.inner.signals.send(signal).is_err() {
            debug!(peer_id = %self.inner.peer, "peer connection driver gone; dropping signal");
        }
    }

    async fn drive(
        self,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        info!(peer_id = %self.inner.peer, "peer connection driver started");
        loop {
            tokio::select! {
                event = engine_events.recv() => {
                    let Some(event) = event else {
                        debug!(peer_id = %self.inner.peer, "engine notifications ended");
                        self.finish();
                        break;
                    };
                    if self.on_engine_event(event).await {
                        break;
                    }
                }
                signal = signals.recv() => {
                    match signal {
                        Some(Signal::Close) | None => {
                            self.finish();
                            break;
                        }
                        Some(signal) => self.on_signal(signal).await,
                    }
                }
            }
        }
        info!(peer_id = %self.inner.peer, "peer connection driver stopped");
    }

    /// Returns `true` once the connection has ended.
    async fn on_engine_event(&self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::NegotiationNeeded => {
                if let Err(err) = self.negotiate().await {
                    warn!(peer_id = %self.inner.peer, error = %err, "failed to create offer");
                }
            }
            EngineEvent::IceCandidate(Some(candidate)) => {
                trace!(peer_id = %self.inner.peer, candidate = %candidate.candidate, "local candidate");
                self.relay(Message::ice(self.inner.peer.clone(), &candidate));
            }
            EngineEvent::IceCandidate(None) => {
                debug!(peer_id = %self.inner.peer, "local candidate gathering complete");
            }
            EngineEvent::ConnectionStateChange(state) => {
                debug!(peer_id = %self.inner.peer, state = ?state, "connection state changed");
                match state {
                    ConnectionState::Connected => {
                        self.inner.state.send_replace(state);
                        let _ = self.inner.events.send(PeerConnectionEvent::Connected);
                    }
                    ConnectionState::Failed => {
                        warn!(peer_id = %self.inner.peer, "peer connection failed");
                        self.inner.state.send_replace(state);
                        let _ = self.inner.events.send(PeerConnectionEvent::Failed);
                        self.finish();
                        return true;
                    }
                    ConnectionState::Closed => {
                        self.finish();
                        return true;
                    }
                    other => {
                        self.inner.state.send_replace(other);
                    }
                }
            }
            EngineEvent::DataChannel(raw) => {
                let channel = DataChannel::wrap(raw, Arc::downgrade(&self.inner.channels));
                debug!(peer_id = %self.inner.peer, label = %channel.label(), "remote data channel");
                self.inner
                    .channels
                    .lock()
                    .await
                    .insert(channel.label().to_string(), channel.clone());
                let _ = self
                    .inner
                    .events
                    .send(PeerConnectionEvent::DataChannel(channel));
            }
            EngineEvent::Track(track) => {
                debug!(peer_id = %self.inner.peer, track_id = %track.id(), "remote track");
                let _ = self.inner.events.send(PeerConnectionEvent::Track(track));
            }
        }
        false
    }

    async fn on_signal(&self, signal: Signal) {
        let peer = &self.inner.peer;
        let result = match signal {
            Signal::Offer(sdp) => self.answer(sdp).await,
            Signal::Answer(sdp) => self.inner.engine.set_remote_description(sdp).await,
            Signal::Ice(candidate) => self.inner.engine.add_ice_candidate(candidate).await,
            Signal::Close => Ok(()),
        };
        if let Err(err) = result {
            warn!(peer_id = %peer, error = %err, "failed to apply remote signaling");
        }
    }

    async fn negotiate(&self) -> Result<(), EngineError> {
        let engine = &self.inner.engine;
        let offer = engine.create_offer().await?;
        engine.set_local_description(offer.clone()).await?;
        let local = engine.local_description().await.unwrap_or(offer);
        debug!(peer_id = %self.inner.peer, "sending offer");
        self.relay(Message::offer(self.inner.peer.clone(), &local));
        Ok(())
    }

    async fn answer(&self, offer: SessionDescription) -> Result<(), EngineError> {
        let engine = &self.inner.engine;
        engine.set_remote_description(offer).await?;
        let answer = engine.create_answer().await?;
        engine.set_local_description(answer.clone()).await?;
        let local = engine.local_description().await.unwrap_or(answer);
        debug!(peer_id = %self.inner.peer, "sending answer");
        self.relay(Message::answer(self.inner.peer.clone(), &local));
        Ok(())
    }

    /// Queues a signaling message in order; the acknowledgement is only logged.
    fn relay(&self, message: Message) {
        let peer = self.inner.peer.clone();
        match self.inner.client.submit(message) {
            Ok(pending) => {
                tokio::spawn(async move {
                    match pending.wait().await {
                        Ok(response) if !response.is_ok() => warn!(
                            peer_id = %peer,
                            reason = ?response.reason(),
                            "server refused signaling message"
                        ),
                        Ok(_) => {}
                        Err(err) => {
                            debug!(peer_id = %peer, error = %err, "signaling message not acknowledged")
                        }
                    }
                });
            }
            Err(err) => warn!(peer_id = %peer, error = %err, "failed to relay signaling message"),
        }
    }

    /// Tears the connection down once: detaches engine handlers, reports
    /// `Close`, and drops out of the client's registry.
    fn finish(&self) {
        let previous = self.inner.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        info!(peer_id = %self.inner.peer, "peer connection closed");
        self.inner.engine.detach();
        let _ = self.inner.events.send(PeerConnectionEvent::Close);
        self.inner
            .client
            .peer_connection_closed(&self.inner.peer, self.inner.token);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.inner.peer)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}
