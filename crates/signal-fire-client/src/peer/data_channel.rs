use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::engine::{ChannelEngine, ChannelEvent, Payload};
use crate::error::ClientError;

const EVENT_CAPACITY: usize = 64;

pub(crate) type ChannelRegistry = Arc<Mutex<HashMap<String, DataChannel>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Open,
    Message(Payload),
    Error(String),
    Close,
}

/// A labelled channel on a peer connection. Cloning yields another handle to
/// the same channel.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    label: String,
    raw: Arc<dyn ChannelEngine>,
    events: broadcast::Sender<DataChannelEvent>,
    state: watch::Sender<ChannelState>,
}

impl DataChannel {
    /// Wraps an engine channel and starts forwarding its notifications. Once
    /// the channel closes it drops out of `registry`.
    pub(crate) fn wrap(
        raw: Arc<dyn ChannelEngine>,
        registry: Weak<Mutex<HashMap<String, DataChannel>>>,
    ) -> Self {
        let channel = Self {
            inner: Arc::new(ChannelInner {
                label: raw.label().to_string(),
                raw: raw.clone(),
                events: broadcast::channel(EVENT_CAPACITY).0,
                state: watch::Sender::new(ChannelState::Connecting),
            }),
        };
        match raw.take_events() {
            Some(events) => {
                tokio::spawn(pump(Arc::downgrade(&channel.inner), events, registry));
            }
            None => warn!(
                label = %channel.inner.label,
                "data channel notifications already claimed; events will not be forwarded"
            ),
        }
        channel
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn raw(&self) -> &Arc<dyn ChannelEngine> {
        &self.inner.raw
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<usize, ClientError> {
        if self.state() == ChannelState::Closed {
            return Err(ClientError::DataChannelClosed(self.inner.label.clone()));
        }
        Ok(self.inner.raw.send(payload.into()).await?)
    }

    /// Waits until the channel is open. Fails if it closes first.
    pub async fn opened(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.subscribe();
        match state
            .wait_for(|state| *state != ChannelState::Connecting)
            .await
            .map(|state| *state)
        {
            Ok(ChannelState::Open) => Ok(()),
            _ => Err(ClientError::DataChannelClosed(self.inner.label.clone())),
        }
    }

    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == ChannelState::Closed).await;
    }

    /// Requests closure and resolves once the engine confirms it.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        self.inner.raw.close().await?;
        self.closed().await;
        Ok(())
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.inner.label)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

async fn pump(
    inner: Weak<ChannelInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Weak<Mutex<HashMap<String, DataChannel>>>,
) {
    while let Some(event) = events.recv().await {
        let Some(channel) = inner.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Open => {
                debug!(label = %channel.label, "data channel open");
                channel.state.send_replace(ChannelState::Open);
                let _ = channel.events.send(DataChannelEvent::Open);
            }
            ChannelEvent::Message(payload) => {
                trace!(label = %channel.label, "data channel message");
                let _ = channel.events.send(DataChannelEvent::Message(payload));
            }
            ChannelEvent::Error(err) => {
                warn!(label = %channel.label, error = %err, "data channel error");
                let _ = channel.events.send(DataChannelEvent::Error(err));
            }
            ChannelEvent::Close => {
                debug!(label = %channel.label, "data channel closed");
                channel.raw.detach();
                channel.state.send_replace(ChannelState::Closed);
                let _ = channel.events.send(DataChannelEvent::Close);
                if let Some(registry) = registry.upgrade() {
                    let mut channels = registry.lock().await;
                    let current = channels
                        .get(&channel.label)
                        .is_some_and(|entry| Arc::ptr_eq(&entry.inner, &channel));
                    if current {
                        channels.remove(&channel.label);
                    }
                }
                break;
            }
        }
    }
}
