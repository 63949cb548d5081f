//! In-memory engine that records every call and lets callers inject
//! notifications. Used by the test suites.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelEngine, ChannelEvent, EngineEvent, EngineFactory, EngineHandle, LocalTrack,
    NegotiationEngine, Payload,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    CreateDataChannel(String),
    AddTrack,
    Close,
    Detach,
}

#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    fail_next: AtomicBool,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }

    /// Makes the next `create` call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, config: &EngineConfig) -> Result<EngineHandle, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Setup("mock engine refused".into()));
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine {
            config: config.clone(),
            events_tx,
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
        });
        self.engines.lock().push(engine.clone());
        Ok(EngineHandle {
            engine: engine as Arc<dyn NegotiationEngine>,
            events,
        })
    }
}

pub struct MockEngine {
    config: EngineConfig,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    calls: Mutex<Vec<EngineCall>>,
    local: Mutex<Option<SessionDescription>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    offers: AtomicUsize,
    detached: AtomicBool,
}

impl MockEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Delivers a notification as if the engine raised it.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("mock-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocalDescription(description.clone()));
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemoteDescription(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelEngine>, EngineError> {
        self.record(EngineCall::CreateDataChannel(label.to_string()));
        let channel = MockChannel::new(label);
        self.channels.lock().push(channel.clone());
        Ok(channel as Arc<dyn ChannelEngine>)
    }

    async fn add_track(&self, _track: LocalTrack) -> Result<(), EngineError> {
        self.record(EngineCall::AddTrack);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        Ok(())
    }

    fn detach(&self) {
        self.record(EngineCall::Detach);
        self.detached.store(true, Ordering::SeqCst);
    }
}

pub struct MockChannel {
    label: String,
    sent: Mutex<Vec<Payload>>,
    close_requested: AtomicBool,
    detached: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            close_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl ChannelEngine for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Payload) -> Result<usize, EngineError> {
        let len = match &payload {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        };
        self.sent.lock().push(payload);
        Ok(len)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_requested.store(true, Ordering::SeqCst);
        // The engine confirms closure asynchronously.
        self.emit(ChannelEvent::Close);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}
