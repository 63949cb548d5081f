use tokio::sync::mpsc;

/// Frames the client hands to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// What the transport observed on the duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Text(String),
    Binary(Vec<u8>),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Client side of an open duplex connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<WireEvent>,
}

/// Transport side of a [`Link`].
pub struct LinkRemote {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<WireEvent>,
}

impl Link {
    /// Both ends of an in-process link. Whatever drives the remote end plays
    /// the transport.
    pub fn pair() -> (Link, LinkRemote) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            LinkRemote {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }
}

impl LinkRemote {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(WireEvent::Text(text.into())).is_ok()
    }

    pub fn close(&self, code: Option<u16>, reason: impl Into<String>) -> bool {
        self.inbound
            .send(WireEvent::Closed {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}
