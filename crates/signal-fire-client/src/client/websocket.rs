use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{Client, ClientEvents, Link, Outbound, WireEvent};
use crate::config::ClientConfig;
use crate::engine::EngineFactory;
use crate::error::ClientError;
use crate::protocol::{PROTOCOL, ProtocolError};

/// Opens a websocket to the signaling server, negotiates the sub-protocol and
/// waits for the welcome. `http(s)` URLs are mapped to `ws(s)`.
pub async fn connect_with(
    url: &str,
    factory: Arc<dyn EngineFactory>,
    config: ClientConfig,
) -> Result<(Client, ClientEvents), ClientError> {
    let url = websocket_url(url)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| ClientError::Setup(format!("invalid websocket request: {err}")))?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL));

    let (ws_stream, response) = connect_async(request).await.map_err(|err| match err {
        WsError::Protocol(WsProtocolError::SecWebSocketSubProtocolError(reason)) => {
            ClientError::Protocol(ProtocolError::ProtocolMismatch {
                expected: PROTOCOL.to_string(),
                actual: reason.to_string(),
            })
        }
        err => ClientError::Setup(format!("websocket connect failed: {err}")),
    })?;
    let selected = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if selected != PROTOCOL {
        warn!(
            expected = PROTOCOL,
            actual = %selected,
            "server did not select the signaling protocol"
        );
        return Err(ProtocolError::ProtocolMismatch {
            expected: PROTOCOL.to_string(),
            actual: selected,
        }
        .into());
    }
    info!(url = %url, "signaling websocket connected");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<WireEvent>();

    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(err) = ws_write.send(Message::Close(Some(frame))).await {
                        debug!(error = %err, "failed to send close frame");
                    }
                    break;
                }
            }
        }
        let _ = ws_write.close().await;
    });

    tokio::spawn(async move {
        let mut closed = None;
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let _ = inbound_tx.send(WireEvent::Text(text));
                }
                Ok(Message::Binary(data)) => {
                    let _ = inbound_tx.send(WireEvent::Binary(data));
                }
                Ok(Message::Close(frame)) => {
                    closed = Some(match frame {
                        Some(frame) => WireEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => WireEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    });
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "signaling websocket error");
                    let _ = inbound_tx.send(WireEvent::Error(err.to_string()));
                    break;
                }
            }
        }
        let closed = closed.unwrap_or(WireEvent::Closed {
            code: None,
            reason: "stream ended".to_string(),
        });
        let _ = inbound_tx.send(closed);
    });

    let welcome_timeout = config.welcome_timeout;
    let (client, events) = Client::spawn(
        Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        factory,
        config,
    );
    match tokio::time::timeout(welcome_timeout, client.wait_for_welcome()).await {
        Ok(Ok(local_id)) => {
            debug!(local_id = %local_id, "signaling session ready");
            Ok((client, events))
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            warn!(
                timeout_ms = welcome_timeout.as_millis() as u64,
                "no welcome from signaling server"
            );
            client.close();
            Err(ClientError::Timeout)
        }
    }
}

fn websocket_url(raw: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(raw)
        .map_err(|err| ClientError::Setup(format!("invalid signaling url {raw}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ClientError::Setup(format!(
                "unsupported signaling url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_schemes_to_websocket() {
        assert_eq!(
            websocket_url("https://signal.example.com/socket#x")
                .unwrap()
                .as_str(),
            "wss://signal.example.com/socket"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:8080/").unwrap().as_str(),
            "ws://127.0.0.1:8080/"
        );
        assert_eq!(
            websocket_url("ws://localhost:3003/?token=a")
                .unwrap()
                .as_str(),
            "ws://localhost:3003/?token=a"
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            websocket_url("ftp://example.com"),
            Err(ClientError::Setup(_))
        ));
        assert!(matches!(websocket_url("not a url"), Err(ClientError::Setup(_))));
    }
}
