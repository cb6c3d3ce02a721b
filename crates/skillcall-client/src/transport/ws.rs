use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use skillcall_common::Frame;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{ConnectError, Connector, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay connector over a WebSocket carrying one JSON [`Frame`] per text message.
///
/// The first frame sent is `auth`; the relay answers `auth_ok` or `auth_failed`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    auth_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, auth_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self, token: &str) -> BoxFuture<'static, Result<TransportLink, ConnectError>> {
        let url = self.url.clone();
        let token = token.to_string();
        let auth_timeout = self.auth_timeout;
        Box::pin(async move {
            let (mut ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ConnectError::Network(e.to_string()))?;

            send_frame(&mut ws, &Frame::Auth { token }).await?;
            let participant_id = match tokio::time::timeout(auth_timeout, read_auth_reply(&mut ws))
                .await
            {
                Ok(reply) => reply?,
                Err(_) => {
                    return Err(ConnectError::Network(format!(
                        "no auth reply within {auth_timeout:?}"
                    )))
                }
            };
            debug!(%url, participant = %participant_id, "relay accepted credential");

            Ok(spawn_pumps(ws, participant_id))
        })
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), ConnectError> {
    let text = frame
        .encode()
        .map_err(|e| ConnectError::Network(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectError::Network(e.to_string()))
}

async fn read_auth_reply(ws: &mut WsStream) -> Result<String, ConnectError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| ConnectError::Network(e.to_string()))?;
        match msg {
            Message::Text(text) => match Frame::decode(&text) {
                Ok(Frame::AuthOk { participant_id }) => return Ok(participant_id),
                Ok(Frame::AuthFailed { reason }) => return Err(ConnectError::Auth(reason)),
                Ok(other) => debug!(?other, "frame before auth reply ignored"),
                Err(e) => {
                    return Err(ConnectError::Network(format!("malformed auth reply: {e}")))
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ConnectError::Network(
        "connection closed before auth reply".into(),
    ))
}

/// Split the socket into a writer fed by `outbound` and a reader feeding `inbound`.
fn spawn_pumps(ws: WsStream, participant_id: String) -> TransportLink {
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, inbound) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("dropping unencodable frame: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!("relay write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match Frame::decode(&text) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("malformed frame from relay: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("relay read failed: {e}");
                    break;
                }
            }
        }
        debug!("relay reader finished");
    });

    TransportLink {
        participant_id,
        outbound,
        inbound,
    }
}
