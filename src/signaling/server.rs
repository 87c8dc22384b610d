use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::{MatchCommand, MatchmakerHandle, matchmaker_actor};
use super::messages::{ClientMessage, ServerMessage};
use super::types::{OutboundMessage, SessionId};
use crate::token::TokenIssuer;

pub const DEFAULT_SIGNALING_PORT: u16 = 9001;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SignalingServer {
    handle: MatchmakerHandle,
    tokens: Arc<TokenIssuer>,
    abandon_after: Duration,
}

impl SignalingServer {
    pub fn new(tokens: Arc<TokenIssuer>, abandon_after: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<MatchCommand>(1024);
        tokio::spawn(matchmaker_actor(rx));

        Self {
            handle: MatchmakerHandle { tx },
            tokens,
            abandon_after,
        }
    }

    /// Handle for other components that need to talk to the matchmaker
    pub fn handle(&self) -> MatchmakerHandle {
        self.handle.clone()
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on {}", addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let handle = self.handle.clone();
            let tokens = self.tokens.clone();
            let abandon_after = self.abandon_after;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, tokens, abandon_after).await
                {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: MatchmakerHandle,
    tokens: Arc<TokenIssuer>,
    abandon_after: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Admission gate: the upgrade request must carry a valid token. A
    // refused upgrade never reaches the session layer.
    let gate = move |req: &Request, response: Response| match admission_token(req) {
        Some(token) => match tokens.validate(token) {
            Ok(_) => Ok(response),
            Err(e) => {
                warn!("Rejected connection from {}: {}", addr, e);
                Err(unauthorized("invalid admission token"))
            }
        },
        None => {
            warn!("Rejected connection from {}: no admission token", addr);
            Err(unauthorized("missing admission token"))
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, gate).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let session_id = SessionId::generate();
    info!("WebSocket connection from {} as {}", addr, session_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();
    let (evict_tx, mut evict_rx) = oneshot::channel::<()>();

    handle.admit(session_id, addr, tx.clone(), evict_tx).await;

    // One-shot abandonment timer; the actor decides whether it still applies
    let reap_handle = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(abandon_after).await;
        reap_handle.reap(session_id).await;
    });

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;
    let mut watch_evict = true;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", session_id);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                debug!("Ping sent to {}", session_id);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", session_id);
                break;
            }

            evicted = &mut evict_rx, if watch_evict => {
                match evicted {
                    Ok(()) => {
                        info!("Closing evicted session {}", session_id);
                        break;
                    }
                    // The actor already forgot this session; the connection
                    // itself may live on
                    Err(_) => watch_evict = false,
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &tx, &handle, session_id).await {
                            warn!("Message handling error: {}", e);
                        }
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", session_id);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", session_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handle.disconnect(session_id).await;

    send_task.abort();
    info!("WebSocket disconnected: {}", session_id);

    Ok(())
}

async fn handle_text_message(
    text: &str,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    handle: &MatchmakerHandle,
    session_id: SessionId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let err = ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            };
            let _ = tx.send(OutboundMessage::from(serde_json::to_string(&err)?));
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::FromClient { signal } => {
            handle.relay(session_id, signal).await;
        }
        ClientMessage::LinkEstablished => {
            handle.link_established(session_id).await;
        }
    }

    Ok(())
}

/// Token from the upgrade request's query string (`/?token=...`)
fn admission_token(req: &Request) -> Option<&str> {
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn token_extracted_from_query() {
        let req = upgrade_request("ws://localhost:9001/?token=abc.def.ghi");
        assert_eq!(admission_token(&req), Some("abc.def.ghi"));
    }

    #[test]
    fn token_found_among_other_params() {
        let req = upgrade_request("ws://localhost:9001/?v=2&token=abc");
        assert_eq!(admission_token(&req), Some("abc"));
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(admission_token(&upgrade_request("ws://localhost:9001/")), None);
        assert_eq!(
            admission_token(&upgrade_request("ws://localhost:9001/?other=1")),
            None
        );
    }

    #[test]
    fn unauthorized_response_is_401() {
        let response = unauthorized("missing admission token");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
