//! WebSocket transport over tokio-tungstenite.
//!
//! `WsDialer::dial` spawns a socket task immediately and returns a handle;
//! the dial outcome and all subsequent activity arrive as [`TransportEvent`]s
//! in the connection actor's inbox. Outbound frames travel over an unbounded
//! channel so [`Transport::send`] stays synchronous.

use aw_protocol::{ErrorInfo, WireFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::Error;
use crate::transport::{DialRequest, Dialer, Transport, TransportEvent};

/// Production dialer: one WebSocket per dial.
#[derive(Debug, Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(
        &self,
        request: DialRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> Box<dyn Transport> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_socket(request, events, out_rx, shutdown_rx));
        Box::new(WsTransport {
            out_tx,
            shutdown_tx,
            task,
        })
    }
}

struct WsTransport {
    out_tx: mpsc::UnboundedSender<WireFrame>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Transport for WsTransport {
    fn send(&mut self, frame: WireFrame) -> Result<(), Error> {
        self.out_tx
            .send(frame)
            .map_err(|_| Error::Transport("socket task has exited".to_owned()))
    }

    fn destroy(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}

/// Convert a URL into a WebSocket client request, attaching an
/// `Authorization: Bearer <token>` header when a token is supplied.
///
/// `IntoClientRequest` populates the required upgrade headers
/// (`Sec-WebSocket-Key`, `Upgrade`, `Connection`, `Sec-WebSocket-Version`)
/// before the auth header is injected.
fn build_ws_request(
    url: &str,
    token: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header;

    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid URL '{url}': {e}"))?;
    if let Some(token) = token {
        let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| format!("invalid auth header: {e}"))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    Ok(request)
}

async fn run_socket(
    request: DialRequest,
    events: mpsc::Sender<TransportEvent>,
    mut out_rx: mpsc::UnboundedReceiver<WireFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ws_request = match build_ws_request(&request.url, request.token.as_deref()) {
        Ok(r) => r,
        Err(message) => {
            let _ = events
                .send(TransportEvent::Error {
                    error: ErrorInfo::new(40000, Some(400), message),
                    recoverable: false,
                })
                .await;
            return;
        }
    };

    let (ws, _response) = match tokio_tungstenite::connect_async(ws_request).await {
        Ok(ok) => ok,
        Err(e) => {
            // Network-level dial failures are retryable; the machine decides
            // when to give up.
            let _ = events
                .send(TransportEvent::Error {
                    error: ErrorInfo::new(80000, Some(503), format!("dial failed: {e}")),
                    recoverable: true,
                })
                .await;
            return;
        }
    };
    if events.send(TransportEvent::Opened).await.is_err() {
        return;
    }
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = out_rx.recv() => {
                let message = match frame {
                    None => break,
                    Some(WireFrame::Text(text)) => Message::Text(text.into()),
                    Some(WireFrame::Binary(bytes)) => Message::Binary(bytes.into()),
                };
                if let Err(e) = write.send(message).await {
                    warn!(error = %e, "websocket send failed");
                    let _ = events
                        .send(TransportEvent::Error {
                            error: ErrorInfo::new(80000, None, e.to_string()),
                            recoverable: true,
                        })
                        .await;
                    break;
                }
            }
            incoming = read.next() => match incoming {
                None => {
                    let _ = events.send(TransportEvent::Closed(None)).await;
                    break;
                }
                Some(Err(e)) => {
                    let _ = events
                        .send(TransportEvent::Error {
                            error: ErrorInfo::new(80000, None, e.to_string()),
                            recoverable: true,
                        })
                        .await;
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    if events
                        .send(TransportEvent::Frame(WireFrame::Text(text.as_str().to_owned())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if events
                        .send(TransportEvent::Frame(WireFrame::Binary(bytes.to_vec())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    let _ = events.send(TransportEvent::Closed(None)).await;
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_header_is_attached() {
        let request = build_ws_request("ws://localhost:9090/ws?format=json", Some("tok-1")).unwrap();
        let auth = request.headers().get("Authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer tok-1");
        assert!(request.headers().contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(build_ws_request("not a url", None).is_err());
    }
}
