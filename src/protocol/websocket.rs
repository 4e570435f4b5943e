//! Networked transport over WebSocket
//!
//! Each transport owns one background task that dials the gateway, pumps
//! queued outbound frames into the socket and forwards inbound text frames
//! as [`TransportEvent::Message`].

use super::transport::{
    close_code, Transport, TransportEvent, TransportEvents, TransportFactory, TransportFault,
    TransportKind,
};
use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

/// Opens WebSocket transports
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn open(&self, url: &str, events: TransportEvents) -> Box<dyn Transport> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(run_socket(
            url.to_string(),
            events,
            outbound_rx,
            open.clone(),
            cancel.clone(),
        ));

        Box::new(WebSocketTransport {
            outbound: outbound_tx,
            open,
            cancel,
        })
    }
}

/// Handle to a WebSocket connection task
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Transport for WebSocketTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport("WebSocket is not open".to_string()));
        }
        self.outbound
            .send(text)
            .map_err(|_| Error::Transport("WebSocket task has stopped".to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn categorize(err: &WsError) -> TransportFault {
    match err {
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => TransportFault::Refused,
        WsError::Http(_) | WsError::HttpFormat(_) | WsError::Protocol(_) | WsError::Url(_) => {
            TransportFault::HandshakeFailure
        }
        other => TransportFault::from_message(&other.to_string()),
    }
}

async fn run_socket(
    url: String,
    events: TransportEvents,
    mut outbound: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(TransportEvent::Closed {
                code: close_code::NORMAL,
                reason: "closed before open".to_string(),
            });
            return;
        }
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                fault: categorize(&e),
                message: e.to_string(),
            });
            let _ = events.send(TransportEvent::Closed {
                code: close_code::ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut stream) = ws.split();

    let (code, reason) = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break (close_code::NORMAL, "client closing".to_string());
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    let _ = events.send(TransportEvent::Error {
                        fault: categorize(&e),
                        message: e.to_string(),
                    });
                    break (close_code::ABNORMAL, e.to_string());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Err(_) => tracing::debug!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((close_code::NORMAL, String::new()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error {
                        fault: categorize(&e),
                        message: e.to_string(),
                    });
                    break (close_code::ABNORMAL, e.to_string());
                }
                None => break (close_code::ABNORMAL, "stream ended".to_string()),
            },
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed { code, reason });
}
