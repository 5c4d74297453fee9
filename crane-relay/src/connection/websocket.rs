//! WebSocket connections over TCP.

use super::{Connection, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Close frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

/// A server-side WebSocket connection.
///
/// Sink and stream halves are locked separately so one task can send while
/// another is parked in `recv()`.
pub struct WsConnection<S = TcpStream> {
    remote_addr: SocketAddr,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> std::fmt::Debug for WsConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl WsConnection<TcpStream> {
    /// Perform the server side of the WebSocket handshake on an accepted
    /// TCP stream.
    pub async fn accept(stream: TcpStream, remote_addr: SocketAddr) -> Result<Self, TransportError> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Self::from_stream(ws, remote_addr))
    }
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-upgraded WebSocket stream.
    pub fn from_stream(ws: WebSocketStream<S>, remote_addr: SocketAddr) -> Self {
        let (sink, stream) = ws.split();
        Self {
            remote_addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::binary(data.to_vec()))
            .await
            .map_err(map_send_error)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                // Role tokens are usually sent as text frames
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("{} sent close: {:?}", self.remote_addr, frame);
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self, reason: Option<&str>) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: truncate_reason(reason.unwrap_or_default()).into(),
        };
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

fn map_send_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        WsError::Io(ref io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
            TransportError::ConnectionClosed
        }
        other => TransportError::SendFailed(other.to_string()),
    }
}

/// Truncate a close reason to the frame limit without splitting a UTF-8
/// character.
fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
