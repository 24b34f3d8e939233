//! Persistent WebSocket transport.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::wire::{AudioBytes, StreamMessage};
use super::{Transport, TransportContext};
use crate::frame::{PerfVector, RequestFrame, ResponseEnvelope};
use crate::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the reader task hands to the exchange in progress.
#[derive(Debug)]
enum Inbound {
    Response(ResponseEnvelope),
    Failure(TransportError),
}

/// An open socket plus its reader task.
struct Connection {
    sink: SplitSink<WsStream, Message>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Exchanges frames over one long-lived WebSocket.
///
/// The socket is opened on the first exchange and re-opened on the next
/// exchange after any connection failure. Exchanges are serialized; the
/// socket is never multiplexed.
pub struct StreamTransport {
    url: Url,
    ctx: TransportContext,
    connection: Mutex<Option<Connection>>,
}

impl StreamTransport {
    /// Creates a transport for the WebSocket at `url`. Does not connect.
    pub fn new(url: Url, ctx: TransportContext) -> Self {
        Self {
            url,
            ctx,
            connection: Mutex::new(None),
        }
    }

    /// The service URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        info!(url = %self.url, "Connecting stream transport");

        let (ws, _) = tokio::time::timeout(self.ctx.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::connect_failed(&self.url, "connect timed out"))?
            .map_err(|e| TransportError::connect_failed(&self.url, e))?;

        info!(url = %self.url, "Stream transport connected");

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(stream, tx, self.ctx.clone()));

        Ok(Connection {
            sink,
            inbound: rx,
            reader,
        })
    }

    async fn round_trip(
        &self,
        conn: &mut Connection,
        frame: &RequestFrame,
        timestamp_ms: i64,
    ) -> Result<ResponseEnvelope, TransportError> {
        // Left over from an abandoned exchange; would be charged to this frame.
        let mut discarded = 0u32;
        while conn.inbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded replies to abandoned frames");
        }

        let message = StreamMessage::RequestMessage(timestamp_ms, AudioBytes(frame.to_le_bytes()));
        let text = serde_json::to_string(&message).map_err(TransportError::invalid_message)?;
        conn.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::connect_failed(&self.url, e))?;

        let deadline = tokio::time::Instant::now() + self.ctx.response_timeout;
        loop {
            let inbound = match tokio::time::timeout_at(deadline, conn.inbound.recv()).await {
                Err(_) => {
                    return Err(TransportError::connect_failed(&self.url, "response timed out"))
                }
                Ok(None) => {
                    return Err(TransportError::connect_failed(&self.url, "connection closed"))
                }
                Ok(Some(inbound)) => inbound,
            };

            match inbound {
                Inbound::Response(envelope) if envelope.sent_at_ms < timestamp_ms => {
                    debug!(
                        stale = envelope.sent_at_ms,
                        awaiting = timestamp_ms,
                        "Skipping response to abandoned frame"
                    );
                }
                Inbound::Response(envelope) if envelope.sent_at_ms > timestamp_ms => {
                    return Err(TransportError::ResponseMismatch {
                        expected: timestamp_ms,
                        received: envelope.sent_at_ms,
                    });
                }
                Inbound::Response(envelope) => return envelope.validated(),
                Inbound::Failure(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &str {
        "stream"
    }

    fn concurrent(&self) -> bool {
        false
    }

    async fn exchange(
        &self,
        frame: &RequestFrame,
        timestamp_ms: i64,
    ) -> Result<ResponseEnvelope, TransportError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(TransportError::connect_failed(&self.url, "no connection"));
        };

        let result = self.round_trip(conn, frame, timestamp_ms).await;
        if let Err(TransportError::ConnectFailed { ref reason, .. }) = result {
            warn!(url = %self.url, %reason, "Dropping stream connection");
            *guard = None;
        }
        result
    }

    async fn close(&self) {
        if let Some(mut conn) = self.connection.lock().await.take() {
            if let Err(e) = conn.sink.close().await {
                debug!(url = %self.url, "Error closing stream transport: {e}");
            }
            info!(url = %self.url, "Stream transport closed");
        }
    }
}

/// Routes inbound messages until the socket closes.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<Inbound>,
    ctx: TransportContext,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("Stream transport closed by backend");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Stream transport socket error: {e}");
                break;
            }
        };

        let inbound = match serde_json::from_str::<StreamMessage>(&text) {
            Ok(StreamMessage::Response(sent_at_ms, audio, ping, volume, perf)) => {
                Inbound::Response(ResponseEnvelope {
                    sent_at_ms,
                    audio: audio.0,
                    round_trip_extra_ms: ping,
                    volume,
                    perf: PerfVector::from_slice(&perf),
                })
            }
            Ok(StreamMessage::Error(code, message)) => {
                warn!(%code, "Backend reported error: {message}");
                Inbound::Failure(TransportError::from_backend(code, message))
            }
            Ok(StreamMessage::ServerStats(volume, perf)) => {
                ctx.server_stats(volume, PerfVector::from_slice(&perf));
                continue;
            }
            Ok(StreamMessage::RequestMessage(..)) => {
                debug!("Ignoring echoed request message");
                continue;
            }
            Err(e) => {
                warn!("Undecodable message from backend: {e}");
                Inbound::Failure(TransportError::invalid_message(e))
            }
        };

        if tx.send(inbound).is_err() {
            break;
        }
    }

    debug!("Stream transport reader terminated");
}
