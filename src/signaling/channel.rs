//! WebSocket connection to the signaling server

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::message::SignalingMessage;
use super::tls::{self, TlsOptions};

/// Default time allowed for DNS, TCP, TLS and the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound messages buffered between the socket reader and the consumer
const INBOUND_CAPACITY: usize = 64;

/// Time allowed for the close frame to be flushed on `close()`
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Options used when opening the signaling connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub tls: TlsOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: TlsOptions::default(),
        }
    }
}

/// Cloneable handle for queueing outbound messages.
///
/// Sending never waits on the socket; frames are queued for the writer task.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl SignalingSender {
    /// Create a sender feeding an arbitrary frame queue
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Serialize and queue a message
    pub fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        let json = msg.encode()?;
        debug!("Queueing {} message ({} bytes)", msg.message_type(), json.len());
        self.tx
            .send(Message::Text(json))
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An active connection to the signaling server
pub struct SignalingChannel {
    sender: SignalingSender,
    inbound: mpsc::Receiver<SignalingMessage>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Connect to the signaling server and join the room named by `room_id`
    pub async fn connect(
        server_url: &str,
        room_id: &str,
        options: &ConnectOptions,
    ) -> Result<Self, TransportError> {
        let secure = server_url.starts_with("wss://");
        if !secure && !server_url.starts_with("ws://") {
            return Err(TransportError::InvalidUrl(server_url.to_string()));
        }

        let connector = if secure {
            tls::connector(&options.tls)?
        } else {
            None
        };

        let handshake = connect_async_tls_with_config(server_url, None, false, connector);
        let (ws_stream, _) = tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(options.connect_timeout))?
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        info!("Connected to signaling server {}", server_url);

        let channel = Self::from_stream(ws_stream);
        channel.send(SignalingMessage::join_room(room_id))?;
        info!("Joined room {} as {}", room_id, super::WORKSTATION_ROLE);

        Ok(channel)
    }

    /// Wrap an established WebSocket and start the reader and writer tasks
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(write_loop(write, out_rx, cancel.clone()));
        let reader = tokio::spawn(read_loop(read, in_tx, cancel.clone()));

        Self {
            sender: SignalingSender::new(out_tx),
            inbound: in_rx,
            cancel,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Queue a message for the server
    pub fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        self.sender.send(msg)
    }

    /// Cloneable handle for queueing messages from elsewhere on the loop
    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Next inbound message.
    ///
    /// Returns `None` once the server closes the connection, the transport
    /// fails, or the channel is closed locally.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.recv().await
    }

    /// Whether `close()` was called or either socket task has stopped
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.inbound.close();

        if let Some(mut writer) = self.writer.take() {
            // Give the writer a moment to flush the close frame
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                debug!("Signaling writer did not finish within {:?}, aborting", CLOSE_GRACE);
                writer.abort();
                let _ = writer.await;
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn write_loop<W>(mut write: W, mut out_rx: mpsc::UnboundedReceiver<Message>, cancel: CancellationToken)
where
    W: futures_util::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let dropped = discard_pending(&mut out_rx);
                if dropped > 0 {
                    debug!("Discarding {} queued signaling frames on close", dropped);
                }
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = write.send(frame).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

async fn read_loop<R, E>(mut read: R, in_tx: mpsc::Sender<SignalingMessage>, cancel: CancellationToken)
where
    R: futures_util::Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match SignalingMessage::decode(&text) {
                Ok(msg) => {
                    debug!("Received {} message", msg.message_type());
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed signaling message: {} ({})", e, truncate(&text));
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("Signaling server closed the connection: {:?}", frame);
                break;
            }
            None => {
                info!("Signaling connection ended");
                break;
            }
            Some(Err(e)) => {
                warn!("Signaling receive failed: {}", e);
                break;
            }
            Some(Ok(_)) => continue,
        }
    }
    cancel.cancel();
}

/// Drain frames that were queued but never written
fn discard_pending(out_rx: &mut mpsc::UnboundedReceiver<Message>) -> usize {
    out_rx.close();
    let mut dropped = 0;
    while out_rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

fn truncate(text: &str) -> &str {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
