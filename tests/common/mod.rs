//! Shared test fixtures: an in-process signaling server and a scripted media engine

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use robolink::pipeline::{
    BusMessage, ConnectivityState, MediaEngine, MediaSession, PipelineError, PipelineEvents,
    PipelineSpec,
};
use robolink::signaling::{IceCandidateRecord, SignalingMessage};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// SDP answer accepted by the negotiation sanity check
pub const ANSWER_SDP: &str = "v=0\r\no=- 4 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// Poll `check` until it holds, panicking after [`WAIT`]
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A `ws://` URL nothing listens on
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ws://127.0.0.1:{}", port)
}

enum PeerCommand {
    Send(String),
    Close,
}

/// Server side of one client connection
pub struct ServerPeer {
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl ServerPeer {
    /// Next message from the client
    pub async fn next_message(&mut self) -> SignalingMessage {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("Timed out waiting for client message")
            .expect("Client disconnected")
    }

    pub fn send(&self, msg: SignalingMessage) {
        self.send_raw(&msg.encode().unwrap());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.commands.send(PeerCommand::Send(text.to_string()));
    }

    /// Close the connection from the server side
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    /// Wait for the client to go away, discarding anything it still sends
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.inbound.recv().await.is_some() {}
        })
        .await
        .expect("Client did not disconnect");
    }
}

/// Minimal relay standing in for the cloud signaling server
pub struct TestSignalingServer {
    url: String,
    peers: mpsc::UnboundedReceiver<ServerPeer>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestSignalingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let (in_tx, inbound) = mpsc::unbounded_channel();
                let (commands, cmd_rx) = mpsc::unbounded_channel();
                tokio::spawn(serve_peer(ws, in_tx, cmd_rx));
                let _ = peers_tx.send(ServerPeer { inbound, commands });
            }
        });

        Self {
            url,
            peers,
            accepted,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of WebSocket connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next client to connect
    pub async fn accept(&mut self) -> ServerPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("Timed out waiting for a client")
            .expect("Server stopped")
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_peer(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(msg) = SignalingMessage::decode(&text) {
                        let _ = inbound.send(msg);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            cmd = commands.recv() => match cmd {
                Some(PeerCommand::Send(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Observations of, and controls over, a [`ScriptedEngine`]
#[derive(Default)]
pub struct EngineProbe {
    live: AtomicUsize,
    max_live: AtomicUsize,
    starts: AtomicUsize,
    fail_start: AtomicBool,
    hang_start: AtomicBool,
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<Arc<dyn PipelineEvents>>>,
}

impl EngineProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were ever alive at once
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make `start` wait forever, like an engine stuck opening a device
    pub fn hang_starts(&self, hang: bool) {
        self.hang_start.store(hang, Ordering::SeqCst);
    }

    /// Media operations performed so far, e.g. `remote-answer`, `candidate:c1`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Remote candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("candidate:").map(str::to_string))
            .collect()
    }

    fn events(&self) -> Arc<dyn PipelineEvents> {
        self.events.lock().clone().expect("No session was started")
    }

    /// Report a connectivity change from the most recent session
    pub fn emit_state(&self, state: ConnectivityState) {
        self.events().on_state_changed(state);
    }

    /// Post a bus message from the most recent session
    pub fn emit_bus(&self, message: BusMessage) {
        self.events().on_bus(message);
    }
}

/// In-memory media engine that behaves like a well-mannered WebRTC stack
pub struct ScriptedEngine {
    probe: Arc<EngineProbe>,
}

impl ScriptedEngine {
    pub fn new(probe: Arc<EngineProbe>) -> Arc<Self> {
        Arc::new(Self { probe })
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn start(
        &self,
        _spec: &PipelineSpec,
        events: Arc<dyn PipelineEvents>,
    ) -> Result<Box<dyn MediaSession>, PipelineError> {
        if self.probe.hang_start.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.probe.fail_start.load(Ordering::SeqCst) {
            return Err(PipelineError::Start("camera unavailable".to_string()));
        }

        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_live.fetch_max(live, Ordering::SeqCst);
        *self.probe.events.lock() = Some(events.clone());

        events.on_negotiation_needed();

        Ok(Box::new(ScriptedSession {
            probe: self.probe.clone(),
            events,
            stopped: AtomicBool::new(false),
        }))
    }
}

struct ScriptedSession {
    probe: Arc<EngineProbe>,
    events: Arc<dyn PipelineEvents>,
    stopped: AtomicBool,
}

impl ScriptedSession {
    fn record(&self, call: String) {
        self.probe.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaSession for ScriptedSession {
    async fn create_offer(&self) -> Result<String, PipelineError> {
        self.record("create-offer".to_string());
        Ok("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=robot\r\nt=0 0\r\n".to_string())
    }

    async fn set_local_description(&self, _sdp: &str) -> Result<(), PipelineError> {
        self.record("local-description".to_string());
        // Gathering starts once the local description is applied
        self.events
            .on_ice_candidate(0, "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string());
        Ok(())
    }

    async fn set_remote_answer(&self, _sdp: &str) -> Result<(), PipelineError> {
        self.record("remote-answer".to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateRecord) -> Result<(), PipelineError> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn stop(&self) -> Result<(), PipelineError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
