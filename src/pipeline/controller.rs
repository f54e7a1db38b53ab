//! Ownership of the single live media session

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::PipelineError;
use super::events::{Completion, EventSink, SessionCommand};
use super::router::{IncomingStream, StreamRouter};
use super::{MediaEngine, MediaSession, PipelineSpec};

/// Time allowed for the engine to tear a session down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque reference to the live media session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandle {
    id: u64,
    epoch: u64,
}

impl PipelineHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

struct LiveSession {
    handle: PipelineHandle,
    session: Arc<dyn MediaSession>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    worker: JoinHandle<()>,
}

/// Owns the media engine and at most one running session
pub struct PipelineController {
    engine: Arc<dyn MediaEngine>,
    router: StreamRouter,
    live: Option<LiveSession>,
    next_id: u64,
}

impl PipelineController {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            router: StreamRouter::new(),
            live: None,
            next_id: 1,
        }
    }

    /// Use `router` for incoming remote streams
    pub fn with_router(mut self, router: StreamRouter) -> Self {
        self.router = router;
        self
    }

    /// Start a media session for `spec`.
    ///
    /// Any previous session is released first, so at most one handle exists.
    pub async fn start(
        &mut self,
        spec: &PipelineSpec,
        events: EventSink,
    ) -> Result<PipelineHandle, PipelineError> {
        if let Some(previous) = self.live.as_ref().map(|live| live.handle) {
            warn!("Pipeline {:?} still live, releasing it first", previous);
            self.stop(previous).await;
        }

        spec.validate()?;

        info!("Starting pipeline for epoch {}", events.epoch());
        let session: Arc<dyn MediaSession> =
            Arc::from(self.engine.start(spec, Arc::new(events.clone())).await?);

        let handle = PipelineHandle {
            id: self.next_id,
            epoch: events.epoch(),
        };
        self.next_id += 1;

        let (commands, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(session.clone(), rx, events));

        self.live = Some(LiveSession {
            handle,
            session,
            commands,
            worker,
        });

        info!("Pipeline started successfully");
        Ok(handle)
    }

    /// Queue feeding the live session's worker
    pub fn commands(&self) -> Option<mpsc::UnboundedSender<SessionCommand>> {
        self.live.as_ref().map(|live| live.commands.clone())
    }

    /// Release the session behind `handle`.
    ///
    /// Stale handles and repeated calls are no-ops.
    pub async fn stop(&mut self, handle: PipelineHandle) {
        if self.live.as_ref().map(|live| live.handle) != Some(handle) {
            debug!("Pipeline {:?} already stopped", handle);
            return;
        }
        let Some(live) = self.live.take() else {
            return;
        };

        info!("Closing pipeline for epoch {}", handle.epoch);
        drop(live.commands);
        live.worker.abort();

        match tokio::time::timeout(STOP_TIMEOUT, live.session.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Pipeline stop reported an error: {}", e),
            Err(_) => warn!("Pipeline did not stop within {:?}", STOP_TIMEOUT),
        }
    }

    /// Hand a remote stream to the consumer for its media kind
    pub fn route_stream(&self, stream: IncomingStream) {
        self.router.route(stream);
    }

    /// Number of live pipeline handles (0 or 1)
    pub fn live_handles(&self) -> usize {
        usize::from(self.live.is_some())
    }
}

/// Execute session commands one at a time, in submission order
async fn run_worker(
    session: Arc<dyn MediaSession>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: EventSink,
) {
    while let Some(command) = commands.recv().await {
        let completion = match command {
            SessionCommand::CreateOffer => {
                let result = match session.create_offer().await {
                    Ok(sdp) => session.set_local_description(&sdp).await.map(|()| sdp),
                    Err(e) => Err(e),
                };
                Completion::LocalOffer(result)
            }
            SessionCommand::SetRemoteAnswer(sdp) => {
                Completion::RemoteAnswer(session.set_remote_answer(&sdp).await)
            }
            SessionCommand::AddIceCandidate(candidate) => {
                let result = session.add_ice_candidate(&candidate).await;
                Completion::CandidateApplied { candidate, result }
            }
        };
        events.complete(completion);
    }
    debug!("Session worker for epoch {} finished", events.epoch());
}
