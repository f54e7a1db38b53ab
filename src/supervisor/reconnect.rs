//! Connect, run, tear down, retry

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::identity::{generate_robot_id, IdentityProvider, SessionIdentity};
use crate::negotiation::{NegotiationEngine, NegotiationError};
use crate::pipeline::{
    EventSink, MediaEngine, PipelineController, PipelineError, PipelineEvent, SessionEvent,
    StreamRouter,
};
use crate::signaling::{SignalingChannel, SignalingMessage};

use super::error::{SessionError, SupervisorError};
use super::ConnectionState;

/// Keeps exactly one session alive, rebuilding it from scratch on any failure
pub struct ReconnectSupervisor {
    controller: PipelineController,
    identity: Arc<dyn IdentityProvider>,
    state: watch::Sender<ConnectionState>,
    epoch: u64,
}

impl ReconnectSupervisor {
    pub fn new(engine: Arc<dyn MediaEngine>, identity: Arc<dyn IdentityProvider>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            controller: PipelineController::new(engine),
            identity,
            state,
            epoch: 0,
        }
    }

    /// Route incoming remote streams through `router`
    pub fn with_router(mut self, router: StreamRouter) -> Self {
        self.controller = self.controller.with_router(router);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of live pipeline handles (0 or 1)
    pub fn live_handles(&self) -> usize {
        self.controller.live_handles()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(epoch = self.epoch, "Connection state {} -> {}", previous, state);
        }
    }

    /// Run sessions until `shutdown` is cancelled.
    ///
    /// Returns `Ok` after a clean shutdown with the pipeline released and the
    /// signaling channel closed. Only an unusable configuration, or running
    /// out of `max_attempts`, ends the loop with an error.
    pub async fn start(
        &mut self,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        if let Err(e) = config.validate() {
            error!(state = %ConnectionState::Fatal, "Invalid configuration: {}", e);
            self.set_state(ConnectionState::Fatal);
            return Err(SupervisorError::Configuration(e.to_string()));
        }

        let identity =
            match generate_robot_id(self.identity.as_ref(), config.robot_name.as_deref()) {
                Ok(identity) => identity,
                Err(e) => {
                    error!(state = %ConnectionState::Fatal, "Cannot resolve robot id: {}", e);
                    self.set_state(ConnectionState::Fatal);
                    return Err(SupervisorError::Configuration(e.to_string()));
                }
            };
        info!("Robot id: {}", identity);

        let mut failures = 0u32;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.epoch += 1;
            self.set_state(ConnectionState::Connecting);

            let error = match self.run_epoch(&config, &identity, &shutdown).await {
                Ok(()) => break,
                Err(e) => e,
            };

            failures = count_failure(failures, self.state() == ConnectionState::Active);
            warn!(
                epoch = self.epoch,
                state = %self.state(),
                "Session ended: {}",
                error
            );
            self.set_state(ConnectionState::Reconnecting);

            if let Some(max) = config.max_attempts {
                if failures >= max {
                    error!(epoch = self.epoch, "Giving up after {} attempts", failures);
                    self.set_state(ConnectionState::Idle);
                    return Err(SupervisorError::AttemptsExhausted(failures));
                }
            }

            info!(
                epoch = self.epoch,
                "Reconnecting in {:?}", config.retry_interval
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.retry_interval) => {}
            }
        }

        self.set_state(ConnectionState::Idle);
        info!("Supervisor stopped");
        Ok(())
    }

    /// One connect/negotiate/run cycle.
    ///
    /// `Ok` means shutdown was requested. Everything built here is released
    /// before returning, pipeline first.
    async fn run_epoch(
        &mut self,
        config: &SupervisorConfig,
        identity: &SessionIdentity,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        let epoch = self.epoch;
        info!(epoch, "Connecting to {}", config.server_url);

        let options = config.connect_options();
        let mut channel = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = SignalingChannel::connect(&config.server_url, identity.as_str(), &options) => result?,
        };

        let (sink, mut events) = EventSink::channel(epoch);
        let started = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.controller.start(&config.pipeline, sink) => Some(result),
        };
        let handle = match started {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                channel.close().await;
                return Err(e.into());
            }
            None => {
                info!(epoch, "Shutdown requested while the pipeline was starting");
                channel.close().await;
                return Ok(());
            }
        };

        let result = match self.controller.commands() {
            Some(commands) => {
                let mut negotiation = NegotiationEngine::new(epoch, channel.sender(), commands);
                self.set_state(ConnectionState::Active);
                info!(epoch, "Session active");
                self.drive(&mut channel, &mut events, &mut negotiation, shutdown)
                    .await
            }
            None => Err(PipelineError::Stopped.into()),
        };

        self.controller.stop(handle).await;
        channel.close().await;
        debug!(epoch, "Session resources released");
        result
    }

    /// The coordinating loop: the only place session state is mutated
    async fn drive(
        &self,
        channel: &mut SignalingChannel,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        negotiation: &mut NegotiationEngine,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        let epoch = self.epoch;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(epoch, "Shutdown requested");
                    return Ok(());
                }

                message = channel.recv() => {
                    let Some(message) = message else {
                        return Err(SessionError::SignalingClosed);
                    };
                    let message_type = message.message_type();
                    if let Err(e) = handle_message(epoch, negotiation, message) {
                        error!(
                            epoch,
                            state = %negotiation.state(),
                            message_type,
                            "Failed to handle signaling message: {}",
                            e
                        );
                        return Err(e.into());
                    }
                }

                event = events.recv() => match event {
                    Some(SessionEvent::Pipeline(event)) => self.handle_pipeline_event(negotiation, event)?,
                    Some(SessionEvent::Completed(completion)) => {
                        if let Err(e) = negotiation.on_completion(completion) {
                            error!(
                                epoch,
                                state = %negotiation.state(),
                                "Negotiation step failed: {}",
                                e
                            );
                            return Err(e.into());
                        }
                    }
                    None => return Err(PipelineError::Stopped.into()),
                },
            }
        }
    }

    fn handle_pipeline_event(
        &self,
        negotiation: &mut NegotiationEngine,
        event: PipelineEvent,
    ) -> Result<(), SessionError> {
        let epoch = self.epoch;
        match event {
            PipelineEvent::NegotiationNeeded => negotiation.on_negotiation_needed()?,
            PipelineEvent::IceCandidate(candidate) => negotiation.on_local_candidate(candidate)?,
            PipelineEvent::StateChanged(connectivity) => {
                info!(epoch, "ICE connection state: {}", connectivity);
                if connectivity.is_terminal() {
                    return Err(SessionError::ConnectivityLost(connectivity));
                }
            }
            PipelineEvent::IncomingStream(stream) => self.controller.route_stream(stream),
            PipelineEvent::Bus(message) => {
                if let Some(e) = message.into_terminal() {
                    error!(epoch, state = %self.state(), "Pipeline failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Consecutive attempts that never became active
fn count_failure(failures: u32, reached_active: bool) -> u32 {
    if reached_active {
        0
    } else {
        failures.saturating_add(1)
    }
}

fn handle_message(
    epoch: u64,
    negotiation: &mut NegotiationEngine,
    message: SignalingMessage,
) -> Result<(), NegotiationError> {
    match message {
        SignalingMessage::Answer { sdp } => negotiation.on_answer(sdp),
        SignalingMessage::IceCandidate { candidate } => negotiation.on_remote_candidate(candidate),
        other => {
            warn!(
                epoch,
                state = %negotiation.state(),
                message_type = other.message_type(),
                "Unexpected inbound message, ignoring"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingSender;
    use parking_lot::Mutex;
    use std::io;

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_count_failure_resets_after_active() {
        assert_eq!(count_failure(0, false), 1);
        assert_eq!(count_failure(4, false), 5);
        assert_eq!(count_failure(4, true), 0);
    }

    #[test]
    fn test_count_failure_saturates() {
        assert_eq!(count_failure(u32::MAX, false), u32::MAX);
    }

    #[test]
    fn test_unexpected_message_logged_with_epoch() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (commands, _commands_rx) = mpsc::unbounded_channel();
        let mut negotiation = NegotiationEngine::new(7, SignalingSender::new(out_tx), commands);

        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            handle_message(7, &mut negotiation, SignalingMessage::join_room("other-robot"))
        });
        assert!(result.is_ok());

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        assert!(output.contains("Unexpected inbound message"));
        assert!(output.contains("epoch=7"));
        assert!(output.contains("join-room"));
    }
}
