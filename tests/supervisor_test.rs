//! Session lifecycle tests
//!
//! Runs the supervisor against an in-process signaling server and a scripted
//! media engine: connect, negotiate, fail, reconnect, shut down.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{
    eventually, refused_url, EngineProbe, ScriptedEngine, ServerPeer, TestSignalingServer,
    ANSWER_SDP, WAIT,
};
use robolink::identity::{MemoryIdentityStore, SessionIdentity};
use robolink::pipeline::{BusMessage, ConnectivityState};
use robolink::signaling::{IceCandidateRecord, SignalingMessage, WORKSTATION_ROLE};
use robolink::supervisor::{ConnectionState, ReconnectSupervisor, SupervisorError};
use robolink::SupervisorConfig;

type Finished = (ReconnectSupervisor, Result<(), SupervisorError>);

fn test_config(server_url: &str) -> SupervisorConfig {
    SupervisorConfig {
        server_url: server_url.to_string(),
        retry_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        robot_name: Some("abc123".to_string()),
        ..Default::default()
    }
}

struct Running {
    probe: Arc<EngineProbe>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: JoinHandle<Finished>,
}

impl Running {
    fn spawn(config: SupervisorConfig) -> Self {
        Self::spawn_with(config, Arc::new(MemoryIdentityStore::new()))
    }

    fn spawn_with(config: SupervisorConfig, identity: Arc<MemoryIdentityStore>) -> Self {
        let probe = EngineProbe::new();
        let mut supervisor = ReconnectSupervisor::new(ScriptedEngine::new(probe.clone()), identity);
        let state = supervisor.subscribe();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.start(config, token).await;
            (supervisor, result)
        });

        Self {
            probe,
            state,
            shutdown,
            task,
        }
    }

    async fn wait_for(&mut self, target: ConnectionState) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == target))
            .await
            .expect("Timed out waiting for state")
            .expect("Supervisor dropped");
    }

    async fn finish(self) -> Finished {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("Supervisor did not return")
            .expect("Supervisor panicked")
    }

    async fn shutdown(self) -> Finished {
        self.shutdown.cancel();
        self.finish().await
    }
}

/// Accept a client and read its join and offer
async fn accept_session(server: &mut TestSignalingServer) -> ServerPeer {
    let mut peer = server.accept().await;
    match peer.next_message().await {
        SignalingMessage::JoinRoom { room_id, role } => {
            assert_eq!(room_id, SessionIdentity::derive("abc123").as_str());
            assert_eq!(role, WORKSTATION_ROLE);
        }
        other => panic!("Expected join-room, got {:?}", other),
    }
    let offer = peer.next_message().await;
    assert_eq!(offer.message_type(), "offer");
    peer
}

fn remote_candidate(name: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        candidate: IceCandidateRecord::new(0, name),
    }
}

/// Test: Full session
/// Given a reachable signaling server
/// When the viewer sends candidates c1, c2, c3 before its answer
/// Then the answer is applied first and the candidates follow in arrival order
#[tokio::test]
async fn test_session_applies_early_candidates_in_order() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let mut peer = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    // Local candidate gathered while the offer was being made follows the offer
    match peer.next_message().await {
        SignalingMessage::IceCandidate { candidate } => {
            assert!(candidate.candidate.starts_with("candidate:"));
        }
        other => panic!("Expected ice-candidate, got {:?}", other),
    }

    for name in ["c1", "c2", "c3"] {
        peer.send(remote_candidate(name));
    }
    peer.send(SignalingMessage::Answer {
        sdp: ANSWER_SDP.to_string(),
    });

    let probe = running.probe.clone();
    eventually("buffered candidates", || probe.applied_candidates().len() == 3).await;

    let calls = probe.calls();
    let answer_at = calls.iter().position(|c| c == "remote-answer").unwrap();
    let first_candidate = calls.iter().position(|c| c.starts_with("candidate:")).unwrap();
    assert!(answer_at < first_candidate);
    assert_eq!(probe.applied_candidates(), vec!["c1", "c2", "c3"]);

    let (supervisor, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(supervisor.state(), ConnectionState::Idle);
    assert_eq!(supervisor.live_handles(), 0);
    assert_eq!(probe.live(), 0);
    peer.closed().await;
}

/// Test: Duplicate answer
/// Given an established session
/// When the viewer sends its answer twice
/// Then the answer is applied once and later candidates still apply
#[tokio::test]
async fn test_duplicate_answer_is_ignored() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let peer = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    let answer = SignalingMessage::Answer {
        sdp: ANSWER_SDP.to_string(),
    };
    peer.send(answer.clone());
    peer.send(answer);
    peer.send(remote_candidate("c4"));

    let probe = running.probe.clone();
    eventually("candidate after duplicate answer", || {
        probe.applied_candidates() == vec!["c4"]
    })
    .await;

    let answers = probe.calls().iter().filter(|c| *c == "remote-answer").count();
    assert_eq!(answers, 1);
    assert_eq!(probe.starts(), 1);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
}

/// Test: Malformed message
/// Given an established session
/// When the server sends text that is not a signaling message
/// Then it is dropped and the session carries on
#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let peer = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    peer.send_raw("{not json");
    peer.send_raw(r#"{"type":"bye"}"#);
    peer.send(SignalingMessage::Answer {
        sdp: ANSWER_SDP.to_string(),
    });

    let probe = running.probe.clone();
    eventually("answer after garbage", || {
        probe.calls().contains(&"remote-answer".to_string())
    })
    .await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(probe.starts(), 1);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
}

/// Test: Connectivity failure
/// Given an active session
/// When ICE reports "failed"
/// Then the session is torn down once and rebuilt with a fresh connection
#[tokio::test]
async fn test_connectivity_failure_reconnects() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let mut first = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    running.probe.emit_state(ConnectivityState::Connected);
    running.probe.emit_state(ConnectivityState::Failed);

    first.closed().await;
    let _second = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    // One failure, one rebuild
    tokio::time::sleep(Duration::from_millis(300)).await;
    let probe = running.probe.clone();
    assert_eq!(probe.starts(), 2);
    assert_eq!(probe.max_live(), 1);
    assert_eq!(probe.live(), 1);
    assert_eq!(server.accepted(), 2);

    let (supervisor, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(supervisor.live_handles(), 0);
    assert_eq!(probe.live(), 0);
}

/// Test: Signaling connection lost
/// Given an active session
/// When the signaling server closes the connection
/// Then the supervisor reconnects and joins the same room again
#[tokio::test]
async fn test_server_close_reconnects() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let first = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    first.close();

    let _second = accept_session(&mut server).await;
    let probe = running.probe.clone();
    eventually("second pipeline", || probe.starts() == 2).await;
    assert_eq!(probe.max_live(), 1);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(probe.live(), 0);
}

/// Test: Pipeline bus failure
/// Given an active session
/// When the pipeline reports end of stream
/// Then the session is rebuilt
#[tokio::test]
async fn test_pipeline_end_of_stream_reconnects() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let mut first = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    running
        .probe
        .emit_bus(BusMessage::Warning("frame late".to_string()));
    running.probe.emit_bus(BusMessage::EndOfStream);

    first.closed().await;
    let _second = accept_session(&mut server).await;
    assert_eq!(running.probe.max_live(), 1);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
}

/// Test: Malformed answer
/// Given an active session
/// When the viewer answers with something that is not SDP
/// Then the session is torn down and rebuilt
#[tokio::test]
async fn test_malformed_answer_reconnects() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let mut first = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    first.send_raw(r#"{"type":"answer","sdp":"garbage"}"#);

    first.closed().await;
    let _second = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;

    let probe = running.probe.clone();
    assert!(!probe.calls().contains(&"remote-answer".to_string()));
    assert_eq!(probe.starts(), 2);
    assert_eq!(probe.max_live(), 1);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(probe.live(), 0);
}

/// Test: Connectivity lost without failing
/// Given an active session
/// When ICE reports "disconnected", and later "closed" on the next session
/// Then each report rebuilds the session
#[tokio::test]
async fn test_disconnected_and_closed_reconnect() {
    let mut server = TestSignalingServer::start().await;
    let mut running = Running::spawn(test_config(server.url()));

    let mut first = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;
    running.probe.emit_state(ConnectivityState::Disconnected);
    first.closed().await;

    let mut second = accept_session(&mut server).await;
    let probe = running.probe.clone();
    eventually("second pipeline", || probe.starts() == 2).await;
    running.wait_for(ConnectionState::Active).await;
    probe.emit_state(ConnectivityState::Closed);
    second.closed().await;

    let _third = accept_session(&mut server).await;
    eventually("third pipeline", || probe.starts() == 3).await;
    assert_eq!(probe.max_live(), 1);
    assert_eq!(server.accepted(), 3);

    let (supervisor, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(supervisor.live_handles(), 0);
    assert_eq!(probe.live(), 0);
}

/// Test: Shutdown while the pipeline starts
/// Given a media engine whose start never completes
/// When shutdown is requested after the client joined
/// Then the supervisor returns and closes the signaling connection
#[tokio::test]
async fn test_shutdown_interrupts_hanging_pipeline_start() {
    let mut server = TestSignalingServer::start().await;
    let running = Running::spawn(test_config(server.url()));
    running.probe.hang_starts(true);

    let mut peer = server.accept().await;
    assert_eq!(peer.next_message().await.message_type(), "join-room");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let probe = running.probe.clone();
    let (supervisor, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(supervisor.state(), ConnectionState::Idle);
    assert_eq!(supervisor.live_handles(), 0);
    assert_eq!(probe.starts(), 0);
    peer.closed().await;
}

/// Test: Unreachable server
/// Given no signaling server is listening
/// When max_attempts is 3
/// Then the supervisor gives up after 3 attempts without starting a pipeline
#[tokio::test]
async fn test_unreachable_server_exhausts_attempts() {
    let mut config = test_config(&refused_url().await);
    config.retry_interval = Duration::from_millis(20);
    config.max_attempts = Some(3);

    let running = Running::spawn(config);
    let probe = running.probe.clone();
    let (supervisor, result) = running.finish().await;

    assert!(matches!(result, Err(SupervisorError::AttemptsExhausted(3))));
    assert_eq!(probe.starts(), 0);
    assert_eq!(supervisor.live_handles(), 0);
}

/// Test: Pipeline cannot start
/// Given a reachable server but a media engine that fails to start
/// When the supervisor runs
/// Then every signaling connection is closed again before the next attempt
#[tokio::test]
async fn test_pipeline_start_failure_releases_channel() {
    let mut server = TestSignalingServer::start().await;
    let mut config = test_config(server.url());
    config.max_attempts = Some(2);

    let running = Running::spawn(config);
    running.probe.fail_starts(true);

    for _ in 0..2 {
        let mut peer = server.accept().await;
        assert_eq!(peer.next_message().await.message_type(), "join-room");
        peer.closed().await;
    }

    let (_, result) = running.finish().await;
    assert!(matches!(result, Err(SupervisorError::AttemptsExhausted(2))));
}

/// Test: No identity
/// Given no cached robot id and no device name
/// When the supervisor starts
/// Then it fails with a configuration error without retrying
#[tokio::test]
async fn test_missing_identity_is_fatal() {
    let server = TestSignalingServer::start().await;
    let mut config = test_config(server.url());
    config.robot_name = None;

    let running = Running::spawn(config);
    let probe = running.probe.clone();
    let (supervisor, result) = running.finish().await;

    assert!(matches!(result, Err(SupervisorError::Configuration(_))));
    assert_eq!(supervisor.state(), ConnectionState::Fatal);
    assert_eq!(probe.starts(), 0);
    assert_eq!(server.accepted(), 0);
}

/// Test: Cached identity
/// Given a robot id cached from an earlier run
/// When the supervisor starts without a device name
/// Then it joins the cached room and does not rewrite the cache
#[tokio::test]
async fn test_cached_identity_is_used() {
    let mut server = TestSignalingServer::start().await;
    let identity = Arc::new(MemoryIdentityStore::with_identity(SessionIdentity::derive(
        "abc123",
    )));
    let mut config = test_config(server.url());
    config.robot_name = None;

    let mut running = Running::spawn_with(config, identity.clone());
    let _peer = accept_session(&mut server).await;
    running.wait_for(ConnectionState::Active).await;
    assert_eq!(identity.save_count(), 0);

    let (_, result) = running.shutdown().await;
    assert!(result.is_ok());
}

/// Test: Shutdown during backoff
/// Given a supervisor waiting a long time before its next attempt
/// When shutdown is requested
/// Then it returns promptly
#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let mut config = test_config(&refused_url().await);
    config.retry_interval = Duration::from_secs(60);

    let mut running = Running::spawn(config);
    running.wait_for(ConnectionState::Reconnecting).await;

    let (supervisor, result) = running.shutdown().await;
    assert!(result.is_ok());
    assert_eq!(supervisor.state(), ConnectionState::Idle);
}

/// Test: Invalid server URL
/// Given a server URL that is not ws:// or wss://
/// When the supervisor starts
/// Then it fails with a configuration error
#[tokio::test]
async fn test_invalid_url_is_fatal() {
    let running = Running::spawn(test_config("http://127.0.0.1:1"));
    let (supervisor, result) = running.finish().await;

    assert!(matches!(result, Err(SupervisorError::Configuration(_))));
    assert_eq!(supervisor.state(), ConnectionState::Fatal);
}
