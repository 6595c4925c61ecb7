//! Session coordinator: one WebSocket connection bridged to one child process.
//!
//! Lifecycle: `Created → Wired → Running → Closing → Closed`.
//!
//! Four relay tasks run concurrently. Whichever ends first fires the shared
//! [`Completion`]; later firings are no-ops. On the first firing the
//! coordinator tears everything down:
//!
//! - the upstream relays (transport inbound, process output) stop at once and
//!   drop their channel senders;
//! - the downstream relays (process input, transport outbound) drain what is
//!   already queued and end when their channel closes, bounded by
//!   [`DRAIN_TIMEOUT`] after which they are aborted;
//! - the transport is closed and the child is reclaimed.
//!
//! A live session has no timeouts: a silent client talking to an idle
//! program keeps the session open indefinitely.

use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{LaunchError, RelayError};
use crate::process::{self, LaunchedProcess, ProcessSpec, ReclaimPolicy};
use crate::relay::{self, LineLimit, RelayKind};

/// Capacity of each direction's message channel
const CHANNEL_CAPACITY: usize = 16;

/// How long downstream relays may keep draining once teardown starts
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on sending the Close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session options
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub line_limit: LineLimit,
    pub reclaim: ReclaimPolicy,
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Wired,
    Running,
    Closing,
    Closed,
}

/// Single-fire completion signal shared by the relay tasks.
///
/// The first [`fire`](Completion::fire) records who finished and wakes the
/// coordinator; every later call is harmless.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    token: CancellationToken,
    first: Arc<OnceLock<RelayKind>>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that `kind` has ended. Returns true for the first caller only.
    pub fn fire(&self, kind: RelayKind) -> bool {
        let first = self.first.set(kind).is_ok();
        self.token.cancel();
        first
    }

    /// Wait for the first firing and return who fired it.
    pub async fn wait(&self) -> Option<RelayKind> {
        self.token.cancelled().await;
        self.first.get().copied()
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    /// The relay whose exit triggered teardown
    pub first_finished: Option<RelayKind>,
    /// Child exit status, when known at the end of the session
    pub exit_status: Option<ExitStatus>,
}

struct Coordinator {
    id: u64,
    state: SessionState,
}

impl Coordinator {
    fn enter(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        trace!(session = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Run one session to completion.
///
/// Launches `spec` with exactly `env`, relays lines both ways until the first
/// relay ends, then closes the transport and reclaims the child. A launch
/// failure closes the transport and is returned; relay errors are only logged.
pub async fn run_session<T>(
    id: u64,
    mut transport: T,
    spec: &ProcessSpec,
    env: &[String],
    options: &SessionOptions,
) -> Result<SessionReport, LaunchError>
where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static,
{
    let mut coordinator = Coordinator {
        id,
        state: SessionState::Created,
    };

    let LaunchedProcess {
        child,
        stdin,
        stdout,
    } = match process::launch(spec, env) {
        Ok(launched) => launched,
        Err(e) => {
            info!(session = id, error = %e, "process: Failed to start");
            close_transport(id, &mut transport).await;
            return Err(e);
        }
    };

    let pid = child.id();
    info!(session = id, pid = ?pid, program = %spec.program, "Session started");

    let completion = Completion::new();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (mut sink, stream) = transport.split();
    coordinator.enter(SessionState::Wired);

    let transport_inbound = spawn_upstream(
        id,
        RelayKind::TransportInbound,
        &completion,
        relay::transport_to_channel(stream, inbound_tx),
    );
    let process_output = spawn_upstream(
        id,
        RelayKind::ProcessOutput,
        &completion,
        relay::process_to_channel(stdout, outbound_tx, options.line_limit),
    );
    let process_input = spawn_relay(
        id,
        RelayKind::ProcessInput,
        completion.clone(),
        relay::channel_to_process(inbound_rx, stdin),
    );
    let done = completion.clone();
    let transport_outbound: JoinHandle<SplitSink<T, Message>> = tokio::spawn(async move {
        let result = relay::channel_to_transport(&mut outbound_rx, &mut sink).await;
        relay_ended(id, RelayKind::TransportOutbound, &result);
        done.fire(RelayKind::TransportOutbound);
        sink
    });
    coordinator.enter(SessionState::Running);

    let first_finished = completion.wait().await;
    coordinator.enter(SessionState::Closing);
    debug!(session = id, first = ?first_finished, "Session closing");

    if let Some(mut sink) = drain(id, RelayKind::TransportOutbound, transport_outbound).await {
        close_transport(id, &mut sink).await;
    }
    drain(id, RelayKind::ProcessInput, process_input).await;
    for handle in [transport_inbound, process_output] {
        let _ = handle.await;
    }

    let exit_status = process::reclaim(child, options.reclaim).await;
    coordinator.enter(SessionState::Closed);

    match exit_status {
        Some(status) => debug!(
            session = id,
            code = ?status.code(),
            signal = ?process::terminating_signal(&status),
            "Process reclaimed"
        ),
        None => debug!(session = id, "Process exit status unknown"),
    }

    Ok(SessionReport {
        first_finished,
        exit_status,
    })
}

/// Spawn a relay that stops as soon as the session starts closing.
fn spawn_upstream<F>(
    id: u64,
    kind: RelayKind,
    completion: &Completion,
    relay: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), RelayError>> + Send + 'static,
{
    let token = completion.token();
    spawn_relay(id, kind, completion.clone(), async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            result = relay => result,
        }
    })
}

/// Spawn a relay that fires `completion` whenever it ends.
fn spawn_relay<F>(id: u64, kind: RelayKind, completion: Completion, relay: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), RelayError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = relay.await;
        relay_ended(id, kind, &result);
        completion.fire(kind);
    })
}

fn relay_ended(id: u64, kind: RelayKind, result: &Result<(), RelayError>) {
    match result {
        Ok(()) => debug!(session = id, relay = %kind, "Relay finished"),
        Err(e) => debug!(session = id, relay = %kind, error = %e, "Relay failed"),
    }
}

/// Wait for a downstream relay to finish draining, aborting it after
/// [`DRAIN_TIMEOUT`].
async fn drain<O>(id: u64, kind: RelayKind, mut handle: JoinHandle<O>) -> Option<O> {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            warn!(session = id, relay = %kind, error = %e, "Relay task failed");
            None
        }
        Err(_) => {
            debug!(session = id, relay = %kind, "Relay still draining, aborting");
            handle.abort();
            let _ = handle.await;
            None
        }
    }
}

/// Best-effort Close frame; the connection itself drops with the last handle.
async fn close_transport<K>(id: u64, sink: &mut K)
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) => {}
        Ok(Err(e)) => trace!(session = id, error = %e, "Close failed"),
        Err(_) => trace!(session = id, "Close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Overflow;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    type Ws = WebSocketStream<DuplexStream>;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    async fn ws_pair() -> (Ws, Ws) {
        let (server_io, client_io) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            discard_stderr: true,
        }
    }

    fn waiting_options() -> SessionOptions {
        SessionOptions {
            line_limit: LineLimit::default(),
            reclaim: ReclaimPolicy::Escalate {
                grace: Duration::from_millis(200),
            },
        }
    }

    fn start(
        server: Ws,
        spec: ProcessSpec,
        options: SessionOptions,
    ) -> JoinHandle<Result<SessionReport, LaunchError>> {
        tokio::spawn(async move { run_session(1, server, &spec, &[], &options).await })
    }

    /// Text messages up to the first non-text frame, error or end of stream.
    async fn read_texts(client: &mut Ws) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(Ok(Message::Text(text))) = client.next().await {
            texts.push(text.as_str().to_owned());
        }
        texts
    }

    async fn finish(
        session: JoinHandle<Result<SessionReport, LaunchError>>,
    ) -> Result<SessionReport, LaunchError> {
        tokio::time::timeout(TEST_TIMEOUT, session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    #[test]
    fn test_completion_first_fire_wins() {
        let completion = Completion::new();
        assert!(completion.fire(RelayKind::ProcessOutput));
        assert!(!completion.fire(RelayKind::TransportInbound));
        assert!(!completion.fire(RelayKind::ProcessOutput));
        assert!(completion.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_completion_wait_reports_first() {
        let completion = Completion::new();
        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.wait().await })
        };

        completion.fire(RelayKind::TransportOutbound);
        completion.fire(RelayKind::ProcessInput);

        assert_eq!(waiter.await.unwrap(), Some(RelayKind::TransportOutbound));
    }

    #[test]
    fn test_state_order() {
        assert!(SessionState::Created < SessionState::Wired);
        assert!(SessionState::Running < SessionState::Closing);
        assert!(SessionState::Closing < SessionState::Closed);
    }

    #[tokio::test]
    async fn test_echo_then_quit_scenario() {
        let (server, mut client) = ws_pair().await;
        let session = start(
            server,
            sh(r#"while read -r line; do echo "$line"; [ "$line" = quit ] && exit 0; done"#),
            waiting_options(),
        );

        client.send(Message::text("echo")).await.unwrap();
        client.send(Message::text("quit")).await.unwrap();

        assert_eq!(read_texts(&mut client).await, vec!["echo", "quit"]);

        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::ProcessOutput));
        assert!(report.exit_status.unwrap().success());
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_stdin_in_order() {
        let (server, mut client) = ws_pair().await;
        let session = start(server, sh("exec /bin/cat"), waiting_options());

        let sent: Vec<String> = (0..50).map(|i| format!("message {i}")).collect();
        for message in &sent {
            client.send(Message::text(message.clone())).await.unwrap();
        }

        let mut echoed = Vec::new();
        while echoed.len() < sent.len() {
            match client.next().await {
                Some(Ok(Message::Text(text))) => echoed.push(text.as_str().to_owned()),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(echoed, sent);

        client.close(None).await.unwrap();
        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::TransportInbound));
        // cat sees EOF on stdin once the pipe is closed and exits cleanly.
        assert!(report.exit_status.unwrap().success());
    }

    #[tokio::test]
    async fn test_process_output_lines_become_messages() {
        let (server, mut client) = ws_pair().await;
        let session = start(
            server,
            sh(r#"i=0; while [ $i -lt 100 ]; do echo "line $i"; i=$((i+1)); done"#),
            waiting_options(),
        );

        let expected: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        assert_eq!(read_texts(&mut client).await, expected);

        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::ProcessOutput));
    }

    #[tokio::test]
    async fn test_process_exit_closes_silent_client() {
        let (server, mut client) = ws_pair().await;
        let session = start(server, sh("echo bye"), waiting_options());

        assert_eq!(read_texts(&mut client).await, vec!["bye"]);
        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::ProcessOutput));
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_busy_process() {
        let (server, mut client) = ws_pair().await;
        let session = start(server, sh("while :; do echo tick; done"), waiting_options());

        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "tick"),
            other => panic!("unexpected: {:?}", other),
        }
        drop(client);

        let report = finish(session).await.unwrap();
        assert!(matches!(
            report.first_finished,
            Some(RelayKind::TransportInbound) | Some(RelayKind::TransportOutbound)
        ));
        assert!(report.exit_status.is_some());
    }

    #[tokio::test]
    async fn test_overlong_output_line_ends_session() {
        let (server, mut client) = ws_pair().await;
        let options = SessionOptions {
            line_limit: LineLimit {
                max_bytes: 8,
                overflow: Overflow::Error,
            },
            reclaim: ReclaimPolicy::Escalate {
                grace: Duration::from_millis(50),
            },
        };
        let session = start(
            server,
            sh("echo 0123456789abcdef; exec /bin/sleep 30"),
            options,
        );

        assert!(read_texts(&mut client).await.is_empty());
        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::ProcessOutput));
        let status = report.exit_status.unwrap();
        assert_eq!(process::terminating_signal(&status), Some(libc::SIGINT));
    }

    #[tokio::test]
    async fn test_closed_stdin_ends_session() {
        let (server, mut client) = ws_pair().await;
        let options = SessionOptions {
            line_limit: LineLimit::default(),
            reclaim: ReclaimPolicy::Escalate {
                grace: Duration::from_millis(50),
            },
        };
        let session = start(
            server,
            sh("exec 0<&-; echo ready; exec /bin/sleep 30"),
            options,
        );

        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "ready"),
            other => panic!("unexpected: {:?}", other),
        }
        client.send(Message::text("nobody reads this")).await.unwrap();

        assert!(read_texts(&mut client).await.is_empty());
        let report = finish(session).await.unwrap();
        assert_eq!(report.first_finished, Some(RelayKind::ProcessInput));
        let status = report.exit_status.unwrap();
        assert_eq!(process::terminating_signal(&status), Some(libc::SIGINT));
    }

    #[tokio::test]
    async fn test_launch_failure_closes_transport() {
        let (server, mut client) = ws_pair().await;
        let spec = ProcessSpec {
            program: "/definitely/not/a/program".to_string(),
            args: Vec::new(),
            working_dir: None,
            discard_stderr: true,
        };
        let session = start(server, spec, SessionOptions::default());

        let result = finish(session).await;
        assert!(matches!(result, Err(LaunchError::NotFound { .. })));

        match client.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
