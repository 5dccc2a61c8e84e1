use crate::cluster::Orchestrator;
use crate::config::BridgeConfig;
use crate::console::{self, ConsoleReader, ConsoleSession, ReadOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::locator;
use crate::model::{ClientMessage, ServerMessage, WorkloadRef};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BridgeState {
    Connecting,
    Attached,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Inbound {
    Text(String),
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { reason: String },
}

pub struct ConsoleBridge {
    conn_id: u64,
    orchestrator: Arc<dyn Orchestrator>,
    config: Arc<BridgeConfig>,
    workload: WorkloadRef,
    state: BridgeState,
}

impl ConsoleBridge {
    pub fn new(
        conn_id: u64,
        orchestrator: Arc<dyn Orchestrator>,
        config: Arc<BridgeConfig>,
        workload: WorkloadRef,
    ) -> Self {
        Self {
            conn_id,
            orchestrator,
            config,
            workload,
            state: BridgeState::Connecting,
        }
    }

    fn transition(&mut self, next: BridgeState) {
        debug!(conn_id = self.conn_id, from = ?self.state, to = ?next, "console bridge state");
        self.state = next;
    }

    pub async fn run<S>(mut self, mut inbound: S, outbound: mpsc::Sender<Outbound>) -> BridgeState
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        info!(conn_id = self.conn_id, workload = %self.workload, "console connection opened");

        let session = match self.connect().await {
            Ok(session) => Arc::new(session),
            Err(error) => {
                self.report_connect_failure(&error);
                let _ = outbound
                    .send(Outbound::Text(ServerMessage::error(error.to_string()).to_json()))
                    .await;
                let _ = outbound
                    .send(Outbound::Close {
                        reason: error.kind().to_string(),
                    })
                    .await;
                self.transition(BridgeState::Closed);
                return self.state;
            }
        };
        self.transition(BridgeState::Attached);

        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let reader_task = match session.take_reader().await {
            Some(reader) => Some(tokio::spawn(relay_output(
                self.conn_id,
                reader,
                outbound.clone(),
                done_tx,
            ))),
            None => None,
        };

        let remote_ended = loop {
            tokio::select! {
                event = inbound.next() => match event {
                    Some(Inbound::Text(text)) => {
                        if let Err(error) = self.forward_input(&session, &text, &outbound).await {
                            if !error.is_terminal_signal() {
                                warn!(conn_id = self.conn_id, error = %error, "console input failed");
                                let _ = outbound
                                    .send(Outbound::Text(ServerMessage::error(error.to_string()).to_json()))
                                    .await;
                            }
                            break false;
                        }
                    }
                    Some(Inbound::Closed) | None => break false,
                },
                _ = &mut done_rx => break true,
            }
        };

        self.transition(BridgeState::Closing);
        session.close().await;
        if let Some(task) = reader_task {
            let abort = task.abort_handle();
            if timeout(READER_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!(conn_id = self.conn_id, "console reader did not stop, aborting it");
                abort.abort();
            }
        }
        if remote_ended {
            let _ = outbound
                .send(Outbound::Close {
                    reason: "console session ended".to_string(),
                })
                .await;
        }

        self.transition(BridgeState::Closed);
        info!(conn_id = self.conn_id, workload = %self.workload, "console connection closed");
        self.state
    }

    async fn connect(&self) -> BridgeResult<ConsoleSession> {
        let orchestrator = self.orchestrator.as_ref();
        let session_config = &self.config.session;

        let target = locator::resolve(orchestrator, &self.config, &self.workload).await?;
        let label = console::find_session(orchestrator, session_config, &target).await?;
        console::revalidate(orchestrator, session_config, &target, &label).await?;
        ConsoleSession::attach(orchestrator, session_config, &target, &label).await
    }

    fn report_connect_failure(&self, error: &BridgeError) {
        match error {
            BridgeError::NotFound { .. } | BridgeError::SessionNotFound { .. } => {
                info!(conn_id = self.conn_id, workload = %self.workload, error = %error, "console unavailable")
            }
            _ => warn!(
                conn_id = self.conn_id,
                workload = %self.workload,
                kind = error.kind(),
                error = %error,
                "console attach failed"
            ),
        }
    }

    /// Malformed payloads are answered on the socket and do not end the
    /// connection; only session write failures are returned.
    async fn forward_input(
        &self,
        session: &ConsoleSession,
        text: &str,
        outbound: &mpsc::Sender<Outbound>,
    ) -> BridgeResult<()> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(error) => {
                let error = BridgeError::MalformedInput(error.to_string());
                debug!(conn_id = self.conn_id, error = ?error, "rejected console input");
                let _ = outbound
                    .send(Outbound::Text(ServerMessage::error(error.to_string()).to_json()))
                    .await;
                return Ok(());
            }
        };
        debug!(conn_id = self.conn_id, command = %message.command, "console input");
        session.write(&message.command).await
    }
}

async fn relay_output(
    conn_id: u64,
    mut reader: ConsoleReader,
    outbound: mpsc::Sender<Outbound>,
    done: oneshot::Sender<()>,
) {
    let mut decoder = Utf8Decoder::default();
    loop {
        let text = match reader.read_available().await {
            Ok(ReadOutcome::Data(bytes)) => decoder.decode(&bytes),
            Ok(ReadOutcome::Closed) => {
                debug!(conn_id, "console output reached end of stream");
                break;
            }
            Err(error) if error.is_terminal_signal() => break,
            Err(error) => {
                warn!(conn_id, error = %error, "console output failed");
                break;
            }
        };
        if text.is_empty() {
            continue;
        }
        if outbound
            .send(Outbound::Text(ServerMessage::output(text).to_json()))
            .await
            .is_err()
        {
            debug!(conn_id, "browser socket gone, stopping console reader");
            break;
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = outbound
            .send(Outbound::Text(ServerMessage::output(tail).to_json()))
            .await;
    }
    let _ = done.send(());
}

#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match error.error_len() {
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        decoded
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
