use crate::cluster::{AbortHook, ExecInput, ExecOutput, Orchestrator};
use crate::config::SessionConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::model::{ExecInvocation, InstanceAddress, SessionLabel};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 4096;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const LABEL_PLACEHOLDER: &str = "{label}";

/// Labels of every listed session whose line contains `marker`, in listing
/// order. A label is the line's text before the first `separator`, trimmed,
/// so `"\t12345.minecraft\t(Detached)"` yields `12345`.
pub fn session_labels(listing: &str, marker: &str, separator: char) -> Vec<SessionLabel> {
    listing
        .lines()
        .filter(|line| line.contains(marker))
        .filter_map(|line| {
            let label = line.split(separator).next().unwrap_or_default().trim();
            (!label.is_empty()).then(|| SessionLabel::new(label))
        })
        .collect()
}

pub async fn find_session(
    orchestrator: &dyn Orchestrator,
    session: &SessionConfig,
    target: &InstanceAddress,
) -> BridgeResult<SessionLabel> {
    let labels = list_sessions(orchestrator, session, target).await?;
    if labels.len() > 1 {
        warn!(
            instance = %target,
            count = labels.len(),
            marker = %session.marker,
            "several sessions match, using the first"
        );
    }
    let label = labels
        .into_iter()
        .next()
        .ok_or_else(|| BridgeError::SessionNotFound {
            instance: format!("{}/{}", target.namespace, target.pod),
            marker: session.marker.clone(),
        })?;
    info!(instance = %target, label = %label, "found server session");
    Ok(label)
}

pub async fn revalidate(
    orchestrator: &dyn Orchestrator,
    session: &SessionConfig,
    target: &InstanceAddress,
    label: &SessionLabel,
) -> BridgeResult<()> {
    let labels = list_sessions(orchestrator, session, target).await?;
    if labels.contains(label) {
        return Ok(());
    }
    warn!(instance = %target, label = %label, "session vanished before attach");
    Err(BridgeError::SessionNotFound {
        instance: format!("{}/{}", target.namespace, target.pod),
        marker: session.marker.clone(),
    })
}

pub async fn inject_command(
    orchestrator: &dyn Orchestrator,
    session: &SessionConfig,
    target: &InstanceAddress,
    label: &SessionLabel,
    text: &str,
) -> BridgeResult<String> {
    let mut command = expand_command(&session.inject_command, label, false);
    command.push(format!("{text}\n"));
    info!(instance = %target, label = %label, command = %text, "injecting console command");
    orchestrator
        .exec_buffered(target, &ExecInvocation::buffered(command))
        .await
}

async fn list_sessions(
    orchestrator: &dyn Orchestrator,
    session: &SessionConfig,
    target: &InstanceAddress,
) -> BridgeResult<Vec<SessionLabel>> {
    let listing = orchestrator
        .exec_buffered(
            target,
            &ExecInvocation::buffered(session.list_command.clone()),
        )
        .await?;
    debug!(instance = %target, listing = %listing.trim_end(), "listed sessions");
    Ok(session_labels(
        &listing,
        &session.marker,
        session.separator,
    ))
}

/// Substitute the label into a command template. When the template has no
/// placeholder and `append_label` is set, the label becomes the last argument.
fn expand_command(template: &[String], label: &SessionLabel, append_label: bool) -> Vec<String> {
    let mut substituted = false;
    let mut command = template
        .iter()
        .map(|arg| {
            if arg.contains(LABEL_PLACEHOLDER) {
                substituted = true;
                arg.replace(LABEL_PLACEHOLDER, label.as_str())
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>();
    if !substituted && append_label {
        command.push(label.to_string());
    }
    command
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Closed,
}

pub struct ConsoleReader {
    output: ExecOutput,
    closed: Arc<AtomicBool>,
    buffer: Box<[u8]>,
}

impl ConsoleReader {
    pub async fn read_available(&mut self) -> BridgeResult<ReadOutcome> {
        match self.output.read(&mut self.buffer).await {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(read) => Ok(ReadOutcome::Data(self.buffer[..read].to_vec())),
            Err(_) if self.closed.load(Ordering::SeqCst) => Err(BridgeError::ChannelClosed),
            Err(error) => Err(BridgeError::transport("console output", error)),
        }
    }
}

pub struct ConsoleSession {
    target: InstanceAddress,
    label: SessionLabel,
    termination: String,
    writer: Mutex<Option<ExecInput>>,
    reader: Mutex<Option<ConsoleReader>>,
    abort: Mutex<Option<AbortHook>>,
    closed: Arc<AtomicBool>,
}

impl ConsoleSession {
    /// Open the interactive exec. The multiplexer sends no acknowledgement,
    /// so this returns as soon as the channel is open.
    pub async fn attach(
        orchestrator: &dyn Orchestrator,
        session: &SessionConfig,
        target: &InstanceAddress,
        label: &SessionLabel,
    ) -> BridgeResult<Self> {
        let command = expand_command(&session.attach_command, label, true);
        let channel = orchestrator
            .exec_stream(target, &ExecInvocation::interactive(command))
            .await?;
        let (input, output, abort) = channel.into_parts();
        info!(instance = %target, label = %label, "attached to server session");

        let closed = Arc::new(AtomicBool::new(false));
        Ok(Self {
            target: target.clone(),
            label: label.clone(),
            termination: session.termination.clone(),
            writer: Mutex::new(Some(input)),
            reader: Mutex::new(Some(ConsoleReader {
                output,
                closed: closed.clone(),
                buffer: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
            })),
            abort: Mutex::new(abort),
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn take_reader(&self) -> Option<ConsoleReader> {
        self.reader.lock().await.take()
    }

    pub async fn write(&self, text: &str) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(BridgeError::ChannelClosed);
        };

        let line = format!("{text}\n");
        let written = timeout(WRITE_TIMEOUT, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(BridgeError::transport(self.target.to_string(), error)),
            Err(_) => Err(BridgeError::transport(
                self.target.to_string(),
                "console write timed out",
            )),
        }
    }

    /// Send the termination line, then close the channel. Later calls do
    /// nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let line = format!("{}\n", self.termination);
            let sent = timeout(WRITE_TIMEOUT, async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
                writer.shutdown().await
            })
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(instance = %self.target, error = %error, "termination write failed")
                }
                Err(_) => debug!(instance = %self.target, "termination write timed out"),
            }
        }

        if let Some(abort) = self.abort.lock().await.take() {
            abort();
        }
        info!(instance = %self.target, label = %self.label, "console session closed");
    }
}
