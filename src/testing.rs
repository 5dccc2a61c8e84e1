use crate::cluster::{ExecChannel, Orchestrator};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    ExecInvocation, Instance, InstanceAddress, NodeStatus, WorkloadKind, WorkloadRecord,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};

const ANY_POD: &str = "*";
const PIPE_BYTES: usize = 64 * 1024;

/// The remote side of a duplex exec channel.
pub struct RemoteEnd {
    /// Everything the session wrote to the container's stdin.
    pub input: DuplexStream,
    /// Write here to produce container output.
    pub output: DuplexStream,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<String, Vec<Instance>>,
    listings: HashMap<String, String>,
    channels: HashMap<String, VecDeque<ExecChannel>>,
    invocations: Vec<ExecInvocation>,
    workloads: HashMap<WorkloadKind, Vec<WorkloadRecord>>,
    nodes: Vec<NodeStatus>,
    patches: Vec<(WorkloadKind, String, String, i32)>,
}

#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<FakeState>,
    aborted: Arc<AtomicUsize>,
    workload_polls: AtomicUsize,
    fail_workloads: AtomicBool,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake orchestrator state")
    }

    pub fn add_instances(&self, selector: &str, instances: Vec<Instance>) {
        self.state()
            .instances
            .entry(selector.to_string())
            .or_default()
            .extend(instances);
    }

    pub fn set_listing(&self, listing: &str) {
        self.set_listing_for(ANY_POD, listing);
    }

    pub fn set_listing_for(&self, pod: &str, listing: &str) {
        self.state()
            .listings
            .insert(pod.to_string(), listing.to_string());
    }

    pub fn push_duplex_channel(&self) -> RemoteEnd {
        self.push_duplex_channel_for(ANY_POD)
    }

    pub fn push_duplex_channel_for(&self, pod: &str) -> RemoteEnd {
        let (session_input, remote_input) = tokio::io::duplex(PIPE_BYTES);
        let (remote_output, session_output) = tokio::io::duplex(PIPE_BYTES);
        self.push_channel(
            pod,
            ExecChannel::new(Box::pin(session_input), Box::pin(session_output)),
        );
        RemoteEnd {
            input: remote_input,
            output: remote_output,
        }
    }

    /// Channel whose output is exactly `chunks`, one per read, then EOF.
    pub fn push_chunked_channel(&self, chunks: &[&str]) -> DuplexStream {
        let (session_input, remote_input) = tokio::io::duplex(PIPE_BYTES);
        let reader = ChunkedReader {
            chunks: chunks.iter().map(|chunk| chunk.as_bytes().to_vec()).collect(),
        };
        self.push_channel(
            ANY_POD,
            ExecChannel::new(Box::pin(session_input), Box::pin(reader)),
        );
        remote_input
    }

    fn push_channel(&self, pod: &str, channel: ExecChannel) {
        let aborted = self.aborted.clone();
        let channel = channel.with_abort(move || {
            aborted.fetch_add(1, Ordering::SeqCst);
        });
        self.state()
            .channels
            .entry(pod.to_string())
            .or_default()
            .push_back(channel);
    }

    pub fn set_workloads(&self, kind: WorkloadKind, records: Vec<WorkloadRecord>) {
        self.state().workloads.insert(kind, records);
    }

    pub fn set_nodes(&self, nodes: Vec<NodeStatus>) {
        self.state().nodes = nodes;
    }

    pub fn fail_workload_listing(&self, fail: bool) {
        self.fail_workloads.store(fail, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> Vec<ExecInvocation> {
        self.state().invocations.clone()
    }

    pub fn patches(&self) -> Vec<(WorkloadKind, String, String, i32)> {
        self.state().patches.clone()
    }

    pub fn aborted_channels(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn workload_polls(&self) -> usize {
        self.workload_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_instances(&self, namespace: &str, selector: &str) -> BridgeResult<Vec<Instance>> {
        Ok(self
            .state()
            .instances
            .get(selector)
            .into_iter()
            .flatten()
            .filter(|instance| instance.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> BridgeResult<Option<Instance>> {
        Ok(self
            .state()
            .instances
            .values()
            .flatten()
            .find(|instance| instance.namespace == namespace && instance.name == name)
            .cloned())
    }

    async fn exec_buffered(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<String> {
        let mut state = self.state();
        state.invocations.push(invocation.clone());
        if invocation.command.iter().any(|arg| arg == "-ls") {
            let listing = state
                .listings
                .get(&target.pod)
                .or_else(|| state.listings.get(ANY_POD))
                .cloned()
                .unwrap_or_default();
            return Ok(listing);
        }
        Ok(String::new())
    }

    async fn exec_stream(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<ExecChannel> {
        let mut state = self.state();
        state.invocations.push(invocation.clone());
        let key = if state
            .channels
            .get(&target.pod)
            .is_some_and(|queue| !queue.is_empty())
        {
            target.pod.clone()
        } else {
            ANY_POD.to_string()
        };
        state
            .channels
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| BridgeError::transport(target.to_string(), "no scripted channel"))
    }

    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> BridgeResult<Vec<WorkloadRecord>> {
        self.workload_polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_workloads.load(Ordering::SeqCst) {
            return Err(BridgeError::orchestrator("failed to list workloads", "api down"));
        }
        Ok(self
            .state()
            .workloads
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|record| namespace.is_none_or(|namespace| record.namespace == namespace))
            .cloned()
            .collect())
    }

    async fn patch_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> BridgeResult<()> {
        self.state()
            .patches
            .push((kind, namespace.to_string(), name.to_string(), replicas));
        Ok(())
    }

    async fn list_nodes(&self) -> BridgeResult<Vec<NodeStatus>> {
        Ok(self.state().nodes.clone())
    }
}

struct ChunkedReader {
    chunks: VecDeque<Vec<u8>>,
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.chunks.pop_front() {
            buf.put_slice(&chunk);
        }
        Poll::Ready(Ok(()))
    }
}

pub fn running_instance(namespace: &str, name: &str) -> Instance {
    Instance {
        name: name.to_string(),
        namespace: namespace.to_string(),
        phase: "Running".to_string(),
        running_containers: vec!["minecraft-server".to_string()],
    }
}

pub fn workload(namespace: &str, name: &str, replicas: i32, ready: i32) -> WorkloadRecord {
    WorkloadRecord {
        name: name.to_string(),
        namespace: namespace.to_string(),
        replicas,
        ready_replicas: ready,
        annotations: [("managed-by".to_string(), "mindworld".to_string())]
            .into_iter()
            .collect(),
    }
}

pub async fn read_remote_input(mut input: DuplexStream) -> String {
    let mut buffer = Vec::new();
    input
        .read_to_end(&mut buffer)
        .await
        .expect("read remote input");
    String::from_utf8_lossy(&buffer).into_owned()
}
