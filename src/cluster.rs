use crate::error::BridgeResult;
use crate::model::{
    ExecInvocation, Instance, InstanceAddress, NodeStatus, WorkloadKind, WorkloadRecord,
};
use async_trait::async_trait;
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;
pub type ExecOutput = Pin<Box<dyn AsyncRead + Send>>;
pub type AbortHook = Box<dyn FnOnce() + Send>;

pub struct ExecChannel {
    pub input: ExecInput,
    pub output: ExecOutput,
    abort: Option<AbortHook>,
}

impl ExecChannel {
    pub fn new(input: ExecInput, output: ExecOutput) -> Self {
        Self {
            input,
            output,
            abort: None,
        }
    }

    pub fn with_abort(mut self, abort: impl FnOnce() + Send + 'static) -> Self {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn into_parts(self) -> (ExecInput, ExecOutput, Option<AbortHook>) {
        (self.input, self.output, self.abort)
    }
}

impl Debug for ExecChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel")
            .field("abort", &self.abort.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Pods matching a label selector, in the API server's listing order.
    async fn list_instances(&self, namespace: &str, selector: &str) -> BridgeResult<Vec<Instance>>;

    async fn get_instance(&self, namespace: &str, name: &str) -> BridgeResult<Option<Instance>>;

    /// Run a command to completion and return stdout followed by stderr.
    async fn exec_buffered(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<String>;

    async fn exec_stream(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<ExecChannel>;

    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> BridgeResult<Vec<WorkloadRecord>>;

    async fn patch_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> BridgeResult<()>;

    async fn list_nodes(&self) -> BridgeResult<Vec<NodeStatus>>;
}
