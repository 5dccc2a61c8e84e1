use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
        }
    }

    /// Value of the `type` field in status feed messages.
    pub fn status_type(self) -> &'static str {
        match self {
            Self::Deployment => "deployment_status",
            Self::StatefulSet => "statefulset_status",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "deploy" | "deployment" | "deployments" => Some(Self::Deployment),
            "sts" | "statefulset" | "statefulsets" | "stateful-set" | "stateful-sets" => {
                Some(Self::StatefulSet)
            }
            _ => None,
        }
    }
}

impl Display for WorkloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub workload: String,
    pub container: String,
}

impl WorkloadRef {
    pub fn new(
        namespace: impl Into<String>,
        workload: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            workload: workload.into(),
            container: container.into(),
        }
    }
}

impl Display for WorkloadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.workload)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct InstanceAddress {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Display for InstanceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.pod, self.container)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Instance {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub running_containers: Vec<String>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.phase.eq_ignore_ascii_case("Running")
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExecInvocation {
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl ExecInvocation {
    pub fn buffered(command: Vec<String>) -> Self {
        Self {
            command,
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }

    pub fn interactive(command: Vec<String>) -> Self {
        Self {
            command,
            stdin: true,
            stdout: true,
            stderr: true,
            tty: true,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SessionLabel(String);

impl SessionLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct WorkloadRecord {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub enum WorkloadState {
    Running,
    Stopped,
    Degraded,
}

impl WorkloadState {
    pub fn derive(replicas: i32, ready_replicas: i32) -> Self {
        if ready_replicas <= 0 {
            Self::Stopped
        } else if ready_replicas >= replicas {
            Self::Running
        } else {
            Self::Degraded
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub namespace: String,
    pub status: WorkloadState,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl From<&WorkloadRecord> for WorkloadStatus {
    fn from(record: &WorkloadRecord) -> Self {
        Self {
            name: record.name.clone(),
            namespace: record.namespace.clone(),
            status: WorkloadState::derive(record.replicas, record.ready_replicas),
            replicas: record.replicas,
            ready_replicas: record.ready_replicas,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StatusSnapshot {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Vec<WorkloadStatus>,
}

pub type SharedSnapshot = Arc<StatusSnapshot>;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub status: String,
    pub ip: String,
    pub os: String,
    pub kubelet_version: String,
    pub pods: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub command: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Output { message: String },
    Failure { error: String },
}

impl ServerMessage {
    pub fn output(message: impl Into<String>) -> Self {
        Self::Output {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Both variants are a single string field; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
