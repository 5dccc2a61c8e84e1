use crate::cluster::{ExecChannel, Orchestrator};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    ExecInvocation, Instance, InstanceAddress, NodeStatus, WorkloadKind, WorkloadRecord,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{AttachParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
    cluster: String,
    default_namespace: String,
}

impl KubeGateway {
    pub async fn new(context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if context.is_some() {
                anyhow::bail!(
                    "kubeconfig not found; context selection is unavailable in this environment"
                );
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let cluster_url = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        let active_context = context
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());

        info!(context = %active_context, cluster = %cluster_url, "kubernetes client ready");

        Ok(Self {
            client,
            context: active_context,
            cluster: cluster_url,
            default_namespace,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn ensure_container_running(&self, target: &InstanceAddress) -> BridgeResult<()> {
        let pod = self
            .pods(&target.namespace)
            .get_opt(&target.pod)
            .await
            .map_err(|error| BridgeError::transport(target.to_string(), error))?;
        let Some(pod) = pod else {
            return Err(BridgeError::NotFound {
                namespace: target.namespace.clone(),
                workload: target.pod.clone(),
            });
        };

        let instance = instance_from_pod(&pod);
        if !instance
            .running_containers
            .iter()
            .any(|name| name == &target.container)
        {
            return Err(BridgeError::ContainerNotReady {
                instance: format!("{}/{}", target.namespace, target.pod),
                container: target.container.clone(),
            });
        }
        Ok(())
    }

    async fn list_scalable<K>(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> BridgeResult<Vec<WorkloadRecord>>
    where
        K: ScalableWorkload,
    {
        let api: Api<K> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&list_params()).await.map_err(|error| {
            BridgeError::orchestrator(
                format!(
                    "failed to list {} in {}",
                    kind.title(),
                    namespace.unwrap_or("all namespaces")
                ),
                error,
            )
        })?;

        Ok(list
            .into_iter()
            .map(|workload| WorkloadRecord {
                name: workload.name_any(),
                namespace: workload.namespace().unwrap_or_default(),
                replicas: workload.desired_replicas(),
                ready_replicas: workload.ready_replicas(),
                annotations: workload.annotations().clone(),
            })
            .collect())
    }
}

#[async_trait]
impl Orchestrator for KubeGateway {
    async fn list_instances(&self, namespace: &str, selector: &str) -> BridgeResult<Vec<Instance>> {
        let list = self
            .pods(namespace)
            .list(&list_params().labels(selector))
            .await
            .map_err(|error| {
                BridgeError::orchestrator(
                    format!("failed to list pods in '{namespace}' matching '{selector}'"),
                    error,
                )
            })?;
        Ok(list.items.iter().map(instance_from_pod).collect())
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> BridgeResult<Option<Instance>> {
        let pod = self.pods(namespace).get_opt(name).await.map_err(|error| {
            BridgeError::orchestrator(format!("failed to fetch pod {namespace}/{name}"), error)
        })?;
        Ok(pod.as_ref().map(instance_from_pod))
    }

    async fn exec_buffered(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<String> {
        debug!(instance = %target, command = ?invocation.command, "exec buffered");
        let mut process = self
            .pods(&target.namespace)
            .exec(
                &target.pod,
                invocation.command.clone(),
                &attach_params(target, invocation),
            )
            .await
            .map_err(|error| exec_error(target, error))?;

        let stdout = process.stdout();
        let stderr = process.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let mut output =
            stdout.map_err(|error| BridgeError::transport(target.to_string(), error))?;
        output.push_str(
            &stderr.map_err(|error| BridgeError::transport(target.to_string(), error))?,
        );

        // A non-zero exit still produced usable output (`screen -ls` exits 1
        // when no sessions exist), so only the transport outcome matters here.
        process
            .join()
            .await
            .map_err(|error| BridgeError::transport(target.to_string(), error))?;
        Ok(output)
    }

    async fn exec_stream(
        &self,
        target: &InstanceAddress,
        invocation: &ExecInvocation,
    ) -> BridgeResult<ExecChannel> {
        self.ensure_container_running(target).await?;
        debug!(instance = %target, command = ?invocation.command, "exec stream");

        let mut process = self
            .pods(&target.namespace)
            .exec(
                &target.pod,
                invocation.command.clone(),
                &attach_params(target, invocation),
            )
            .await
            .map_err(|error| exec_error(target, error))?;

        let input = process
            .stdin()
            .ok_or_else(|| BridgeError::transport(target.to_string(), "exec has no stdin"))?;
        let output = process
            .stdout()
            .ok_or_else(|| BridgeError::transport(target.to_string(), "exec has no stdout"))?;

        Ok(ExecChannel::new(Box::pin(input), Box::pin(output)).with_abort(move || process.abort()))
    }

    async fn list_workloads(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
    ) -> BridgeResult<Vec<WorkloadRecord>> {
        match kind {
            WorkloadKind::Deployment => self.list_scalable::<Deployment>(kind, namespace).await,
            WorkloadKind::StatefulSet => self.list_scalable::<StatefulSet>(kind, namespace).await,
        }
    }

    async fn patch_replicas(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> BridgeResult<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        let params = PatchParams::default();
        let context = || format!("failed to scale {} {namespace}/{name}", kind.title());

        match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let _ = api
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|error| BridgeError::orchestrator(context(), error))?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let _ = api
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|error| BridgeError::orchestrator(context(), error))?;
            }
        }

        info!(kind = %kind, namespace, name, replicas, "scaled workload");
        Ok(())
    }

    async fn list_nodes(&self) -> BridgeResult<Vec<NodeStatus>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&list_params())
            .await
            .map_err(|error| BridgeError::orchestrator("failed to list nodes", error))?;
        let pods: Api<Pod> = Api::all(self.client.clone());
        let pods = pods
            .list(&ListParams::default())
            .await
            .map_err(|error| BridgeError::orchestrator("failed to list pods for nodes", error))?;
        let per_node = pods_per_node(&pods.items);
        Ok(list
            .items
            .iter()
            .map(|node| node_status(node, &per_node))
            .collect())
    }
}

/// Workload kinds that carry a replica count and report ready replicas.
trait ScalableWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    fn desired_replicas(&self) -> i32;
    fn ready_replicas(&self) -> i32;
}

impl ScalableWorkload for Deployment {
    fn desired_replicas(&self) -> i32 {
        self.spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)
    }

    fn ready_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0)
    }
}

impl ScalableWorkload for StatefulSet {
    fn desired_replicas(&self) -> i32 {
        self.spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)
    }

    fn ready_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0)
    }
}

fn attach_params(target: &InstanceAddress, invocation: &ExecInvocation) -> AttachParams {
    // The API server rejects a separate stderr stream on tty execs.
    AttachParams::default()
        .container(target.container.clone())
        .stdin(invocation.stdin)
        .stdout(invocation.stdout)
        .stderr(invocation.stderr && !invocation.tty)
        .tty(invocation.tty)
}

/// The pod can disappear between locating it and opening the exec.
fn exec_error(target: &InstanceAddress, error: kube::Error) -> BridgeError {
    match &error {
        kube::Error::Api(status) if status.is_not_found() => BridgeError::NotFound {
            namespace: target.namespace.clone(),
            workload: target.pod.clone(),
        },
        _ => BridgeError::transport(target.to_string(), error),
    }
}

async fn read_stream(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn instance_from_pod(pod: &Pod) -> Instance {
    let status = pod.status.as_ref();
    let running_containers = status
        .and_then(|status| status.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter(|container| {
            container
                .state
                .as_ref()
                .is_some_and(|state| state.running.is_some())
        })
        .map(|container| container.name.clone())
        .collect();

    Instance {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        phase: status
            .and_then(|status| status.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        running_containers,
    }
}

fn pods_per_node(pods: &[Pod]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for node in pods
        .iter()
        .filter_map(|pod| pod.spec.as_ref()?.node_name.as_ref())
    {
        *counts.entry(node.clone()).or_default() += 1;
    }
    counts
}

fn node_status(node: &Node, pods_per_node: &HashMap<String, usize>) -> NodeStatus {
    let name = node.name_any();
    let status = node.status.as_ref();
    let ready = status
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == "Ready")
        })
        .is_some_and(|condition| condition.status == "True");
    let ip = status
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| addresses.first())
        .map(|address| address.address.clone())
        .unwrap_or_else(|| "-".to_string());
    let info = status.and_then(|status| status.node_info.as_ref());

    NodeStatus {
        pods: pods_per_node.get(&name).copied().unwrap_or(0),
        name,
        status: if ready { "Ready" } else { "Not Ready" }.to_string(),
        ip,
        os: info
            .map(|info| info.os_image.clone())
            .unwrap_or_else(|| "-".to_string()),
        kubelet_version: info
            .map(|info| info.kubelet_version.clone())
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn list_params() -> ListParams {
    ListParams::default().limit(500)
}
