use crate::bridge::Outbound;
use crate::cluster::Orchestrator;
use crate::config::StatusConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::model::{SharedSnapshot, StatusSnapshot, WorkloadKind, WorkloadRecord, WorkloadStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

#[async_trait]
pub trait Feed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self) -> BridgeResult<String>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OwnerFilter {
    pub key: String,
    pub owner: String,
}

pub struct WorkloadFeed {
    orchestrator: Arc<dyn Orchestrator>,
    kind: WorkloadKind,
    namespace: Option<String>,
    managed_by: (String, String),
    owner: Option<OwnerFilter>,
}

impl WorkloadFeed {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        kind: WorkloadKind,
        namespace: Option<String>,
        status: &StatusConfig,
    ) -> Self {
        Self {
            orchestrator,
            kind,
            namespace,
            managed_by: (status.managed_by_key.clone(), status.managed_by_value.clone()),
            owner: None,
        }
    }

    pub fn for_owner(mut self, owner: OwnerFilter) -> Self {
        self.owner = Some(owner);
        self
    }

    pub async fn snapshot(&self) -> BridgeResult<StatusSnapshot> {
        let records = self
            .orchestrator
            .list_workloads(self.kind, self.namespace.as_deref())
            .await?;
        Ok(build_snapshot(
            self.kind,
            &records,
            (&self.managed_by.0, &self.managed_by.1),
            self.owner.as_ref(),
        ))
    }
}

#[async_trait]
impl Feed for WorkloadFeed {
    fn name(&self) -> &'static str {
        self.kind.status_type()
    }

    async fn render(&self) -> BridgeResult<String> {
        let snapshot = self.snapshot().await?;
        serde_json::to_string(&snapshot)
            .map_err(|error| BridgeError::orchestrator("failed to encode status snapshot", error))
    }
}

pub struct NodeFeed {
    orchestrator: Arc<dyn Orchestrator>,
}

impl NodeFeed {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Feed for NodeFeed {
    fn name(&self) -> &'static str {
        "nodes"
    }

    async fn render(&self) -> BridgeResult<String> {
        let nodes = self.orchestrator.list_nodes().await?;
        serde_json::to_string(&serde_json::json!({ "nodes": nodes }))
            .map_err(|error| BridgeError::orchestrator("failed to encode node list", error))
    }
}

/// Keep workloads carrying the managed-by annotation (and the owner
/// annotation, when filtered), sorted by namespace then name.
pub fn build_snapshot(
    kind: WorkloadKind,
    records: &[WorkloadRecord],
    managed_by: (&str, &str),
    owner: Option<&OwnerFilter>,
) -> StatusSnapshot {
    let mut data = records
        .iter()
        .filter(|record| {
            record
                .annotations
                .get(managed_by.0)
                .is_some_and(|value| value == managed_by.1)
        })
        .filter(|record| {
            owner.is_none_or(|filter| {
                record
                    .annotations
                    .get(&filter.key)
                    .is_some_and(|value| value == &filter.owner)
            })
        })
        .map(WorkloadStatus::from)
        .collect::<Vec<_>>();
    data.sort_by(|left, right| {
        left.namespace
            .cmp(&right.namespace)
            .then_with(|| left.name.cmp(&right.name))
    });

    StatusSnapshot {
        kind: kind.status_type(),
        data,
    }
}

/// Poll `feed` every `period` and push each result to one socket. Returns
/// once the socket is gone.
pub async fn run_private_feed(
    conn_id: u64,
    feed: Arc<dyn Feed>,
    period: Duration,
    outbound: mpsc::Sender<Outbound>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = outbound.closed() => break,
        }
        match feed.render().await {
            Ok(message) => {
                if outbound.send(Outbound::Text(message)).await.is_err() {
                    break;
                }
            }
            Err(error) => warn!(conn_id, feed = feed.name(), error = %error, "status poll failed"),
        }
    }
    debug!(conn_id, feed = feed.name(), "private status feed stopped");
}

pub struct StatusHub {
    feed: WorkloadFeed,
    period: Duration,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Outbound>>>,
    latest: RwLock<Option<SharedSnapshot>>,
}

impl StatusHub {
    pub fn new(feed: WorkloadFeed, period: Duration) -> Self {
        Self {
            feed,
            period,
            subscribers: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
        }
    }

    /// Register a socket. It is sent the last snapshot right away, polling
    /// once if no tick has produced one yet.
    pub async fn subscribe(&self, conn_id: u64, sender: mpsc::Sender<Outbound>) {
        let latest = self.latest.read().await.clone();
        let snapshot = match latest {
            Some(snapshot) => Some(snapshot),
            None => self.refresh().await,
        };
        if let Some(message) = snapshot.as_deref().and_then(encode) {
            let _ = sender.try_send(Outbound::Text(message));
        }
        self.subscribers.write().await.insert(conn_id, sender);
        info!(conn_id, feed = self.feed.name(), "status subscriber added");
    }

    pub async fn unsubscribe(&self, conn_id: u64) {
        if self.subscribers.write().await.remove(&conn_id).is_some() {
            info!(conn_id, feed = self.feed.name(), "status subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Poll once and deliver to everyone subscribed at this moment. Returns
    /// the number of sockets that received the snapshot.
    pub async fn tick(&self) -> usize {
        let targets = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(conn_id, sender)| (*conn_id, sender.clone()))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return 0;
        }

        let Some(snapshot) = self.refresh().await else {
            return 0;
        };
        let Some(message) = encode(&snapshot) else {
            return 0;
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(Outbound::Text(message.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(conn_id, "status subscriber is behind, skipping tick")
                }
                Err(TrySendError::Closed(_)) => gone.push(conn_id),
            }
        }
        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for conn_id in gone {
                subscribers.remove(&conn_id);
                info!(conn_id, "status subscriber disconnected");
            }
        }

        debug!(
            feed = self.feed.name(),
            workloads = snapshot.data.len(),
            delivered,
            "status tick"
        );
        delivered
    }

    async fn refresh(&self) -> Option<SharedSnapshot> {
        match self.feed.snapshot().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.latest.write().await = Some(snapshot.clone());
                Some(snapshot)
            }
            Err(error) => {
                warn!(feed = self.feed.name(), error = %error, "status poll failed");
                None
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(feed = self.feed.name(), period = ?self.period, "status hub started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(feed = self.feed.name(), "status hub stopped");
    }
}

fn encode(snapshot: &StatusSnapshot) -> Option<String> {
    match serde_json::to_string(snapshot) {
        Ok(message) => Some(message),
        Err(error) => {
            warn!(error = %error, "failed to encode status snapshot");
            None
        }
    }
}
