use crate::cluster::Orchestrator;
use crate::config::{BridgeConfig, LocatorStrategy};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{InstanceAddress, WorkloadRef};
use tracing::debug;

pub async fn resolve(
    orchestrator: &dyn Orchestrator,
    config: &BridgeConfig,
    workload: &WorkloadRef,
) -> BridgeResult<InstanceAddress> {
    let instance = match config.locator {
        LocatorStrategy::LabelSelector => {
            let selector = format!("{}={}", config.instance_label, workload.workload);
            let instances = orchestrator
                .list_instances(&workload.namespace, &selector)
                .await?;
            instances.into_iter().find(|instance| instance.is_running())
        }
        LocatorStrategy::Ordinal => orchestrator
            .get_instance(&workload.namespace, &ordinal_pod_name(&workload.workload))
            .await?
            .filter(|instance| instance.is_running()),
    };

    let Some(instance) = instance else {
        return Err(BridgeError::NotFound {
            namespace: workload.namespace.clone(),
            workload: workload.workload.clone(),
        });
    };
    // A crash-looping container leaves the pod phase at Running.
    if !instance
        .running_containers
        .iter()
        .any(|name| name == &workload.container)
    {
        return Err(BridgeError::ContainerNotReady {
            instance: format!("{}/{}", workload.namespace, instance.name),
            container: workload.container.clone(),
        });
    }
    let pod = instance.name;

    debug!(workload = %workload, pod = %pod, "resolved workload instance");
    Ok(InstanceAddress {
        namespace: workload.namespace.clone(),
        pod,
        container: workload.container.clone(),
    })
}

pub fn ordinal_pod_name(workload: &str) -> String {
    format!("{workload}-0")
}

#[cfg(test)]
mod tests {
    use super::{ordinal_pod_name, resolve};
    use crate::config::{BridgeConfig, LocatorStrategy};
    use crate::error::BridgeError;
    use crate::model::WorkloadRef;
    use crate::testing::{FakeOrchestrator, running_instance};

    #[tokio::test]
    async fn first_running_instance_in_listing_order_wins() {
        let fake = FakeOrchestrator::new();
        let mut pending = running_instance("default", "mc-server-2");
        pending.phase = "Pending".to_string();
        fake.add_instances(
            "app=mc-server",
            vec![
                pending,
                running_instance("default", "mc-server-1"),
                running_instance("default", "mc-server-0"),
            ],
        );

        let address = resolve(
            &fake,
            &BridgeConfig::default(),
            &WorkloadRef::new("default", "mc-server", "minecraft-server"),
        )
        .await
        .expect("resolved");

        assert_eq!(address.pod, "mc-server-1");
        assert_eq!(address.container, "minecraft-server");
    }

    #[tokio::test]
    async fn zero_instances_is_not_found_without_exec() {
        let fake = FakeOrchestrator::new();
        let result = resolve(
            &fake,
            &BridgeConfig::default(),
            &WorkloadRef::new("default", "ghost", "minecraft-server"),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::NotFound { .. })));
        assert!(fake.invocations().is_empty());
    }

    #[tokio::test]
    async fn stopped_container_in_running_pod_is_not_ready() {
        let fake = FakeOrchestrator::new();
        let mut crashing = running_instance("default", "mc-server-0");
        crashing.running_containers = vec!["metrics-sidecar".to_string()];
        fake.add_instances("app=mc-server", vec![crashing]);

        let result = resolve(
            &fake,
            &BridgeConfig::default(),
            &WorkloadRef::new("default", "mc-server", "minecraft-server"),
        )
        .await;

        match result {
            Err(BridgeError::ContainerNotReady {
                instance,
                container,
            }) => {
                assert_eq!(instance, "default/mc-server-0");
                assert_eq!(container, "minecraft-server");
            }
            other => panic!("expected container_not_ready, got {other:?}"),
        }
        assert!(fake.invocations().is_empty());
    }

    #[tokio::test]
    async fn ordinal_strategy_derives_pod_name() {
        let fake = FakeOrchestrator::new();
        fake.add_instances("", vec![running_instance("games", "mc-server-0")]);
        let config = BridgeConfig {
            locator: LocatorStrategy::Ordinal,
            ..BridgeConfig::default()
        };

        let address = resolve(
            &fake,
            &config,
            &WorkloadRef::new("games", "mc-server", "minecraft-server"),
        )
        .await
        .expect("resolved");
        assert_eq!(address.pod, ordinal_pod_name("mc-server"));
        assert_eq!(address.namespace, "games");
    }
}
