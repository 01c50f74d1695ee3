//! Deploy-or-patch of instance resources, waits and ordered teardown.

use std::sync::Arc;
use std::time::Duration;

use fleet_common::k8s_openapi::api::core::v1::Pod;
use fleet_common::wait::poll_until;
use fleet_common::{
    labels, FleetError, InstanceKind, Manifest, ResourceClient, ResourceError, ResourceKind, Result,
    RunContext, WaitOptions,
};
use tracing::{debug, info, instrument, warn};

pub mod manifests;
pub mod workload;

pub use manifests::Labels;
pub use workload::{Port, Probe, ProbeAction, Probes, Protocol, Resources, RuntimeFile, Volume, WorkloadSpec};

/// Tick of every pod-phase poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kinds removed by a run purge, compute first.
pub const PURGE_ORDER: &[ResourceKind] = &[
    ResourceKind::ReplicaSet,
    ResourceKind::Job,
    ResourceKind::Pod,
    ResourceKind::PersistentVolumeClaim,
    ResourceKind::ConfigMap,
    ResourceKind::NetworkPolicy,
    ResourceKind::Service,
    ResourceKind::RoleBinding,
    ResourceKind::Role,
    ResourceKind::ServiceAccount,
];

#[derive(Clone)]
pub struct ResourceOrchestrator {
    client: Arc<dyn ResourceClient>,
    run: Arc<RunContext>,
}

fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

impl ResourceOrchestrator {
    pub fn new(client: Arc<dyn ResourceClient>, run: Arc<RunContext>) -> Self {
        Self { client, run }
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    pub fn run(&self) -> &Arc<RunContext> {
        &self.run
    }

    /// User labels overlaid with the run and identity labels.
    pub fn labels_for(&self, spec: &WorkloadSpec) -> Labels {
        let mut set = spec.labels.clone();
        set.extend(
            self.run
                .labels_for(&spec.name, &spec.generated_name, spec.kind),
        );
        set
    }

    /// Creates `manifest` if absent, patches it otherwise.
    async fn apply(&self, manifest: Manifest) -> Result<Manifest> {
        let kind = manifest.kind();
        let name = manifest.name().to_string();
        let existing = self
            .client
            .get(kind, &name)
            .await
            .map_err(FleetError::resource(&name))?;
        let applied = match existing {
            Some(_) => {
                debug!(%kind, %name, "patching existing resource");
                self.client.patch(&manifest).await
            }
            None => match self.client.create(&manifest).await {
                Err(ResourceError::AlreadyExists) => self.client.patch(&manifest).await,
                other => other,
            },
        };
        applied.map_err(FleetError::resource(name))
    }

    /// Networking, storage, content maps and identity, each only when declared.
    #[instrument(skip(self, spec), fields(instance = %spec.generated_name))]
    pub async fn deploy_auxiliary(&self, spec: &WorkloadSpec) -> Result<()> {
        if !spec.all_ports().is_empty() {
            self.ensure_service(spec).await?;
        }
        for part in spec.containers() {
            let set = self.labels_for(part);
            if !part.volumes.is_empty() {
                self.apply(manifests::claim(part, &set)?.into()).await?;
            }
            if !part.files.is_empty() {
                self.apply(manifests::config_map(part, &set).into()).await?;
            }
        }
        if spec.needs_identity() {
            let set = self.labels_for(spec);
            self.apply(manifests::service_account(spec, &set).into()).await?;
            self.apply(manifests::role(spec, &set).into()).await?;
            self.apply(manifests::role_binding(spec, &set, self.client.namespace()).into())
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(instance = %spec.generated_name))]
    pub async fn deploy_compute(&self, spec: &WorkloadSpec) -> Result<()> {
        let set = self.labels_for(spec);
        self.apply(manifests::replica_set(spec, &set).into()).await?;
        info!(instance = %spec.generated_name, image = %spec.image, "compute deployed");
        Ok(())
    }

    /// Ensures the Service exists and returns its cluster address.
    pub async fn ensure_service(&self, spec: &WorkloadSpec) -> Result<String> {
        if spec.all_ports().is_empty() {
            return Err(FleetError::InvalidArgument(format!(
                "instance '{}' declares no ports to expose",
                spec.name
            )));
        }
        let set = self.labels_for(spec);
        let applied = self.apply(manifests::service(spec, &set).into()).await?;
        let ip = applied
            .into_service()
            .and_then(|svc| svc.spec)
            .and_then(|spec| spec.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None");
        Ok(ip.unwrap_or_else(|| {
            format!(
                "{}.{}.svc.cluster.local",
                spec.generated_name,
                self.client.namespace()
            )
        }))
    }

    /// Rolls compute to `spec.image` in place: patch the template, then
    /// delete the running pod so it is recreated from it.
    #[instrument(skip(self, spec), fields(instance = %spec.generated_name, image = %spec.image))]
    pub async fn swap_image(&self, spec: &WorkloadSpec) -> Result<()> {
        let name = &spec.generated_name;
        if self
            .client
            .get(ResourceKind::ReplicaSet, name)
            .await
            .map_err(FleetError::resource(name))?
            .is_none()
        {
            return Err(FleetError::Resource {
                name: name.clone(),
                source: ResourceError::NotFound,
            });
        }
        self.deploy_compute(spec).await?;
        for pod in self.pods(spec).await? {
            if let Some(pod_name) = pod.metadata.name {
                self.client
                    .delete(ResourceKind::Pod, &pod_name)
                    .await
                    .map_err(FleetError::resource(pod_name))?;
            }
        }
        Ok(())
    }

    /// Removes compute only; volumes and other resources stay.
    pub async fn stop_compute(&self, spec: &WorkloadSpec) -> Result<()> {
        self.client
            .delete(ResourceKind::ReplicaSet, &spec.generated_name)
            .await
            .map_err(FleetError::resource(&spec.generated_name))
    }

    pub async fn pods(&self, spec: &WorkloadSpec) -> Result<Vec<Pod>> {
        self.pods_of(&spec.generated_name).await
    }

    /// Pods of the instance whose generated name is `owner`.
    pub async fn pods_of(&self, owner: &str) -> Result<Vec<Pod>> {
        self.client
            .list_pods(&format!("{}={}", labels::APP, owner))
            .await
            .map_err(FleetError::resource(owner))
    }

    pub async fn wait_running(&self, spec: &WorkloadSpec, opts: &WaitOptions) -> Result<()> {
        let selector = spec.pod_selector();
        let client = &self.client;
        let name = &spec.generated_name;
        poll_until(opts, POLL_INTERVAL, "start", name, || {
            let selector = &selector;
            async move {
                let pods = client
                    .list_pods(selector)
                    .await
                    .map_err(FleetError::resource(name))?;
                Ok(pods.iter().any(is_running).then_some(()))
            }
        })
        .await
    }

    pub async fn wait_stopped(&self, spec: &WorkloadSpec, opts: &WaitOptions) -> Result<()> {
        let selector = spec.pod_selector();
        let client = &self.client;
        let name = &spec.generated_name;
        poll_until(opts, POLL_INTERVAL, "stop", name, || {
            let selector = &selector;
            async move {
                let pods = client
                    .list_pods(selector)
                    .await
                    .map_err(FleetError::resource(name))?;
                Ok(pods.is_empty().then_some(()))
            }
        })
        .await
    }

    /// Name of the running pod of `owner`.
    pub async fn running_pod(&self, owner: &str) -> Result<String> {
        self.pods_of(owner)
            .await?
            .into_iter()
            .find(is_running)
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| FleetError::Resource {
                name: owner.to_string(),
                source: ResourceError::NotFound,
            })
    }

    /// Runs `command` in `container` of the pod owned by `owner` and returns
    /// its stdout untouched.
    pub async fn exec(&self, owner: &str, container: &str, command: &[String]) -> Result<Vec<u8>> {
        let pod = self.running_pod(owner).await?;
        debug!(%pod, %container, ?command, "exec");
        self.client
            .exec(&pod, container, command)
            .await
            .map_err(FleetError::resource(pod))
    }

    pub async fn logs(&self, owner: &str, container: &str) -> Result<String> {
        let pod = self.running_pod(owner).await?;
        self.client
            .pod_logs(&pod, container)
            .await
            .map_err(FleetError::resource(pod))
    }

    pub async fn disable_network(&self, spec: &WorkloadSpec) -> Result<()> {
        let set = self.labels_for(spec);
        self.apply(manifests::deny_policy(spec, &set)?.into()).await?;
        info!(instance = %spec.generated_name, "network disabled");
        Ok(())
    }

    pub async fn enable_network(&self, spec: &WorkloadSpec) -> Result<()> {
        self.client
            .delete(ResourceKind::NetworkPolicy, &spec.generated_name)
            .await
            .map_err(FleetError::resource(&spec.generated_name))?;
        info!(instance = %spec.generated_name, "network enabled");
        Ok(())
    }

    pub async fn network_disabled(&self, spec: &WorkloadSpec) -> Result<bool> {
        Ok(self
            .client
            .get(ResourceKind::NetworkPolicy, &spec.generated_name)
            .await
            .map_err(FleetError::resource(&spec.generated_name))?
            .is_some())
    }

    /// Deletes everything the instance may own, in dependency order, and
    /// reports every failed deletion together.
    #[instrument(skip(self, spec), fields(instance = %spec.generated_name))]
    pub async fn teardown(&self, spec: &WorkloadSpec) -> Result<()> {
        let name = spec.generated_name.clone();
        let mut steps = vec![(ResourceKind::ReplicaSet, name.clone())];
        steps.extend(
            spec.containers()
                .map(|c| (ResourceKind::PersistentVolumeClaim, c.claim_name())),
        );
        steps.extend(spec.containers().map(|c| (ResourceKind::ConfigMap, c.files_name())));
        steps.extend([
            (ResourceKind::NetworkPolicy, name.clone()),
            (ResourceKind::Service, name.clone()),
            (ResourceKind::RoleBinding, name.clone()),
            (ResourceKind::Role, name.clone()),
            (ResourceKind::ServiceAccount, name.clone()),
        ]);

        let mut failures = Vec::new();
        for (kind, resource) in steps {
            if let Err(e) = self.client.delete(kind, &resource).await {
                warn!(%kind, %resource, error = %e, "teardown step failed");
                failures.push(format!("{kind}/{resource}: {e}"));
            }
        }
        if failures.is_empty() {
            info!(instance = %name, "instance torn down");
            Ok(())
        } else {
            Err(FleetError::Teardown {
                instance: name,
                failures,
            })
        }
    }

    /// Deletes every resource labeled with this run, sparing instances of kind `spare`.
    #[instrument(skip(self), fields(run = %self.run.run_id()))]
    pub async fn purge_run(&self, spare: Option<InstanceKind>) -> Result<()> {
        let mut selector = self.run.run_selector();
        if let Some(kind) = spare {
            selector.push_str(&format!(",{}!={}", labels::KIND, kind.as_str()));
        }
        let mut failures = Vec::new();
        for kind in PURGE_ORDER {
            if let Err(e) = self.client.delete_labeled(*kind, &selector).await {
                warn!(%kind, error = %e, "purge step failed");
                failures.push(format!("{kind}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Teardown {
                instance: self.run.run_id().to_string(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::testing::InMemoryClient;
    use fleet_common::CancellationToken;
    use k8s_openapi::api::rbac::v1::PolicyRule;

    fn setup() -> (InMemoryClient, ResourceOrchestrator) {
        let client = InMemoryClient::default();
        let run = Arc::new(RunContext::new("run-7", "testfleet", Duration::from_secs(3600)).unwrap());
        let orchestrator = ResourceOrchestrator::new(Arc::new(client.clone()), run);
        (client, orchestrator)
    }

    fn web() -> WorkloadSpec {
        let mut spec = WorkloadSpec::new("web", "web-1a2b3c4d", "nginx:1.27");
        spec.ports.push(Port::tcp(80));
        spec.volumes.push(Volume {
            path: "/data".to_string(),
            size: "1Gi".to_string(),
            owner: 101,
        });
        spec.files.push(RuntimeFile {
            contents: b"ok".to_vec(),
            destination: "/usr/share/nginx/html/health".to_string(),
            mode: None,
        });
        spec.policy_rules.push(PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
        spec
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("missing call {call}: {calls:?}"))
    }

    #[tokio::test]
    async fn second_deploy_patches_instead_of_recreating() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let spec = web();
        orchestrator.deploy_auxiliary(&spec).await?;
        orchestrator.deploy_auxiliary(&spec).await?;

        let calls = client.calls();
        let creates = calls.iter().filter(|c| *c == "create Service/web-1a2b3c4d").count();
        assert_eq!(creates, 1);
        assert!(calls.contains(&"patch Service/web-1a2b3c4d".to_string()));
        assert!(calls.contains(&"patch PersistentVolumeClaim/web-1a2b3c4d-data".to_string()));
        assert!(client.contains(ResourceKind::RoleBinding, "web-1a2b3c4d"));
        Ok(())
    }

    #[tokio::test]
    async fn auxiliary_resources_only_when_declared() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let spec = WorkloadSpec::new("bare", "bare-00000000", "alpine");
        orchestrator.deploy_auxiliary(&spec).await?;
        assert!(client.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn every_resource_carries_run_labels() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let mut spec = web();
        spec.labels.insert("team".to_string(), "net".to_string());
        orchestrator.deploy_auxiliary(&spec).await?;
        orchestrator.deploy_compute(&spec).await?;

        for kind in ResourceKind::ALL {
            for name in client.names(*kind) {
                let set = client.object(*kind, &name).unwrap().labels();
                assert_eq!(set[labels::RUN], "run-7", "{kind}/{name}");
                assert_eq!(set[labels::GENERATED_NAME], "web-1a2b3c4d");
                assert_eq!(set[labels::KIND], "basic");
                assert_eq!(set[labels::MANAGED_BY], labels::MANAGER);
                assert!(set.contains_key(labels::RUN_STARTED));
            }
        }
        let pods = orchestrator.pods(&spec).await?;
        assert_eq!(pods[0].metadata.labels.as_ref().unwrap()["team"], "net");
        Ok(())
    }

    #[tokio::test]
    async fn address_creates_service_on_demand() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let ip = orchestrator.ensure_service(&web()).await?;
        assert_eq!(ip, "10.96.0.1");
        assert!(client.contains(ResourceKind::Service, "web-1a2b3c4d"));

        let bare = WorkloadSpec::new("bare", "bare-1", "alpine");
        assert!(orchestrator.ensure_service(&bare).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn teardown_follows_dependency_order() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let spec = web();
        orchestrator.deploy_auxiliary(&spec).await?;
        orchestrator.disable_network(&spec).await?;
        orchestrator.deploy_compute(&spec).await?;
        orchestrator.teardown(&spec).await?;

        let calls = client.calls();
        let order = [
            "delete ReplicaSet/web-1a2b3c4d",
            "delete PersistentVolumeClaim/web-1a2b3c4d-data",
            "delete ConfigMap/web-1a2b3c4d-files",
            "delete NetworkPolicy/web-1a2b3c4d",
            "delete Service/web-1a2b3c4d",
            "delete RoleBinding/web-1a2b3c4d",
            "delete Role/web-1a2b3c4d",
            "delete ServiceAccount/web-1a2b3c4d",
        ];
        let positions: Vec<usize> = order.iter().map(|c| position(&calls, c)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{calls:?}");
        for kind in ResourceKind::ALL {
            assert!(client.names(*kind).is_empty(), "{kind} left behind");
        }
        Ok(())
    }

    #[tokio::test]
    async fn teardown_collects_every_failure() {
        let (client, orchestrator) = setup();
        let spec = web();
        orchestrator.deploy_auxiliary(&spec).await.unwrap();
        orchestrator.deploy_compute(&spec).await.unwrap();
        client.fail_on("delete", ResourceKind::Service, "web-1a2b3c4d", "service stuck");
        client.fail_on("delete", ResourceKind::PersistentVolumeClaim, "web-1a2b3c4d-data", "claim stuck");

        let err = orchestrator.teardown(&spec).await.unwrap_err();
        match err {
            FleetError::Teardown { instance, failures } => {
                assert_eq!(instance, "web-1a2b3c4d");
                assert_eq!(failures.len(), 2);
                assert!(failures[0].contains("claim stuck"));
                assert!(failures[1].contains("service stuck"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Steps after a failure still ran.
        assert!(!client.contains(ResourceKind::ServiceAccount, "web-1a2b3c4d"));
        assert!(!client.contains(ResourceKind::ReplicaSet, "web-1a2b3c4d"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_running_times_out_on_pending_compute() {
        let (client, orchestrator) = setup();
        client.set_pods_running(false);
        let spec = WorkloadSpec::new("slow", "slow-1", "alpine");
        orchestrator.deploy_compute(&spec).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = orchestrator
            .wait_running(&spec, &WaitOptions::new(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(62));
    }

    #[tokio::test]
    async fn wait_running_honors_cancellation() {
        let (client, orchestrator) = setup();
        client.set_pods_running(false);
        let spec = WorkloadSpec::new("slow", "slow-1", "alpine");
        orchestrator.deploy_compute(&spec).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = WaitOptions::new(Duration::from_secs(60)).with_cancel(cancel);
        assert!(orchestrator.wait_running(&spec, &opts).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn stop_removes_compute_only() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let spec = web();
        orchestrator.deploy_auxiliary(&spec).await?;
        orchestrator.deploy_compute(&spec).await?;
        orchestrator
            .wait_running(&spec, &WaitOptions::new(Duration::from_secs(5)))
            .await?;

        orchestrator.stop_compute(&spec).await?;
        orchestrator
            .wait_stopped(&spec, &WaitOptions::new(Duration::from_secs(5)))
            .await?;
        assert!(client.contains(ResourceKind::PersistentVolumeClaim, "web-1a2b3c4d-data"));
        assert!(client.contains(ResourceKind::Service, "web-1a2b3c4d"));
        Ok(())
    }

    #[tokio::test]
    async fn image_swap_replaces_the_pod() -> anyhow::Result<()> {
        let (_client, orchestrator) = setup();
        let mut spec = WorkloadSpec::new("app", "app-1", "app:v1");
        orchestrator.deploy_compute(&spec).await?;
        let before = orchestrator.running_pod(&spec.generated_name).await?;

        spec.image = "app:v2".to_string();
        orchestrator.swap_image(&spec).await?;
        let pods = orchestrator.pods(&spec).await?;
        assert_eq!(pods.len(), 1);
        assert_ne!(pods[0].metadata.name.as_deref(), Some(before.as_str()));
        let image = pods[0].spec.as_ref().unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("app:v2"));
        Ok(())
    }

    #[tokio::test]
    async fn swap_without_compute_fails() {
        let (_client, orchestrator) = setup();
        let spec = WorkloadSpec::new("app", "app-1", "app:v1");
        assert!(orchestrator.swap_image(&spec).await.is_err());
    }

    #[tokio::test]
    async fn network_toggle() -> anyhow::Result<()> {
        let (_client, orchestrator) = setup();
        let spec = web();
        assert!(!orchestrator.network_disabled(&spec).await?);
        orchestrator.disable_network(&spec).await?;
        assert!(orchestrator.network_disabled(&spec).await?);
        orchestrator.enable_network(&spec).await?;
        assert!(!orchestrator.network_disabled(&spec).await?);
        Ok(())
    }

    #[tokio::test]
    async fn purge_spares_the_reaper() -> anyhow::Result<()> {
        let (client, orchestrator) = setup();
        let spec = web();
        orchestrator.deploy_compute(&spec).await?;
        let mut reaper = WorkloadSpec::new("reaper", "reaper-1", "bitnami/kubectl");
        reaper.kind = InstanceKind::TimeoutReaper;
        orchestrator.deploy_compute(&reaper).await?;

        orchestrator.purge_run(Some(InstanceKind::TimeoutReaper)).await?;
        assert!(!client.contains(ResourceKind::ReplicaSet, "web-1a2b3c4d"));
        assert!(client.contains(ResourceKind::ReplicaSet, "reaper-1"));
        assert!(client
            .calls()
            .contains(&"delete-labeled Service/testfleet.io/run=run-7,testfleet.io/kind!=timeout-reaper".to_string()));
        Ok(())
    }
}
