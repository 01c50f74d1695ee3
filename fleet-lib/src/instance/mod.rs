//! Instance lifecycle: one declared workload moving through
//! None -> Preparing -> Committed -> Started <-> Stopped -> Destroyed.
//!
//! All mutable state of an instance sits behind one async mutex that is held
//! for a whole transition, so two concurrent starts resolve to one success and
//! one illegal-transition error. Distinct instances never contend.

mod declare;
mod runtime;

use std::fmt;
use std::sync::Arc;

use fleet_builder::{BuildPlan, ImageReference};
use fleet_common::run::generate_name;
use fleet_common::{FleetError, InstanceKind, InstanceState, Result, WaitOptions};
use fleet_orchestrator::WorkloadSpec;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::pool::InstancePool;
use crate::shaper::NetworkShaper;
use crate::sidecar::Sidecar;
use crate::Shared;

/// States in which runtime configuration may still be declared.
const DECLARABLE: &[InstanceState] = &[
    InstanceState::None,
    InstanceState::Preparing,
    InstanceState::Committed,
];

pub struct Instance {
    name: String,
    generated_name: String,
    shared: Arc<Shared>,
    core: Mutex<Core>,
}

#[derive(Default)]
struct Core {
    state: InstanceState,
    kind: InstanceKind,
    /// Build source and operations, set once a source is declared.
    plan: Option<BuildPlan>,
    /// Reference the compute runs, set on commit.
    image: Option<String>,
    workload: WorkloadSpec,
    sidecars: Vec<Arc<dyn Sidecar>>,
    /// Generated name of the instance this one is a sidecar of.
    parent: Option<String>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("generated_name", &self.generated_name)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(name: &str, kind: InstanceKind, shared: Arc<Shared>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(FleetError::InvalidArgument(
                "instance name must not be empty".to_string(),
            ));
        }
        let generated_name = generate_name(name);
        let mut workload = WorkloadSpec::new(name, generated_name.clone(), "");
        workload.kind = kind;
        Ok(Self {
            name: name.to_string(),
            generated_name,
            shared,
            core: Mutex::new(Core {
                kind,
                workload,
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster-unique name, fixed at construction.
    pub fn generated_name(&self) -> &str {
        &self.generated_name
    }

    pub async fn state(&self) -> InstanceState {
        self.core.lock().await.state
    }

    pub async fn kind(&self) -> InstanceKind {
        self.core.lock().await.kind
    }

    /// Image the compute runs; known from commit on.
    pub async fn image(&self) -> Option<String> {
        self.core.lock().await.image.clone()
    }

    /// Generated name of the parent, when attached as a sidecar.
    pub async fn parent(&self) -> Option<String> {
        self.core.lock().await.parent.clone()
    }

    pub async fn sidecars(&self) -> Vec<Arc<dyn Sidecar>> {
        self.core.lock().await.sidecars.clone()
    }

    fn ensure(&self, core: &Core, operation: &'static str, allowed: &[InstanceState]) -> Result<()> {
        if allowed.contains(&core.state) {
            Ok(())
        } else {
            Err(FleetError::IllegalTransition {
                instance: self.name.clone(),
                operation,
                state: core.state,
            })
        }
    }

    fn ensure_detached(&self, core: &Core, operation: &str) -> Result<()> {
        match &core.parent {
            Some(parent) => Err(FleetError::InvalidArgument(format!(
                "cannot {operation} '{}': it is a sidecar of '{parent}' and follows its lifecycle",
                self.name
            ))),
            None => Ok(()),
        }
    }

    /// Full deployable shape: own declaration plus every sidecar's.
    async fn deploy_spec(&self, core: &Core) -> WorkloadSpec {
        let mut spec = core.workload.clone();
        spec.image = core.image.clone().unwrap_or_default();
        spec.kind = core.kind;
        spec.sidecars.clear();
        for sidecar in &core.sidecars {
            spec.sidecars.push(sidecar.instance().own_spec().await);
        }
        spec
    }

    /// Declaration of this instance alone, as folded into a parent's pod.
    pub(crate) async fn own_spec(&self) -> WorkloadSpec {
        let core = self.core.lock().await;
        let mut spec = core.workload.clone();
        spec.image = core.image.clone().unwrap_or_default();
        spec.kind = core.kind;
        spec.sidecars.clear();
        spec
    }

    pub(crate) async fn set_kind(&self, kind: InstanceKind) {
        let mut core = self.core.lock().await;
        core.kind = kind;
        core.workload.kind = kind;
    }

    /// Moves a sidecar along with its parent.
    pub(crate) async fn follow(&self, state: InstanceState) {
        self.core.lock().await.state = state;
    }

    async fn follow_all(core: &Core, state: InstanceState) {
        for sidecar in &core.sidecars {
            sidecar.instance().follow(state).await;
        }
    }

    /// Commits with the run timeout as the build deadline.
    pub async fn commit(&self) -> Result<()> {
        let opts = WaitOptions::new(self.shared.orchestrator.run().timeout());
        self.commit_with(&opts).await
    }

    /// Freezes the build configuration and builds when the plan asks for it.
    #[instrument(skip(self, opts), fields(instance = %self.generated_name))]
    pub async fn commit_with(&self, opts: &WaitOptions) -> Result<()> {
        let mut core = self.core.lock().await;
        self.ensure(&core, "commit", &[InstanceState::Preparing])?;
        let Some(plan) = core.plan.clone() else {
            return Err(FleetError::IllegalTransition {
                instance: self.name.clone(),
                operation: "commit",
                state: core.state,
            });
        };

        let image = if plan.requires_build() {
            let config = &self.shared.config;
            let destination =
                ImageReference::content_addressed(&config.registry, &plan, &config.image_tag)?;
            info!(%destination, operations = plan.operations.len(), "building image");
            self.shared.builder.build(&plan, &destination, opts).await?.reference
        } else {
            // Checked by requires_build.
            plan.base_image().unwrap_or_default().to_string()
        };

        debug!(%image, "committed");
        core.workload.image = image.clone();
        core.image = Some(image);
        core.state = InstanceState::Committed;
        Ok(())
    }

    /// Starts with the configured start timeout.
    pub async fn start(&self) -> Result<()> {
        let opts = WaitOptions::new(self.shared.config.start_timeout());
        self.start_with(&opts).await
    }

    /// Deploys the instance and blocks until its pod runs.
    ///
    /// From Committed every declared resource is deployed; from Stopped only
    /// compute. A deadline or cancellation leaves the state unchanged.
    #[instrument(skip(self, opts), fields(instance = %self.generated_name))]
    pub async fn start_with(&self, opts: &WaitOptions) -> Result<()> {
        let mut core = self.core.lock().await;
        self.ensure(
            &core,
            "start",
            &[InstanceState::Committed, InstanceState::Stopped],
        )?;
        self.ensure_detached(&core, "start")?;

        let spec = self.deploy_spec(&core).await;
        let orchestrator = &self.shared.orchestrator;
        if core.state == InstanceState::Committed {
            for sidecar in &core.sidecars {
                sidecar.pre_start().await?;
            }
            orchestrator.deploy_auxiliary(&spec).await?;
        }
        orchestrator.deploy_compute(&spec).await?;
        orchestrator.wait_running(&spec, opts).await?;

        core.state = InstanceState::Started;
        Self::follow_all(&core, InstanceState::Started).await;
        info!("started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let opts = WaitOptions::new(self.shared.config.start_timeout());
        self.stop_with(&opts).await
    }

    /// Removes compute and waits for its pods to go; everything else stays.
    ///
    /// The instance is Stopped as soon as its ReplicaSet is deleted. A deadline
    /// or cancellation while waiting is still reported, and `wait_stopped` or
    /// `start` can follow.
    #[instrument(skip(self, opts), fields(instance = %self.generated_name))]
    pub async fn stop_with(&self, opts: &WaitOptions) -> Result<()> {
        let mut core = self.core.lock().await;
        self.ensure(&core, "stop", &[InstanceState::Started])?;
        self.ensure_detached(&core, "stop")?;

        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.stop_compute(&spec).await?;
        core.state = InstanceState::Stopped;
        Self::follow_all(&core, InstanceState::Stopped).await;

        self.shared.orchestrator.wait_stopped(&spec, opts).await?;
        info!("stopped");
        Ok(())
    }

    pub async fn wait_running(&self, opts: &WaitOptions) -> Result<()> {
        let core = self.core.lock().await;
        self.ensure(&core, "wait_running", &[InstanceState::Started])?;
        self.ensure_detached(&core, "wait on")?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.wait_running(&spec, opts).await
    }

    pub async fn wait_stopped(&self, opts: &WaitOptions) -> Result<()> {
        let core = self.core.lock().await;
        self.ensure(&core, "wait_stopped", &[InstanceState::Stopped])?;
        self.ensure_detached(&core, "wait on")?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.wait_stopped(&spec, opts).await
    }

    /// Tears down every resource of the instance and its sidecars.
    ///
    /// A no-op once Destroyed. Absent resources count as deleted; on failure
    /// the state is kept so the destroy can be retried.
    #[instrument(skip(self), fields(instance = %self.generated_name))]
    pub async fn destroy(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.state == InstanceState::Destroyed {
            return Ok(());
        }
        self.ensure(
            &core,
            "destroy",
            &[
                InstanceState::Committed,
                InstanceState::Started,
                InstanceState::Stopped,
            ],
        )?;
        self.ensure_detached(&core, "destroy")?;

        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.teardown(&spec).await?;

        core.state = InstanceState::Destroyed;
        Self::follow_all(&core, InstanceState::Destroyed).await;
        info!("destroyed");
        Ok(())
    }

    /// Attaches a committed sidecar whose container joins this instance's pod.
    pub async fn add_sidecar(&self, sidecar: Arc<dyn Sidecar>) -> Result<()> {
        let child = sidecar.instance();
        if std::ptr::eq(child, self) {
            return Err(FleetError::InvalidArgument(format!(
                "'{}' cannot be its own sidecar",
                self.name
            )));
        }
        {
            let core = self.core.lock().await;
            self.ensure_can_own(&core)?;
        }

        sidecar.initialize(&self.generated_name).await?;

        // Parent before child, as in deploy_spec. The child is only tried so
        // two instances adding each other back off instead of deadlocking.
        let (mut core, mut child_core) = loop {
            let core = self.core.lock().await;
            if let Ok(child_core) = child.core.try_lock() {
                break (core, child_core);
            }
            drop(core);
            drop(child.core.lock().await);
        };
        self.ensure_can_own(&core)?;
        child.attach_to(&mut child_core, &self.generated_name)?;
        drop(child_core);

        debug!(parent = %self.generated_name, sidecar = %child.generated_name(), "sidecar attached");
        core.sidecars.push(sidecar);
        Ok(())
    }

    fn ensure_can_own(&self, core: &Core) -> Result<()> {
        self.ensure(core, "add_sidecar", DECLARABLE)?;
        if core.parent.is_some() {
            return Err(FleetError::InvalidArgument(format!(
                "sidecar '{}' cannot own sidecars",
                self.name
            )));
        }
        Ok(())
    }

    /// Marks this instance as a sidecar of `parent`.
    fn attach_to(&self, core: &mut Core, parent: &str) -> Result<()> {
        if let Some(existing) = &core.parent {
            return Err(FleetError::InvalidArgument(format!(
                "'{}' is already a sidecar of '{existing}'",
                self.name
            )));
        }
        if !core.sidecars.is_empty() {
            return Err(FleetError::InvalidArgument(format!(
                "'{}' owns sidecars and cannot be attached",
                self.name
            )));
        }
        self.ensure(core, "attach", &[InstanceState::Committed])?;
        core.parent = Some(parent.to_string());
        core.kind = InstanceKind::Sidecar;
        core.workload.kind = InstanceKind::Sidecar;
        Ok(())
    }

    /// Attaches a network shaper and hands it back for fault injection.
    pub async fn enable_network_shaper(&self) -> Result<Arc<NetworkShaper>> {
        let shaper = Arc::new(NetworkShaper::new(&self.name, self.shared.clone())?);
        self.add_sidecar(shaper.clone()).await?;
        Ok(shaper)
    }

    /// Committed copy with a fresh generated name and copies of every sidecar.
    pub async fn clone_with_name(&self, name: &str) -> Result<Instance> {
        if let Some(parent) = self.parent().await {
            return Err(FleetError::InvalidArgument(format!(
                "'{}' is a sidecar of '{parent}'; clone the parent instead",
                self.name
            )));
        }
        self.duplicate(name, None).await
    }

    /// Clone named `{name}{suffix}`.
    pub async fn clone_with_suffix(&self, suffix: &str) -> Result<Instance> {
        self.clone_with_name(&format!("{}{}", self.name, suffix)).await
    }

    pub(crate) async fn duplicate(&self, name: &str, parent: Option<&str>) -> Result<Instance> {
        let core = self.core.lock().await;
        self.ensure(&core, "clone", &[InstanceState::Committed])?;
        if name.trim().is_empty() {
            return Err(FleetError::InvalidArgument(
                "instance name must not be empty".to_string(),
            ));
        }

        let generated_name = generate_name(name);
        let mut workload = core.workload.clone();
        workload.name = name.to_string();
        workload.generated_name = generated_name.clone();

        let mut sidecars = Vec::with_capacity(core.sidecars.len());
        for sidecar in &core.sidecars {
            sidecars.push(sidecar.clone_for(&generated_name).await?);
        }

        Ok(Instance {
            name: name.to_string(),
            generated_name,
            shared: self.shared.clone(),
            core: Mutex::new(Core {
                state: InstanceState::Committed,
                kind: core.kind,
                plan: core.plan.clone(),
                image: core.image.clone(),
                workload,
                sidecars,
                parent: parent.map(str::to_string),
            }),
        })
    }

    /// Draws `amount` clones named `{name}-{i}` and destroys this template.
    pub async fn create_pool(&self, amount: usize) -> Result<InstancePool> {
        if amount == 0 {
            return Err(FleetError::InvalidArgument(
                "a pool needs at least one instance".to_string(),
            ));
        }
        let mut instances = Vec::with_capacity(amount);
        for i in 0..amount {
            instances.push(self.clone_with_name(&format!("{}-{}", self.name, i)).await?);
        }
        self.destroy().await?;
        Ok(InstancePool::new(self.name.clone(), instances))
    }
}

#[cfg(test)]
mod tests;
