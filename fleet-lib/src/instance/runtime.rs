use fleet_builder::read_plan_file;
use fleet_common::{FleetError, InstanceState, Result};
use tracing::debug;

use super::{Core, Instance};

impl Instance {
    /// Pod whose containers this instance runs in: its own, or its parent's.
    fn pod_owner<'a>(&'a self, core: &'a Core) -> &'a str {
        core.parent.as_deref().unwrap_or(&self.generated_name)
    }

    /// Cluster address of the instance, creating the Service on demand.
    pub async fn address(&self) -> Result<String> {
        let core = self.core.lock().await;
        self.ensure(
            &core,
            "address",
            &[InstanceState::Committed, InstanceState::Started],
        )?;
        self.ensure_detached(&core, "address")?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.ensure_service(&spec).await
    }

    /// Runs `command` inside the instance's container and returns its output,
    /// with invalid UTF-8 replaced.
    pub async fn execute_command(&self, command: &[&str]) -> Result<String> {
        if command.is_empty() {
            return Err(FleetError::InvalidArgument("command must not be empty".to_string()));
        }
        let core = self.core.lock().await;
        self.ensure(&core, "execute_command", &[InstanceState::Started])?;
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        debug!(instance = %self.generated_name, ?command, "executing");
        self.shared
            .orchestrator
            .exec(self.pod_owner(&core), &self.generated_name, &command)
            .await
            .map(|out| String::from_utf8_lossy(&out).into_owned())
    }

    /// Reads a file from the build layer, the committed image or the running
    /// container, depending on the state.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let core = self.core.lock().await;
        self.ensure(
            &core,
            "read_file",
            &[
                InstanceState::Preparing,
                InstanceState::Committed,
                InstanceState::Started,
            ],
        )?;
        match core.state {
            InstanceState::Preparing => match &core.plan {
                Some(plan) => read_plan_file(self.shared.builder.as_ref(), plan, path).await,
                None => Err(FleetError::InvalidArgument(format!(
                    "'{}' has no build source",
                    self.name
                ))),
            },
            InstanceState::Committed => {
                if let Some(file) = core.workload.files.iter().rev().find(|f| f.destination == path) {
                    return Ok(file.contents.clone());
                }
                let image = core.image.as_deref().unwrap_or_default();
                self.shared.builder.read_image_file(image, path).await
            }
            _ => {
                let command = vec!["cat".to_string(), path.to_string()];
                self.shared
                    .orchestrator
                    .exec(self.pod_owner(&core), &self.generated_name, &command)
                    .await
            }
        }
    }

    /// Current log of the instance's container.
    pub async fn logs(&self) -> Result<String> {
        let core = self.core.lock().await;
        self.ensure(&core, "logs", &[InstanceState::Started])?;
        self.shared
            .orchestrator
            .logs(self.pod_owner(&core), &self.generated_name)
            .await
    }

    /// Cuts all ingress and egress traffic of the pod.
    pub async fn disable_network(&self) -> Result<()> {
        let core = self.core.lock().await;
        self.ensure(&core, "disable_network", &[InstanceState::Started])?;
        self.ensure_detached(&core, "disable the network of")?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.disable_network(&spec).await
    }

    pub async fn enable_network(&self) -> Result<()> {
        let core = self.core.lock().await;
        self.ensure(&core, "enable_network", &[InstanceState::Started])?;
        self.ensure_detached(&core, "enable the network of")?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.enable_network(&spec).await
    }

    pub async fn network_disabled(&self) -> Result<bool> {
        let core = self.core.lock().await;
        self.ensure(&core, "network_disabled", &[InstanceState::Started])?;
        let spec = self.deploy_spec(&core).await;
        self.shared.orchestrator.network_disabled(&spec).await
    }
}
