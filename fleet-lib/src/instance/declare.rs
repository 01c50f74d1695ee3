//! Declaration of an instance's source, build steps and runtime shape.

use std::path::{Path, PathBuf};

use fleet_builder::{BuildContext, BuildOperation, BuildPlan, GitSource, StagedFile};
use fleet_common::k8s_openapi::api::rbac::v1::PolicyRule;
use fleet_common::{FleetError, InstanceState, Result};
use fleet_orchestrator::{Port, Probe, RuntimeFile, Volume};
use tracing::{debug, info};

use super::{Core, Instance, DECLARABLE};

fn check_owner(owner: &str) -> Result<()> {
    match owner.split_once(':') {
        Some((user, group)) if !user.is_empty() && !group.is_empty() => Ok(()),
        _ => Err(FleetError::InvalidArgument(format!(
            "owner '{owner}' must have the form user:group"
        ))),
    }
}

fn check_destination(destination: &str) -> Result<()> {
    if destination.starts_with('/') && destination.len() > 1 {
        Ok(())
    } else {
        Err(FleetError::InvalidArgument(format!(
            "destination '{destination}' must be an absolute file path"
        )))
    }
}

fn check_quantity(what: &str, quantity: &str) -> Result<()> {
    fleet_orchestrator::manifests::parse_quantity(quantity)
        .map(drop)
        .map_err(|_| FleetError::InvalidArgument(format!("{what} '{quantity}' is not a valid quantity")))
}

/// `2`, `0.5` or `500m`.
fn check_cpu(quantity: &str) -> Result<()> {
    let digits = quantity.strip_suffix('m').unwrap_or(quantity);
    match digits.parse::<f64>() {
        Ok(n) if n > 0.0 => Ok(()),
        _ => Err(FleetError::InvalidArgument(format!(
            "cpu request '{quantity}' is not a valid quantity"
        ))),
    }
}

impl Instance {
    /// Locks the core and validates the operation against `allowed` before
    /// handing out the guard; nothing is mutated on an illegal call.
    async fn declaring(
        &self,
        operation: &'static str,
        allowed: &[InstanceState],
    ) -> Result<tokio::sync::MutexGuard<'_, Core>> {
        let core = self.core.lock().await;
        self.ensure(&core, operation, allowed)?;
        Ok(core)
    }

    fn declare_source(&self, core: &mut Core, context: BuildContext) {
        core.plan = Some(BuildPlan::new(context));
        core.state = InstanceState::Preparing;
    }

    /// Declares the base image in None; swaps the running image in Started.
    pub async fn set_image(&self, image: &str) -> Result<()> {
        if image.trim().is_empty() {
            return Err(FleetError::InvalidArgument("image must not be empty".to_string()));
        }
        let mut core = self
            .declaring("set_image", &[InstanceState::None, InstanceState::Started])
            .await?;
        if core.state == InstanceState::None {
            self.declare_source(&mut core, BuildContext::Image(image.to_string()));
            return Ok(());
        }

        self.ensure_detached(&core, "swap the image of")?;
        let mut spec = self.deploy_spec(&core).await;
        spec.image = image.to_string();
        info!(instance = %self.generated_name, %image, "swapping image");
        self.shared.orchestrator.swap_image(&spec).await?;
        core.image = Some(image.to_string());
        core.workload.image = image.to_string();
        Ok(())
    }

    pub async fn set_git_repo(&self, source: GitSource) -> Result<()> {
        if source.repo.trim().is_empty() {
            return Err(FleetError::InvalidArgument("git repository must not be empty".to_string()));
        }
        let mut core = self.declaring("set_git_repo", &[InstanceState::None]).await?;
        self.declare_source(&mut core, BuildContext::Git(source));
        Ok(())
    }

    /// Builds from a local directory holding a `Dockerfile`.
    pub async fn set_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut core = self.declaring("set_directory", &[InstanceState::None]).await?;
        if !path.join("Dockerfile").is_file() {
            return Err(FleetError::InvalidArgument(format!(
                "'{}' has no Dockerfile",
                path.display()
            )));
        }
        self.declare_source(&mut core, BuildContext::Directory(path));
        Ok(())
    }

    pub async fn set_command(&self, command: Vec<String>) -> Result<()> {
        let mut core = self.declaring("set_command", DECLARABLE).await?;
        core.workload.command = command;
        Ok(())
    }

    pub async fn set_args(&self, args: Vec<String>) -> Result<()> {
        let mut core = self.declaring("set_args", DECLARABLE).await?;
        core.workload.args = args;
        Ok(())
    }

    /// Reads a local file and adds it at `destination`.
    pub async fn add_file(
        &self,
        source: impl AsRef<Path>,
        destination: &str,
        owner: &str,
    ) -> Result<()> {
        let contents = tokio::fs::read(source.as_ref()).await?;
        self.add_file_bytes(contents, destination, owner).await
    }

    /// Staged into the image in Preparing; mounted from a content map in Committed.
    /// Runtime files cannot change ownership, so `owner` only applies to staged files.
    pub async fn add_file_bytes(&self, contents: Vec<u8>, destination: &str, owner: &str) -> Result<()> {
        check_destination(destination)?;
        check_owner(owner)?;
        let mut core = self
            .declaring(
                "add_file",
                &[InstanceState::Preparing, InstanceState::Committed],
            )
            .await?;
        if core.state == InstanceState::Preparing {
            push_op(
                &mut core,
                BuildOperation::AddFile(StagedFile {
                    contents,
                    destination: destination.to_string(),
                    owner: owner.to_string(),
                }),
            );
        } else {
            core.workload.files.retain(|f| f.destination != destination);
            core.workload.files.push(RuntimeFile {
                contents,
                destination: destination.to_string(),
                mode: None,
            });
        }
        debug!(instance = %self.generated_name, %destination, "file added");
        Ok(())
    }

    /// A build-time `ENV` in Preparing; a container variable in Committed.
    pub async fn set_env(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.contains('=') {
            return Err(FleetError::InvalidArgument(format!(
                "'{key}' is not a valid variable name"
            )));
        }
        let mut core = self
            .declaring(
                "set_env",
                &[InstanceState::Preparing, InstanceState::Committed],
            )
            .await?;
        if core.state == InstanceState::Preparing {
            push_op(
                &mut core,
                BuildOperation::Env {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            );
        } else {
            core.workload.env.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Adds a build-time `RUN` step.
    pub async fn run_command(&self, command: &str) -> Result<()> {
        let mut core = self.declaring("run_command", &[InstanceState::Preparing]).await?;
        push_op(&mut core, BuildOperation::Run(command.to_string()));
        Ok(())
    }

    pub async fn set_user(&self, user: &str) -> Result<()> {
        let mut core = self.declaring("set_user", &[InstanceState::Preparing]).await?;
        push_op(&mut core, BuildOperation::User(user.to_string()));
        Ok(())
    }

    pub async fn add_port_tcp(&self, port: u16) -> Result<()> {
        self.add_port(Port::tcp(port)).await
    }

    pub async fn add_port_udp(&self, port: u16) -> Result<()> {
        self.add_port(Port::udp(port)).await
    }

    async fn add_port(&self, port: Port) -> Result<()> {
        if port.number == 0 {
            return Err(FleetError::InvalidArgument("port 0 is not allowed".to_string()));
        }
        let mut core = self.declaring("add_port", DECLARABLE).await?;
        if core.workload.ports.contains(&port) {
            return Err(FleetError::InvalidArgument(format!(
                "port {} is already declared",
                port.name()
            )));
        }
        core.workload.ports.push(port);
        Ok(())
    }

    pub async fn add_volume(&self, path: &str, size: &str) -> Result<()> {
        self.add_volume_with_owner(path, size, 0).await
    }

    /// Persistent volume mounted at `path`, chowned to `owner` before start.
    pub async fn add_volume_with_owner(&self, path: &str, size: &str, owner: i64) -> Result<()> {
        check_destination(path)?;
        check_quantity("volume size", size)?;
        let mut core = self.declaring("add_volume", DECLARABLE).await?;
        if core.workload.volumes.iter().any(|v| v.path == path) {
            return Err(FleetError::InvalidArgument(format!(
                "a volume is already mounted at '{path}'"
            )));
        }
        core.workload.volumes.push(Volume {
            path: path.to_string(),
            size: size.to_string(),
            owner,
        });
        Ok(())
    }

    pub async fn set_memory(&self, request: &str, limit: &str) -> Result<()> {
        check_quantity("memory request", request)?;
        check_quantity("memory limit", limit)?;
        let mut core = self.declaring("set_memory", DECLARABLE).await?;
        core.workload.resources.memory_request = Some(request.to_string());
        core.workload.resources.memory_limit = Some(limit.to_string());
        Ok(())
    }

    pub async fn set_cpu(&self, request: &str) -> Result<()> {
        check_cpu(request)?;
        let mut core = self.declaring("set_cpu", DECLARABLE).await?;
        core.workload.resources.cpu_request = Some(request.to_string());
        Ok(())
    }

    pub async fn set_liveness_probe(&self, probe: Probe) -> Result<()> {
        let mut core = self.declaring("set_liveness_probe", DECLARABLE).await?;
        core.workload.probes.liveness = Some(probe);
        Ok(())
    }

    pub async fn set_readiness_probe(&self, probe: Probe) -> Result<()> {
        let mut core = self.declaring("set_readiness_probe", DECLARABLE).await?;
        core.workload.probes.readiness = Some(probe);
        Ok(())
    }

    pub async fn set_startup_probe(&self, probe: Probe) -> Result<()> {
        let mut core = self.declaring("set_startup_probe", DECLARABLE).await?;
        core.workload.probes.startup = Some(probe);
        Ok(())
    }

    pub async fn set_privileged(&self, privileged: bool) -> Result<()> {
        let mut core = self.declaring("set_privileged", DECLARABLE).await?;
        core.workload.privileged = privileged;
        Ok(())
    }

    /// Adds a Linux capability such as `NET_ADMIN`.
    pub async fn add_capability(&self, capability: &str) -> Result<()> {
        let mut core = self.declaring("add_capability", DECLARABLE).await?;
        let capability = capability.to_ascii_uppercase();
        if !core.workload.capabilities.contains(&capability) {
            core.workload.capabilities.push(capability);
        }
        Ok(())
    }

    pub async fn add_capabilities(&self, capabilities: &[&str]) -> Result<()> {
        for capability in capabilities {
            self.add_capability(capability).await?;
        }
        Ok(())
    }

    /// Grants the instance a namespaced RBAC rule through its own identity.
    pub async fn add_policy_rule(&self, rule: PolicyRule) -> Result<()> {
        if rule.verbs.is_empty() {
            return Err(FleetError::InvalidArgument("policy rule has no verbs".to_string()));
        }
        let mut core = self.declaring("add_policy_rule", DECLARABLE).await?;
        core.workload.policy_rules.push(rule);
        Ok(())
    }

    pub async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        let mut core = self.declaring("set_label", DECLARABLE).await?;
        core.workload.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn set_annotation(&self, key: &str, value: &str) -> Result<()> {
        let mut core = self.declaring("set_annotation", DECLARABLE).await?;
        core.workload
            .annotations
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn push_op(core: &mut Core, op: BuildOperation) {
    // Preparing always carries a plan.
    if let Some(plan) = core.plan.as_mut() {
        plan.push(op);
    }
}
