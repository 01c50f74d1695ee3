//! # testfleet
//!
//! Declares, builds, deploys and tears down fleets of containerized test
//! instances on a Kubernetes cluster, all scoped to one test run.
//!
//! ```no_run
//! use testfleet::{Fleet, FleetConfig};
//!
//! # async fn demo() -> fleet_common::Result<()> {
//! let fleet = Fleet::connect(FleetConfig::from_env()?).await?;
//! let web = fleet.new_instance("web")?;
//! web.set_image("nginx:1.27").await?;
//! web.add_port_tcp(80).await?;
//! web.commit().await?;
//! web.start().await?;
//! let address = web.address().await?;
//! # let _ = address;
//! web.destroy().await?;
//! fleet.cleanup().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use fleet_builder::{DockerBuilder, ImageBuilder, KanikoBuilder};
use fleet_common::kube_client::KubeResourceClient;
use fleet_common::{InstanceKind, ResourceClient, Result, RunContext};
use fleet_orchestrator::ResourceOrchestrator;
use tracing::{info, instrument};

pub mod config;
pub mod executor;
pub mod instance;
pub mod pool;
pub mod reaper;
pub mod shaper;
pub mod sidecar;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{BuilderKind, FleetConfig};
pub use fleet_builder::{BlobStore, GitSource};
pub use fleet_common::{CancellationToken, FleetError, InstanceState, WaitOptions};
pub use fleet_orchestrator::{Probe, ProbeAction};
pub use instance::Instance;
pub use pool::{destroy_all, InstancePool};
pub use shaper::{ClusterDnsResolver, EndpointResolver, Fault, NetworkShaper, StaticResolver};
pub use sidecar::Sidecar;

/// Collaborators every instance of a fleet works through.
pub(crate) struct Shared {
    pub(crate) config: FleetConfig,
    pub(crate) orchestrator: ResourceOrchestrator,
    pub(crate) builder: Arc<dyn ImageBuilder>,
    pub(crate) resolver: Arc<dyn EndpointResolver>,
}

/// Entry point: one test run against one namespace.
#[derive(Clone)]
pub struct Fleet {
    shared: Arc<Shared>,
}

impl Fleet {
    /// Connects to the ambient cluster and the builder named in `config`.
    ///
    /// Without a blob store, Kaniko ships image contexts inline and rejects
    /// local directories; see [`Fleet::connect_with_blob_store`].
    pub async fn connect(config: FleetConfig) -> Result<Self> {
        Self::connect_with(config, None).await
    }

    /// Like [`Fleet::connect`], with Kaniko contexts uploaded through `blobs`.
    pub async fn connect_with_blob_store(config: FleetConfig, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        Self::connect_with(config, Some(blobs)).await
    }

    async fn connect_with(config: FleetConfig, blobs: Option<Arc<dyn BlobStore>>) -> Result<Self> {
        let run = Arc::new(config.run_context()?);
        let client: Arc<dyn ResourceClient> = Arc::new(
            KubeResourceClient::try_default(run.namespace())
                .await
                .map_err(FleetError::resource(run.namespace()))?,
        );
        let builder: Arc<dyn ImageBuilder> = match config.builder {
            BuilderKind::Docker => Arc::new(DockerBuilder::connect_local()?),
            BuilderKind::Kaniko => {
                let kaniko = KanikoBuilder::new(client.clone(), run.clone());
                Arc::new(match blobs {
                    Some(blobs) => kaniko.with_blob_store(blobs),
                    None => kaniko,
                })
            }
        };
        let resolver = Arc::new(ClusterDnsResolver::new(run.namespace()));
        info!(
            run_id = run.run_id(),
            namespace = run.namespace(),
            builder = ?config.builder,
            "fleet connected"
        );
        Ok(Self::from_parts(config, run, client, builder, resolver))
    }

    /// Wires a fleet from explicit collaborators.
    pub fn from_parts(
        config: FleetConfig,
        run: Arc<RunContext>,
        client: Arc<dyn ResourceClient>,
        builder: Arc<dyn ImageBuilder>,
        resolver: Arc<dyn EndpointResolver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                orchestrator: ResourceOrchestrator::new(client, run),
                builder,
                resolver,
            }),
        }
    }

    pub fn run(&self) -> &RunContext {
        self.shared.orchestrator.run()
    }

    pub fn config(&self) -> &FleetConfig {
        &self.shared.config
    }

    pub fn orchestrator(&self) -> &ResourceOrchestrator {
        &self.shared.orchestrator
    }

    /// Declares a new instance in state None.
    pub fn new_instance(&self, name: &str) -> Result<Instance> {
        self.new_instance_of_kind(name, InstanceKind::Basic)
    }

    pub(crate) fn new_instance_of_kind(&self, name: &str, kind: InstanceKind) -> Result<Instance> {
        Instance::new(name, kind, self.shared.clone())
    }

    /// Deletes every resource labeled with this run, the reaper included.
    #[instrument(skip(self), fields(run = %self.run().run_id()))]
    pub async fn cleanup(&self) -> Result<()> {
        self.shared.orchestrator.purge_run(None).await?;
        info!("run cleaned up");
        Ok(())
    }
}
