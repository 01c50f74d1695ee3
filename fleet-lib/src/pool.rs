use fleet_common::{FleetError, Result, WaitOptions};
use futures::future::join_all;
use tracing::{info, warn};

use crate::instance::Instance;

/// Clones drawn from one committed template.
#[derive(Debug)]
pub struct InstancePool {
    name: String,
    instances: Vec<Instance>,
}

fn collect(results: Vec<Result<()>>) -> Result<()> {
    let errors: Vec<FleetError> = results.into_iter().filter_map(|r| r.err()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Batch(errors))
    }
}

impl InstancePool {
    pub(crate) fn new(name: String, instances: Vec<Instance>) -> Self {
        Self { name, instances }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Starts every member concurrently; failures are reported together.
    pub async fn start_all(&self) -> Result<()> {
        info!(pool = %self.name, size = self.instances.len(), "starting pool");
        collect(join_all(self.instances.iter().map(Instance::start)).await)
    }

    pub async fn wait_all_running(&self, opts: &WaitOptions) -> Result<()> {
        collect(join_all(self.instances.iter().map(|i| i.wait_running(opts))).await)
    }

    pub async fn destroy(&self) -> Result<()> {
        let members: Vec<&Instance> = self.instances.iter().collect();
        destroy_all(&members).await
    }
}

/// Destroys `instances` concurrently, attempting every one.
pub async fn destroy_all(instances: &[&Instance]) -> Result<()> {
    let results = join_all(instances.iter().map(|i| i.destroy())).await;
    let result = collect(results);
    if let Err(FleetError::Batch(errors)) = &result {
        warn!(failed = errors.len(), total = instances.len(), "batch destroy incomplete");
    }
    result
}
