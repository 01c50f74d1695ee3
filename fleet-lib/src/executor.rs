use fleet_common::{InstanceKind, Result};
use tracing::instrument;

use crate::instance::Instance;
use crate::Fleet;

pub const EXECUTOR_NAME: &str = "executor";

impl Fleet {
    /// Started utility instance with network tools, for running commands such
    /// as `wget` against other instances from inside the cluster.
    #[instrument(skip(self), fields(run = %self.run().run_id()))]
    pub async fn new_executor(&self) -> Result<Instance> {
        let executor = self.new_instance_of_kind(EXECUTOR_NAME, InstanceKind::Executor)?;
        executor.set_image(&self.config().executor_image).await?;
        executor
            .set_command(vec!["sleep".to_string(), "infinity".to_string()])
            .await?;
        executor.commit().await?;
        executor.start().await?;
        Ok(executor)
    }
}
