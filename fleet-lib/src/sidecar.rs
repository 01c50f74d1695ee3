use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::Result;

use crate::instance::Instance;

/// A container that joins another instance's pod and follows its lifecycle.
#[async_trait]
pub trait Sidecar: Send + Sync {
    /// Prepares the sidecar before it is attached to `parent`; must leave it Committed.
    async fn initialize(&self, parent: &str) -> Result<()>;

    /// Runs right before the parent's first deploy.
    async fn pre_start(&self) -> Result<()>;

    fn instance(&self) -> &Instance;

    /// Copy of this sidecar attached to the parent named `parent`.
    async fn clone_for(&self, parent: &str) -> Result<Arc<dyn Sidecar>>;
}

/// A plain instance used as a sidecar; it has to be committed already.
#[async_trait]
impl Sidecar for Instance {
    async fn initialize(&self, _parent: &str) -> Result<()> {
        Ok(())
    }

    async fn pre_start(&self) -> Result<()> {
        Ok(())
    }

    fn instance(&self) -> &Instance {
        self
    }

    async fn clone_for(&self, parent: &str) -> Result<Arc<dyn Sidecar>> {
        let copy = self.duplicate(self.name(), Some(parent)).await?;
        Ok(Arc::new(copy))
    }
}
