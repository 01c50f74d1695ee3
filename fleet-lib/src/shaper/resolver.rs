use async_trait::async_trait;
use fleet_common::{FleetError, Result};
use url::Url;

/// Turns an in-cluster service port into a URL this process can reach.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn endpoint(&self, service: &str, port: u16) -> Result<Url>;
}

/// Cluster DNS names; works when the caller runs inside the cluster.
#[derive(Debug, Clone)]
pub struct ClusterDnsResolver {
    namespace: String,
}

impl ClusterDnsResolver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl EndpointResolver for ClusterDnsResolver {
    async fn endpoint(&self, service: &str, port: u16) -> Result<Url> {
        let raw = format!(
            "http://{service}.{}.svc.cluster.local:{port}",
            self.namespace
        );
        Url::parse(&raw).map_err(|e| FleetError::InvalidArgument(format!("endpoint '{raw}': {e}")))
    }
}

/// Always answers with one fixed base URL, e.g. a local port-forward or proxy.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    base: Url,
}

impl StaticResolver {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    pub fn parse(base: &str) -> Result<Self> {
        Url::parse(base)
            .map(Self::new)
            .map_err(|e| FleetError::InvalidArgument(format!("endpoint '{base}': {e}")))
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn endpoint(&self, _service: &str, _port: u16) -> Result<Url> {
        Ok(self.base.clone())
    }
}
