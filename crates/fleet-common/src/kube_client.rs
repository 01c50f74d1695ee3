use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams,
    WatchEvent, WatchParams,
};
use kube::{Client, Resource};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::client::{EventStream, Manifest, ResourceClient, ResourceError, ResourceEvent, ResourceKind};

const FIELD_MANAGER: &str = "testfleet";
// Below the API server's own cap. A watch ending here is routine; callers
// waiting longer open a new one.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// [`ResourceClient`] backed by a kube-rs client scoped to one namespace.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    namespace: String,
}

impl KubeResourceClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connects using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self, ResourceError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

macro_rules! by_kind {
    ($self:ident, $kind:expr, |$api:ident, $wrap:ident| $body:expr) => {
        match $kind {
            ResourceKind::ReplicaSet => { let $api: Api<ReplicaSet> = $self.api(); let $wrap = Manifest::ReplicaSet; $body }
            ResourceKind::Pod => { let $api: Api<Pod> = $self.api(); let $wrap = Manifest::Pod; $body }
            ResourceKind::Service => { let $api: Api<Service> = $self.api(); let $wrap = Manifest::Service; $body }
            ResourceKind::PersistentVolumeClaim => { let $api: Api<PersistentVolumeClaim> = $self.api(); let $wrap = Manifest::PersistentVolumeClaim; $body }
            ResourceKind::ConfigMap => { let $api: Api<ConfigMap> = $self.api(); let $wrap = Manifest::ConfigMap; $body }
            ResourceKind::ServiceAccount => { let $api: Api<ServiceAccount> = $self.api(); let $wrap = Manifest::ServiceAccount; $body }
            ResourceKind::Role => { let $api: Api<Role> = $self.api(); let $wrap = Manifest::Role; $body }
            ResourceKind::RoleBinding => { let $api: Api<RoleBinding> = $self.api(); let $wrap = Manifest::RoleBinding; $body }
            ResourceKind::NetworkPolicy => { let $api: Api<NetworkPolicy> = $self.api(); let $wrap = Manifest::NetworkPolicy; $body }
            ResourceKind::Job => { let $api: Api<Job> = $self.api(); let $wrap = Manifest::Job; $body }
        }
    };
}

macro_rules! by_manifest {
    ($self:ident, $manifest:expr, |$api:ident, $obj:ident, $wrap:ident| $body:expr) => {
        match $manifest {
            Manifest::ReplicaSet($obj) => { let $api: Api<ReplicaSet> = $self.api(); let $wrap = Manifest::ReplicaSet; $body }
            Manifest::Pod($obj) => { let $api: Api<Pod> = $self.api(); let $wrap = Manifest::Pod; $body }
            Manifest::Service($obj) => { let $api: Api<Service> = $self.api(); let $wrap = Manifest::Service; $body }
            Manifest::PersistentVolumeClaim($obj) => { let $api: Api<PersistentVolumeClaim> = $self.api(); let $wrap = Manifest::PersistentVolumeClaim; $body }
            Manifest::ConfigMap($obj) => { let $api: Api<ConfigMap> = $self.api(); let $wrap = Manifest::ConfigMap; $body }
            Manifest::ServiceAccount($obj) => { let $api: Api<ServiceAccount> = $self.api(); let $wrap = Manifest::ServiceAccount; $body }
            Manifest::Role($obj) => { let $api: Api<Role> = $self.api(); let $wrap = Manifest::Role; $body }
            Manifest::RoleBinding($obj) => { let $api: Api<RoleBinding> = $self.api(); let $wrap = Manifest::RoleBinding; $body }
            Manifest::NetworkPolicy($obj) => { let $api: Api<NetworkPolicy> = $self.api(); let $wrap = Manifest::NetworkPolicy; $body }
            Manifest::Job($obj) => { let $api: Api<Job> = $self.api(); let $wrap = Manifest::Job; $body }
        }
    };
}

fn absent_is_ok<T>(res: Result<T, kube::Error>) -> Result<(), ResourceError> {
    match res.map_err(ResourceError::from) {
        Ok(_) | Err(ResourceError::NotFound) => Ok(()),
        Err(other) => Err(other),
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Manifest>, ResourceError> {
        by_kind!(self, kind, |api, wrap| Ok(api.get_opt(name).await?.map(wrap)))
    }

    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ResourceError> {
        debug!(kind = %manifest.kind(), name = manifest.name(), "creating resource");
        by_manifest!(self, manifest, |api, obj, wrap| {
            Ok(wrap(api.create(&PostParams::default(), obj).await?))
        })
    }

    async fn patch(&self, manifest: &Manifest) -> Result<Manifest, ResourceError> {
        debug!(kind = %manifest.kind(), name = manifest.name(), "patching resource");
        let name = manifest.name().to_string();
        by_manifest!(self, manifest, |api, obj, wrap| {
            let mut obj = obj.clone();
            obj.metadata.managed_fields = None;
            obj.metadata.resource_version = None;
            let params = PatchParams::apply(FIELD_MANAGER).force();
            Ok(wrap(api.patch(&name, &params, &Patch::Apply(&obj)).await?))
        })
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ResourceError> {
        debug!(%kind, name, "deleting resource");
        by_kind!(self, kind, |api, _wrap| {
            absent_is_ok(api.delete(name, &DeleteParams::background()).await)
        })
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ResourceError> {
        let api: Api<Pod> = self.api();
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn watch(&self, kind: ResourceKind, name: &str) -> Result<EventStream, ResourceError> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(WATCH_TIMEOUT_SECS);
        by_kind!(self, kind, |api, wrap| {
            let stream = api.watch(&params, "0").await?;
            Ok(stream
                .filter_map(move |event| async move {
                    match event {
                        Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj)) => {
                            Some(Ok(ResourceEvent::Applied(wrap(obj))))
                        }
                        Ok(WatchEvent::Deleted(obj)) => Some(Ok(ResourceEvent::Deleted(wrap(obj)))),
                        Ok(WatchEvent::Bookmark(_)) => None,
                        Ok(WatchEvent::Error(e)) => Some(Err(ResourceError::Api {
                            code: e.code,
                            message: e.message,
                        })),
                        Err(e) => Some(Err(ResourceError::from(e))),
                    }
                })
                .boxed())
        })
    }

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ResourceError> {
        let api: Api<Pod> = self.api();
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        Ok(api.logs(pod, &params).await?)
    }

    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<Vec<u8>, ResourceError> {
        let api: Api<Pod> = self.api();
        // stderr is left unattached; a failing command reports through the status.
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);
        let mut attached = api.exec(pod, command.to_vec(), &params).await?;
        let mut stdout = attached
            .stdout()
            .ok_or_else(|| ResourceError::Exec("no stdout stream attached".to_string()))?;
        let status = attached.take_status();

        let mut output = Vec::new();
        stdout.read_to_end(&mut output).await?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(ResourceError::Exec(status.message.unwrap_or_default()));
                }
            }
        }
        attached
            .join()
            .await
            .map_err(|e| ResourceError::Exec(e.to_string()))?;
        Ok(output)
    }

    async fn delete_labeled(&self, kind: ResourceKind, selector: &str) -> Result<(), ResourceError> {
        debug!(%kind, selector, "deleting labeled resources");
        let list = ListParams::default().labels(selector);
        by_kind!(self, kind, |api, _wrap| {
            absent_is_ok(api.delete_collection(&DeleteParams::background(), &list).await)
        })
    }
}
