//! Resource Client contract.
//!
//! The fleet only ever talks to the cluster through [`ResourceClient`]. The
//! set of resource kinds it manages is closed, so manifests travel as the
//! [`Manifest`] enum rather than as generic objects; this keeps the trait
//! object safe and lets tests swap in the in-memory client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("kubernetes client error: {0}")]
    Kube(#[source] kube::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<kube::Error> for ResourceError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ResourceError::NotFound,
            kube::Error::Api(ae) if ae.code == 409 => ResourceError::AlreadyExists,
            kube::Error::Api(ae) => ResourceError::Api {
                code: ae.code,
                message: ae.message,
            },
            other => ResourceError::Kube(other),
        }
    }
}

macro_rules! manifest_kinds {
    ($($variant:ident => $ty:ty, $accessor:ident;)*) => {
        /// Resource kinds the fleet creates and deletes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ResourceKind {
            $($variant,)*
        }

        impl ResourceKind {
            pub const ALL: &'static [ResourceKind] = &[$(ResourceKind::$variant,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ResourceKind::$variant => stringify!($variant),)*
                }
            }
        }

        #[derive(Debug, Clone)]
        pub enum Manifest {
            $($variant($ty),)*
        }

        impl Manifest {
            pub fn kind(&self) -> ResourceKind {
                match self {
                    $(Manifest::$variant(_) => ResourceKind::$variant,)*
                }
            }

            pub fn metadata(&self) -> &ObjectMeta {
                match self {
                    $(Manifest::$variant(obj) => &obj.metadata,)*
                }
            }

            pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Manifest::$variant(obj) => &mut obj.metadata,)*
                }
            }

            $(
                pub fn $accessor(self) -> Option<$ty> {
                    match self {
                        Manifest::$variant(obj) => Some(obj),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<$ty> for Manifest {
                fn from(obj: $ty) -> Self {
                    Manifest::$variant(obj)
                }
            }
        )*
    };
}

manifest_kinds! {
    ReplicaSet => ReplicaSet, into_replica_set;
    Pod => Pod, into_pod;
    Service => Service, into_service;
    PersistentVolumeClaim => PersistentVolumeClaim, into_persistent_volume_claim;
    ConfigMap => ConfigMap, into_config_map;
    ServiceAccount => ServiceAccount, into_service_account;
    Role => Role, into_role;
    RoleBinding => RoleBinding, into_role_binding;
    NetworkPolicy => NetworkPolicy, into_network_policy;
    Job => Job, into_job;
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Manifest {
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }
}

/// State change observed on a watched resource.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// The resource was added or modified; carries its current form.
    Applied(Manifest),
    Deleted(Manifest),
}

pub type EventStream = BoxStream<'static, Result<ResourceEvent, ResourceError>>;

/// Namespaced access to the cluster.
///
/// `delete` and `delete_labeled` treat an absent resource as success.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Manifest>, ResourceError>;

    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ResourceError>;

    async fn patch(&self, manifest: &Manifest) -> Result<Manifest, ResourceError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ResourceError>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ResourceError>;

    /// Streams state changes of one named resource, starting with its
    /// current state if it exists. The stream may end at any time, as the
    /// API server closes watches after a timeout.
    async fn watch(&self, kind: ResourceKind, name: &str) -> Result<EventStream, ResourceError>;

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ResourceError>;

    /// Runs `command` in a container and returns its raw standard output.
    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<Vec<u8>, ResourceError>;

    async fn delete_labeled(&self, kind: ResourceKind, selector: &str) -> Result<(), ResourceError>;
}
