//! In-memory [`ResourceClient`] for tests.
//!
//! Behaves like a tiny API server: objects are stored by kind and name,
//! ReplicaSets spawn (and respawn) one pod, Services get a cluster IP, and
//! watches replay the current object before streaming changes. Failures can
//! be injected per operation, and every call is recorded so tests can assert
//! on ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{EventStream, Manifest, ResourceClient, ResourceError, ResourceEvent, ResourceKind};

type Key = (ResourceKind, String);
type Watcher = (Key, UnboundedSender<Result<ResourceEvent, ResourceError>>);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Manifest>,
    calls: Vec<String>,
    failures: HashMap<(String, ResourceKind, String), String>,
    watchers: Vec<Watcher>,
    logs: HashMap<(String, String), String>,
    exec_calls: Vec<(String, String, Vec<String>)>,
    exec_output: HashMap<String, Vec<u8>>,
    pods_run: bool,
    auto_complete_jobs: Option<(bool, String)>,
    next_ip: u32,
    next_pod: u32,
}

/// Cheaply cloneable handle; clones share state.
#[derive(Clone)]
pub struct InMemoryClient {
    namespace: String,
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new("testfleet")
    }
}

impl InMemoryClient {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(State {
                pods_run: true,
                next_ip: 1,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether pods created from now on report `Running`.
    pub fn set_pods_running(&self, running: bool) {
        self.state().pods_run = running;
    }

    /// Makes `op` ("create", "patch", "delete", "get") fail for one resource.
    pub fn fail_on(&self, op: &str, kind: ResourceKind, name: &str, message: &str) {
        self.state()
            .failures
            .insert((op.to_string(), kind, name.to_string()), message.to_string());
    }

    /// Jobs created from now on finish immediately with one pod whose log is `log`.
    pub fn auto_complete_jobs(&self, succeeded: bool, log: &str) {
        self.state().auto_complete_jobs = Some((succeeded, log.to_string()));
    }

    pub fn set_exec_output(&self, command: &str, output: &str) {
        self.set_exec_bytes(command, output.as_bytes());
    }

    /// Raw stdout for `command`, keyed by its space-joined words.
    pub fn set_exec_bytes(&self, command: &str, output: &[u8]) {
        self.state()
            .exec_output
            .insert(command.to_string(), output.to_vec());
    }

    pub fn set_logs(&self, pod: &str, container: &str, logs: &str) {
        self.state()
            .logs
            .insert((pod.to_string(), container.to_string()), logs.to_string());
    }

    /// Finishes a running job, spawning the pod it "ran" in.
    pub fn complete_job(&self, name: &str, succeeded: bool, log: &str) {
        let mut state = self.state();
        finish_job(&mut state, &self.namespace, name, succeeded, log);
    }

    /// Ends every open watch stream without a final event.
    pub fn close_watches(&self) {
        self.state().watchers.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn exec_calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.state().exec_calls.clone()
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<Manifest> {
        self.state().objects.get(&(kind, name.to_string())).cloned()
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.state()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.object(kind, name).is_some()
    }

    pub fn set_pod_phase(&self, name: &str, phase: &str) {
        let mut state = self.state();
        let key = (ResourceKind::Pod, name.to_string());
        if let Some(Manifest::Pod(pod)) = state.objects.get_mut(&key) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }
        if let Some(obj) = state.objects.get(&key).cloned() {
            notify(&mut state, &key, ResourceEvent::Applied(obj));
        }
    }
}

fn check_failure(state: &State, op: &str, kind: ResourceKind, name: &str) -> Result<(), ResourceError> {
    match state.failures.get(&(op.to_string(), kind, name.to_string())) {
        Some(message) => Err(ResourceError::Api {
            code: 500,
            message: message.clone(),
        }),
        None => Ok(()),
    }
}

fn notify(state: &mut State, key: &Key, event: ResourceEvent) {
    state
        .watchers
        .retain(|(k, tx)| k != key || tx.send(Ok(event.clone())).is_ok());
}

/// Equality-based selectors, e.g. `a=b,c!=d`.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once('=') {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

fn spawn_pod(state: &mut State, namespace: &str, owner: &Manifest) {
    let Manifest::ReplicaSet(rs) = owner else {
        return;
    };
    let Some(template) = rs.spec.as_ref().and_then(|s| s.template.clone()) else {
        return;
    };
    let rs_name = owner.name().to_string();
    state.next_pod += 1;
    let pod_name = format!("{}-{:05}", rs_name, state.next_pod);
    let phase = if state.pods_run { "Running" } else { "Pending" };
    let meta = template.metadata.unwrap_or_default();
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: meta.labels,
            annotations: meta.annotations,
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: rs_name,
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: template.spec,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    };
    let key = (ResourceKind::Pod, pod_name);
    let manifest = Manifest::Pod(pod);
    state.objects.insert(key.clone(), manifest.clone());
    notify(state, &key, ResourceEvent::Applied(manifest));
}

fn owning_replica_set(pod: &Manifest) -> Option<String> {
    pod.metadata()
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.kind == "ReplicaSet")
        .map(|o| o.name.clone())
}

fn finish_job(state: &mut State, namespace: &str, name: &str, succeeded: bool, log: &str) {
    let key = (ResourceKind::Job, name.to_string());
    let Some(Manifest::Job(mut job)) = state.objects.get(&key).cloned() else {
        return;
    };
    state.next_pod += 1;
    let pod_name = format!("{}-{:05}", name, state.next_pod);
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("job-name".to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: job
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.clone()),
        status: Some(PodStatus {
            phase: Some(if succeeded { "Succeeded" } else { "Failed" }.to_string()),
            ..Default::default()
        }),
    };
    let container = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_default();
    state.objects.insert((ResourceKind::Pod, pod_name.clone()), Manifest::Pod(pod));
    state.logs.insert((pod_name, container), log.to_string());

    job.status = Some(JobStatus {
        succeeded: succeeded.then_some(1),
        failed: (!succeeded).then_some(1),
        ..Default::default()
    });
    let manifest = Manifest::Job(job);
    state.objects.insert(key.clone(), manifest.clone());
    notify(state, &key, ResourceEvent::Applied(manifest));
}

#[async_trait]
impl ResourceClient for InMemoryClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Manifest>, ResourceError> {
        let mut state = self.state();
        state.calls.push(format!("get {kind}/{name}"));
        check_failure(&state, "get", kind, name)?;
        Ok(state.objects.get(&(kind, name.to_string())).cloned())
    }

    async fn create(&self, manifest: &Manifest) -> Result<Manifest, ResourceError> {
        let mut state = self.state();
        let kind = manifest.kind();
        let name = manifest.name().to_string();
        state.calls.push(format!("create {kind}/{name}"));
        check_failure(&state, "create", kind, &name)?;
        let key = (kind, name.clone());
        if state.objects.contains_key(&key) {
            return Err(ResourceError::AlreadyExists);
        }

        let mut stored = manifest.clone();
        stored.metadata_mut().namespace = Some(self.namespace.clone());
        if let Manifest::Service(svc) = &mut stored {
            let ip = format!("10.96.0.{}", state.next_ip);
            state.next_ip += 1;
            if let Some(spec) = svc.spec.as_mut() {
                spec.cluster_ip.get_or_insert(ip);
            }
        }
        state.objects.insert(key.clone(), stored.clone());
        notify(&mut state, &key, ResourceEvent::Applied(stored.clone()));

        match kind {
            ResourceKind::ReplicaSet => spawn_pod(&mut state, &self.namespace, &stored),
            ResourceKind::Job => {
                if let Some((succeeded, log)) = state.auto_complete_jobs.clone() {
                    finish_job(&mut state, &self.namespace, &name, succeeded, &log);
                }
            }
            _ => {}
        }
        Ok(stored)
    }

    async fn patch(&self, manifest: &Manifest) -> Result<Manifest, ResourceError> {
        let mut state = self.state();
        let kind = manifest.kind();
        let name = manifest.name().to_string();
        state.calls.push(format!("patch {kind}/{name}"));
        check_failure(&state, "patch", kind, &name)?;
        let key = (kind, name);
        let Some(existing) = state.objects.get(&key).cloned() else {
            return Err(ResourceError::NotFound);
        };
        let mut stored = manifest.clone();
        stored.metadata_mut().namespace = Some(self.namespace.clone());
        // Allocated addresses survive a patch.
        if let (Manifest::Service(old), Manifest::Service(new)) = (&existing, &mut stored) {
            let ip = old.spec.as_ref().and_then(|s| s.cluster_ip.clone());
            if let Some(spec) = new.spec.as_mut() {
                spec.cluster_ip = ip;
            }
        }
        state.objects.insert(key.clone(), stored.clone());
        notify(&mut state, &key, ResourceEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ResourceError> {
        let mut state = self.state();
        state.calls.push(format!("delete {kind}/{name}"));
        check_failure(&state, "delete", kind, name)?;
        let key = (kind, name.to_string());
        let Some(removed) = state.objects.remove(&key) else {
            return Ok(());
        };
        notify(&mut state, &key, ResourceEvent::Deleted(removed.clone()));

        match kind {
            ResourceKind::ReplicaSet => {
                let owned: Vec<Key> = state
                    .objects
                    .iter()
                    .filter(|(k, m)| k.0 == ResourceKind::Pod && owning_replica_set(m).as_deref() == Some(name))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in owned {
                    state.objects.remove(&k);
                }
            }
            ResourceKind::Job => {
                let owned: Vec<Key> = state
                    .objects
                    .iter()
                    .filter(|(k, m)| {
                        k.0 == ResourceKind::Pod
                            && m.labels().get("job-name").map(String::as_str) == Some(name)
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in owned {
                    state.objects.remove(&k);
                }
            }
            ResourceKind::Pod => {
                // The owning ReplicaSet replaces a deleted pod from its current template.
                if let Some(rs) = owning_replica_set(&removed) {
                    if let Some(owner) = state.objects.get(&(ResourceKind::ReplicaSet, rs)).cloned() {
                        spawn_pod(&mut state, &self.namespace, &owner);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ResourceError> {
        let state = self.state();
        Ok(state
            .objects
            .iter()
            .filter(|(k, m)| k.0 == ResourceKind::Pod && matches_selector(&m.labels(), selector))
            .filter_map(|(_, m)| m.clone().into_pod())
            .collect())
    }

    async fn watch(&self, kind: ResourceKind, name: &str) -> Result<EventStream, ResourceError> {
        let mut state = self.state();
        state.calls.push(format!("watch {kind}/{name}"));
        let key = (kind, name.to_string());
        let (tx, rx) = unbounded_channel();
        if let Some(current) = state.objects.get(&key).cloned() {
            let _ = tx.send(Ok(ResourceEvent::Applied(current)));
        }
        state.watchers.push((key, tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn pod_logs(&self, pod: &str, container: &str) -> Result<String, ResourceError> {
        let state = self.state();
        state
            .logs
            .get(&(pod.to_string(), container.to_string()))
            .cloned()
            .ok_or(ResourceError::NotFound)
    }

    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<Vec<u8>, ResourceError> {
        let mut state = self.state();
        if !state.objects.contains_key(&(ResourceKind::Pod, pod.to_string())) {
            return Err(ResourceError::NotFound);
        }
        state
            .exec_calls
            .push((pod.to_string(), container.to_string(), command.to_vec()));
        Ok(state
            .exec_output
            .get(&command.join(" "))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_labeled(&self, kind: ResourceKind, selector: &str) -> Result<(), ResourceError> {
        let mut state = self.state();
        state.calls.push(format!("delete-labeled {kind}/{selector}"));
        let doomed: Vec<Key> = state
            .objects
            .iter()
            .filter(|(k, m)| k.0 == kind && matches_selector(&m.labels(), selector))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(removed) = state.objects.remove(&key) {
                notify(&mut state, &key, ResourceEvent::Deleted(removed));
            }
        }
        Ok(())
    }
}

/// Job with a single-container pod template, as the builder submits them.
pub fn sample_job(name: &str) -> Job {
    use k8s_openapi::api::batch::v1::JobSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
