//! Cluster-native builds: one Kaniko Job per image.
//!
//! The Job is watched to completion rather than polled; a watch ended by the
//! API server is resumed until the build deadline. Whatever the outcome, the
//! log of the pod the Job produced is collected and the Job, its pods and its
//! context are deleted before the result is returned.
//!
//! Local contexts go through the blob store when one is configured. Without
//! one, contexts that need no local directory are shipped as a ConfigMap
//! mounted at `/workspace`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use fleet_common::k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use fleet_common::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use fleet_common::k8s_openapi::ByteString;
use fleet_common::wait::bounded;
use fleet_common::{
    labels, FleetError, Manifest, ResourceClient, ResourceError, ResourceEvent, ResourceKind, Result,
    RunContext, WaitOptions,
};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dockerfile::{base_for, render, BuildDirectory, DOCKERFILE, STAGING_DIR};
use crate::{BlobStore, BuildContext, BuildPlan, BuiltImage, GitSource, ImageBuilder, ImageReference};

pub const DEFAULT_EXECUTOR_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.23.2";
pub const CONTAINER_NAME: &str = "kaniko";
pub const JOB_NAME_LABEL: &str = "job-name";
pub const INLINE_CONTEXT_DIR: &str = "/workspace";
/// ConfigMaps are capped at 1MiB including metadata.
pub const INLINE_CONTEXT_LIMIT: usize = 1_000_000;
const CONTEXT_VOLUME: &str = "context";
const REWATCH_DELAY: Duration = Duration::from_millis(500);

pub struct KanikoBuilder {
    client: Arc<dyn ResourceClient>,
    run: Arc<RunContext>,
    blobs: Option<Arc<dyn BlobStore>>,
    executor_image: String,
}

enum JobOutcome {
    Succeeded,
    Failed,
}

/// What a build Job reads its context from.
#[derive(Debug, Clone, PartialEq)]
pub enum JobContext {
    /// Any URL Kaniko accepts as `--context`.
    Remote(String),
    /// Dockerfile plus staged files, carried in a ConfigMap.
    Inline { dockerfile: String, files: Vec<Vec<u8>> },
}

impl JobContext {
    fn size(&self) -> usize {
        match self {
            JobContext::Remote(_) => 0,
            JobContext::Inline { dockerfile, files } => {
                dockerfile.len() + files.iter().map(Vec::len).sum::<usize>()
            }
        }
    }
}

fn context_map_name(job: &str) -> String {
    format!("{job}-context")
}

fn staged_key(index: usize) -> String {
    format!("file-{index}")
}

fn job_outcome(status: Option<&JobStatus>) -> Option<JobOutcome> {
    let status = status?;
    if status.succeeded.unwrap_or(0) > 0 {
        Some(JobOutcome::Succeeded)
    } else if status.failed.unwrap_or(0) > 0 {
        Some(JobOutcome::Failed)
    } else {
        None
    }
}

fn vanished(name: &str) -> FleetError {
    FleetError::Resource {
        name: name.to_string(),
        source: ResourceError::Api {
            code: 410,
            message: "build job deleted before completion".to_string(),
        },
    }
}

impl KanikoBuilder {
    pub fn new(client: Arc<dyn ResourceClient>, run: Arc<RunContext>) -> Self {
        Self {
            client,
            run,
            blobs: None,
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
        }
    }

    /// Blob store used to ship local build directories into the cluster.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_executor_image(mut self, image: impl Into<String>) -> Self {
        self.executor_image = image.into();
        self
    }

    fn job_labels(&self, name: &str) -> BTreeMap<String, String> {
        let mut job_labels = self.run.run_labels();
        job_labels.insert(labels::APP.to_string(), name.to_string());
        job_labels
    }

    fn job(&self, name: &str, context: &JobContext, destination: &str) -> Job {
        let job_labels = self.job_labels(name);
        let (context_arg, volumes, mounts) = match context {
            JobContext::Remote(url) => (url.clone(), None, None),
            JobContext::Inline { files, .. } => {
                let mut items = vec![KeyToPath {
                    key: DOCKERFILE.to_string(),
                    path: DOCKERFILE.to_string(),
                    mode: None,
                }];
                items.extend((0..files.len()).map(|i| KeyToPath {
                    key: staged_key(i),
                    path: format!("{STAGING_DIR}/{i}"),
                    mode: None,
                }));
                let volume = Volume {
                    name: CONTEXT_VOLUME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: context_map_name(name),
                        items: Some(items),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let mount = VolumeMount {
                    name: CONTEXT_VOLUME.to_string(),
                    mount_path: INLINE_CONTEXT_DIR.to_string(),
                    ..Default::default()
                };
                (
                    format!("dir://{INLINE_CONTEXT_DIR}"),
                    Some(vec![volume]),
                    Some(vec![mount]),
                )
            }
        };
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.client.namespace().to_string()),
                labels: Some(job_labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(job_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: Some(self.executor_image.clone()),
                            args: Some(vec![
                                format!("--context={context_arg}"),
                                format!("--dockerfile={DOCKERFILE}"),
                                format!("--destination={destination}"),
                            ]),
                            volume_mounts: mounts,
                            ..Default::default()
                        }],
                        volumes,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn context_map(&self, name: &str, context: &JobContext) -> Option<ConfigMap> {
        let JobContext::Inline { dockerfile, files } = context else {
            return None;
        };
        let binary = files
            .iter()
            .enumerate()
            .map(|(i, contents)| (staged_key(i), ByteString(contents.clone())))
            .collect();
        Some(ConfigMap {
            metadata: ObjectMeta {
                name: Some(context_map_name(name)),
                namespace: Some(self.client.namespace().to_string()),
                labels: Some(self.job_labels(name)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(DOCKERFILE.to_string(), dockerfile.clone())])),
            binary_data: Some(binary),
            ..Default::default()
        })
    }

    /// Uploads the materialized plan when a blob store is configured, and
    /// otherwise carries the rendered Dockerfile and staged files inline.
    async fn job_context(
        &self,
        plan: &BuildPlan,
        base: &str,
        destination: &ImageReference,
    ) -> Result<JobContext> {
        if let Some(blobs) = &self.blobs {
            let dir = BuildDirectory::materialize(plan, base)?;
            let name = format!("{}-{}.tar.gz", self.run.run_id(), destination.repository);
            return Ok(JobContext::Remote(blobs.push(&name, dir.tar_gz()?).await?));
        }
        if let BuildContext::Directory(dir) = &plan.context {
            return Err(FleetError::Config(format!(
                "cluster-native builds of directory '{}' need a blob store",
                dir.display()
            )));
        }
        let context = JobContext::Inline {
            dockerfile: render(base, &plan.operations),
            files: plan.staged_files().map(|f| f.contents.clone()).collect(),
        };
        if context.size() > INLINE_CONTEXT_LIMIT {
            return Err(FleetError::Config(format!(
                "staged files of {} bytes exceed the inline context limit; configure a blob store",
                context.size()
            )));
        }
        Ok(context)
    }

    /// Runs one build Job. Cleanup happens on every path out.
    async fn run_job(&self, context: &JobContext, destination: &str, wait: &WaitOptions) -> Result<Option<String>> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("kaniko-{}", &suffix[..12]);
        if let Some(map) = self.context_map(&name, context) {
            self.client
                .create(&Manifest::from(map))
                .await
                .map_err(FleetError::resource(context_map_name(&name)))?;
        }
        let job = Manifest::from(self.job(&name, context, destination));
        if let Err(e) = self.client.create(&job).await {
            self.cleanup(&name).await;
            return Err(FleetError::resource(&name)(e));
        }
        info!(job = %name, %destination, "submitted build job");

        let outcome = bounded(wait, "build", &name, self.await_job(&name)).await;
        let log = self.collect_log(&name).await;
        self.cleanup(&name).await;

        match outcome? {
            JobOutcome::Succeeded => Ok(log),
            JobOutcome::Failed => Err(FleetError::Build {
                image: destination.to_string(),
                message: format!("build job '{name}' failed"),
                log,
            }),
        }
    }

    async fn await_job(&self, name: &str) -> Result<JobOutcome> {
        loop {
            let mut events = self
                .client
                .watch(ResourceKind::Job, name)
                .await
                .map_err(FleetError::resource(name))?;
            while let Some(event) = events.next().await {
                match event.map_err(FleetError::resource(name))? {
                    ResourceEvent::Applied(Manifest::Job(job)) => {
                        if let Some(done) = job_outcome(job.status.as_ref()) {
                            return Ok(done);
                        }
                        debug!(job = %name, "build job still running");
                    }
                    ResourceEvent::Applied(_) => {}
                    ResourceEvent::Deleted(_) => return Err(vanished(name)),
                }
            }

            // The server ends every watch after its timeout.
            match self
                .client
                .get(ResourceKind::Job, name)
                .await
                .map_err(FleetError::resource(name))?
            {
                Some(Manifest::Job(job)) => {
                    if let Some(done) = job_outcome(job.status.as_ref()) {
                        return Ok(done);
                    }
                }
                _ => return Err(vanished(name)),
            }
            debug!(job = %name, "build job watch ended, resuming");
            sleep(REWATCH_DELAY).await;
        }
    }

    async fn collect_log(&self, name: &str) -> Option<String> {
        let selector = format!("{JOB_NAME_LABEL}={name}");
        let pods = match self.client.list_pods(&selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(job = %name, error = %e, "cannot list build pods");
                return None;
            }
        };
        let pod = pods.first()?.metadata.name.clone()?;
        match self.client.pod_logs(&pod, CONTAINER_NAME).await {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(job = %name, %pod, error = %e, "cannot read build log");
                None
            }
        }
    }

    async fn cleanup(&self, name: &str) {
        if let Err(e) = self.client.delete(ResourceKind::Job, name).await {
            warn!(job = %name, error = %e, "failed to delete build job");
        }
        let selector = format!("{JOB_NAME_LABEL}={name}");
        if let Err(e) = self.client.delete_labeled(ResourceKind::Pod, &selector).await {
            warn!(job = %name, error = %e, "failed to delete build pods");
        }
        if let Err(e) = self
            .client
            .delete(ResourceKind::ConfigMap, &context_map_name(name))
            .await
        {
            warn!(job = %name, error = %e, "failed to delete build context");
        }
    }
}

/// Kaniko's git context syntax: `git://host/repo.git#refs/heads/branch#commit`.
fn git_context(git: &GitSource) -> String {
    let repo = git
        .repo
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git://");
    let mut context = format!("git://{repo}");
    if let Some(branch) = &git.branch {
        context.push_str(&format!("#refs/heads/{branch}"));
    }
    if let Some(commit) = &git.commit {
        if git.branch.is_none() {
            context.push('#');
        }
        context.push_str(&format!("#{commit}"));
    }
    context
}

#[async_trait]
impl ImageBuilder for KanikoBuilder {
    #[instrument(skip(self, plan, wait), fields(destination = %destination))]
    async fn build(
        &self,
        plan: &BuildPlan,
        destination: &ImageReference,
        wait: &WaitOptions,
    ) -> Result<BuiltImage> {
        let tag = destination.to_string();
        let log = match &plan.context {
            BuildContext::Git(git) if plan.operations.is_empty() => {
                self.run_job(&JobContext::Remote(git_context(git)), &tag, wait).await?
            }
            BuildContext::Git(git) => {
                let base = destination.with_suffix("base").to_string();
                self.run_job(&JobContext::Remote(git_context(git)), &base, wait).await?;
                let context = self
                    .job_context(plan, &format!("FROM {base}"), destination)
                    .await?;
                self.run_job(&context, &tag, wait).await?
            }
            context => {
                let context = self.job_context(plan, &base_for(context)?, destination).await?;
                self.run_job(&context, &tag, wait).await?
            }
        };
        Ok(BuiltImage { reference: tag, log })
    }

    async fn read_image_file(&self, image: &str, path: &str) -> Result<Vec<u8>> {
        Err(FleetError::Resource {
            name: image.to_string(),
            source: ResourceError::Unsupported(format!(
                "reading '{path}' from a pushed image needs the docker builder"
            )),
        })
    }
}
