use std::io::Read;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    RemoveContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions};
use bollard::Docker;
use bytes::Bytes;
use fleet_common::wait::bounded;
use fleet_common::{FleetError, Result, WaitOptions};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dockerfile::{base_for, BuildDirectory, DOCKERFILE};
use crate::{build_error, BuildContext, BuildPlan, BuiltImage, GitSource, ImageBuilder, ImageReference};

/// Builds against the local Docker daemon and pushes synchronously.
#[derive(Clone)]
pub struct DockerBuilder {
    docker: Docker,
}

impl DockerBuilder {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| FleetError::Config(format!("cannot reach docker daemon: {e}")))?;
        Ok(Self::new(docker))
    }

    /// Runs one daemon build, from a tarred directory or a remote context.
    async fn build_one(&self, tag: &str, tar: Option<Vec<u8>>, remote: Option<String>) -> Result<String> {
        let options = BuildImageOptions {
            dockerfile: DOCKERFILE.to_string(),
            t: tag.to_string(),
            remote: remote.unwrap_or_default(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, tar.map(Bytes::from));
        let mut log = String::new();
        while let Some(item) = stream.next().await {
            let info = match item {
                Ok(info) => info,
                Err(e) => {
                    return Err(FleetError::Build {
                        image: tag.to_string(),
                        message: e.to_string(),
                        log: Some(log),
                    })
                }
            };
            if let Some(line) = info.stream {
                log.push_str(&line);
            }
            if let Some(error) = info.error {
                return Err(FleetError::Build {
                    image: tag.to_string(),
                    message: error,
                    log: Some(log),
                });
            }
        }
        Ok(log)
    }

    async fn push(&self, reference: &ImageReference) -> Result<()> {
        let name = format!("{}/{}", reference.registry, reference.repository);
        let options = PushImageOptions {
            tag: reference.tag.clone(),
        };
        let mut stream = self.docker.push_image(&name, Some(options), None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| build_error(reference, format!("push failed: {e}")))?;
            if let Some(error) = info.error {
                return Err(build_error(reference, format!("push failed: {error}")));
            }
        }
        info!(image = %reference, "pushed image");
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            item.map_err(|e| build_error(&image, format!("pull failed: {e}")))?;
        }
        Ok(())
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let mut stream = self
            .docker
            .download_from_container(container, Some(DownloadFromContainerOptions { path: path.to_string() }));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FleetError::InvalidArgument(format!("cannot read '{path}': {e}")))?;
            archive.extend_from_slice(&chunk);
        }
        first_file(&archive).ok_or_else(|| FleetError::InvalidArgument(format!("'{path}' is not a regular file")))
    }
}

fn remote_url(git: &GitSource) -> String {
    match git.commit.as_ref().or(git.branch.as_ref()) {
        Some(reference) => format!("{}#{}", git.repo, reference),
        None => git.repo.clone(),
    }
}

fn first_file(archive: &[u8]) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).ok()?;
            return Some(contents);
        }
    }
    None
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    #[instrument(skip(self, plan, wait), fields(destination = %destination))]
    async fn build(
        &self,
        plan: &BuildPlan,
        destination: &ImageReference,
        wait: &WaitOptions,
    ) -> Result<BuiltImage> {
        let tag = destination.to_string();
        bounded(wait, "build", &tag, async {
            let log = match &plan.context {
                BuildContext::Git(git) if plan.operations.is_empty() => {
                    self.build_one(&tag, None, Some(remote_url(git))).await?
                }
                BuildContext::Git(git) => {
                    let base = destination.with_suffix("base").to_string();
                    debug!(%base, repo = %git.repo, "building git base stage");
                    let mut log = self.build_one(&base, None, Some(remote_url(git))).await?;
                    let dir = BuildDirectory::materialize(plan, &format!("FROM {base}"))?;
                    log.push_str(&self.build_one(&tag, Some(dir.tar()?), None).await?);
                    log
                }
                context => {
                    let dir = BuildDirectory::materialize(plan, &base_for(context)?)?;
                    self.build_one(&tag, Some(dir.tar()?), None).await?
                }
            };
            self.push(destination).await?;
            Ok(BuiltImage {
                reference: tag.clone(),
                log: Some(log),
            })
        })
        .await
    }

    async fn read_image_file(&self, image: &str, path: &str) -> Result<Vec<u8>> {
        self.pull(image).await?;
        let name = format!("testfleet-read-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                ContainerConfig {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| build_error(&image, format!("cannot create reader container: {e}")))?;

        let contents = self.download(&container.id, path).await;
        let removed = self
            .docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = removed {
            warn!(container = %name, error = %e, "failed to remove reader container");
        }
        contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_url_prefers_commit() {
        let mut git = GitSource::new("https://github.com/acme/app.git");
        assert_eq!(remote_url(&git), "https://github.com/acme/app.git");
        git.branch = Some("main".to_string());
        assert_eq!(remote_url(&git), "https://github.com/acme/app.git#main");
        git.commit = Some("abc123".to_string());
        assert_eq!(remote_url(&git), "https://github.com/acme/app.git#abc123");
    }

    #[test]
    fn first_file_skips_directories() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "etc/", std::io::empty()).unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(5);
        file.set_mode(0o644);
        file.set_cksum();
        builder.append_data(&mut file, "etc/hosts", &b"hosts"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        assert_eq!(first_file(&archive), Some(b"hosts".to_vec()));
        assert_eq!(first_file(&[]), None);
    }
}
