//! Image builds for fleet instances.
//!
//! A [`BuildPlan`] is a build context plus the mutations declared on an
//! instance before commit. [`ImageBuilder`] turns a plan into a pushed image;
//! two strategies exist, [`DockerBuilder`] talking to a local daemon and
//! [`KanikoBuilder`] running the build as a cluster Job.

use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleet_common::{FleetError, Result, WaitOptions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod blob;
pub mod docker;
pub mod dockerfile;
pub mod kaniko;

pub use blob::BlobStore;
pub use docker::DockerBuilder;
pub use kaniko::KanikoBuilder;

pub const DEFAULT_REGISTRY: &str = "ttl.sh";
pub const DEFAULT_TAG: &str = "24h";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub repo: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

impl GitSource {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: None,
            commit: None,
        }
    }
}

/// Where a build starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildContext {
    Image(String),
    /// Local directory containing a `Dockerfile`.
    Directory(PathBuf),
    Git(GitSource),
}

/// File baked into the image at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub contents: Vec<u8>,
    pub destination: String,
    /// `user:group`
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildOperation {
    Run(String),
    AddFile(StagedFile),
    Env { key: String, value: String },
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub context: BuildContext,
    pub operations: Vec<BuildOperation>,
}

impl BuildPlan {
    pub fn new(context: BuildContext) -> Self {
        Self {
            context,
            operations: Vec::new(),
        }
    }

    pub fn push(&mut self, op: BuildOperation) {
        self.operations.push(op);
    }

    /// A bare image with no operations is used as-is.
    pub fn requires_build(&self) -> bool {
        !self.operations.is_empty() || !matches!(self.context, BuildContext::Image(_))
    }

    pub fn base_image(&self) -> Option<&str> {
        match &self.context {
            BuildContext::Image(image) => Some(image),
            _ => None,
        }
    }

    /// Hex SHA-256 over the serialized plan and, for a directory context,
    /// every file beneath it.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        let encoded = serde_json::to_vec(self)
            .map_err(|e| FleetError::InvalidArgument(format!("unserializable build plan: {e}")))?;
        hasher.update(&encoded);
        if let BuildContext::Directory(root) = &self.context {
            hash_tree(&mut hasher, root, root)?;
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Contents of the most recently staged file at `path`, if any.
    pub fn read_staged(&self, path: &str) -> Option<&[u8]> {
        self.operations.iter().rev().find_map(|op| match op {
            BuildOperation::AddFile(file) if file.destination == path => {
                Some(file.contents.as_slice())
            }
            _ => None,
        })
    }

    pub fn staged_files(&self) -> impl Iterator<Item = &StagedFile> {
        self.operations.iter().filter_map(|op| match op {
            BuildOperation::AddFile(file) => Some(file),
            _ => None,
        })
    }
}

/// Relative path and length-prefixed contents of each file, in name order.
fn hash_tree(hasher: &mut Sha256, root: &Path, dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        if entry.file_type()?.is_dir() {
            hash_tree(hasher, root, &path)?;
        } else {
            let contents = fs::read(&path)?;
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }
    }
    Ok(())
}

/// `{registry}/{repository}:{tag}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Names the image after the first 16 hex digits of the plan fingerprint,
    /// so identical plans resolve to the same reference.
    pub fn content_addressed(registry: &str, plan: &BuildPlan, tag: &str) -> Result<Self> {
        let fingerprint = plan.fingerprint()?;
        Ok(Self {
            registry: registry.trim_end_matches('/').to_string(),
            repository: fingerprint[..16].to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            repository: format!("{}-{}", self.repository, suffix),
            ..self.clone()
        }
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub reference: String,
    pub log: Option<String>,
}

/// Build strategy, chosen when the fleet is constructed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds `plan` and pushes the result to `destination`.
    async fn build(
        &self,
        plan: &BuildPlan,
        destination: &ImageReference,
        wait: &WaitOptions,
    ) -> Result<BuiltImage>;

    /// Reads one file out of an already pushed image.
    async fn read_image_file(&self, image: &str, path: &str) -> Result<Vec<u8>>;
}

/// Reads `path` from an uncommitted plan: staged files first, then the base image.
pub async fn read_plan_file(
    builder: &dyn ImageBuilder,
    plan: &BuildPlan,
    path: &str,
) -> Result<Vec<u8>> {
    if let Some(contents) = plan.read_staged(path) {
        return Ok(contents.to_vec());
    }
    match plan.base_image() {
        Some(image) => builder.read_image_file(image, path).await,
        None => Err(FleetError::InvalidArgument(format!(
            "'{path}' is not staged and the build has no base image to read from"
        ))),
    }
}

pub(crate) fn build_error(image: &impl Display, message: impl Into<String>) -> FleetError {
    FleetError::Build {
        image: image.to_string(),
        message: message.into(),
        log: None,
    }
}
