//! Dockerfile rendering and build-directory materialization.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use fleet_common::{FleetError, Result};
use tempfile::TempDir;
use tracing::debug;

use crate::{BuildContext, BuildOperation, BuildPlan};

/// Staged files live here inside the build directory.
pub const STAGING_DIR: &str = ".testfleet/files";
pub const DOCKERFILE: &str = "Dockerfile";

/// Appends the plan's operations, in declaration order, to `base`.
pub fn render(base: &str, operations: &[BuildOperation]) -> String {
    let mut out = base.trim_end().to_string();
    out.push('\n');
    let mut staged = 0usize;
    for op in operations {
        let line = match op {
            BuildOperation::Run(command) => format!("RUN {command}"),
            BuildOperation::AddFile(file) => {
                let line = format!(
                    "COPY --chown={} {}/{} {}",
                    file.owner, STAGING_DIR, staged, file.destination
                );
                staged += 1;
                line
            }
            BuildOperation::Env { key, value } => {
                format!("ENV {}=\"{}\"", key, value.replace('\\', "\\\\").replace('"', "\\\""))
            }
            BuildOperation::User(user) => format!("USER {user}"),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// The Dockerfile the plan's operations are layered on.
///
/// Git contexts have no local base; callers build them as a separate stage
/// and pass `FROM <stage>` instead.
pub fn base_for(context: &BuildContext) -> Result<String> {
    match context {
        BuildContext::Image(image) => Ok(format!("FROM {image}")),
        BuildContext::Directory(dir) => Ok(fs::read_to_string(dir.join(DOCKERFILE))?),
        BuildContext::Git(git) => Err(FleetError::InvalidArgument(format!(
            "git context '{}' must be built as a base stage first",
            git.repo
        ))),
    }
}

/// A self-contained build directory on local disk, removed on drop.
pub struct BuildDirectory {
    dir: TempDir,
}

impl BuildDirectory {
    /// Copies the directory context (if any), writes staged files and the
    /// rendered Dockerfile on top of `base`.
    pub fn materialize(plan: &BuildPlan, base: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("testfleet-build-").tempdir()?;
        if let BuildContext::Directory(source) = &plan.context {
            copy_dir(source, dir.path())?;
        }

        let staging = dir.path().join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        for (i, file) in plan.staged_files().enumerate() {
            fs::write(staging.join(i.to_string()), &file.contents)?;
        }

        let dockerfile = render(base, &plan.operations);
        fs::write(dir.path().join(DOCKERFILE), &dockerfile)?;
        debug!(path = %dir.path().display(), "materialized build directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn dockerfile(&self) -> Result<String> {
        Ok(fs::read_to_string(self.path().join(DOCKERFILE))?)
    }

    /// Uncompressed tar, as the Docker build API takes it.
    pub fn tar(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", self.path())?;
        Ok(builder.into_inner()?)
    }

    /// Gzipped tar, as Kaniko takes it from a blob store.
    pub fn tar_gz(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.tar()?)?;
        Ok(encoder.finish()?)
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target: PathBuf = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
