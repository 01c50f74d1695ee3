// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::time::Duration;

pub use k8s_openapi;
pub use kube;
use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

pub mod client;
pub mod kube_client;
pub mod run;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wait;

pub use client::{Manifest, ResourceClient, ResourceError, ResourceEvent, ResourceKind};
pub use run::{labels, RunContext};
pub use wait::WaitOptions;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("cannot {operation} instance '{instance}' in state {state}")]
    IllegalTransition {
        instance: String,
        operation: &'static str,
        state: InstanceState,
    },

    #[error("resource '{name}': {source}")]
    Resource {
        name: String,
        #[source]
        source: ResourceError,
    },

    #[error("build of '{image}' failed: {message}")]
    Build {
        image: String,
        message: String,
        log: Option<String>,
    },

    #[error("network shaper of '{instance}': {message}")]
    Shaper { instance: String, message: String },

    #[error("{operation} of '{name}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        name: String,
        after: Duration,
    },

    #[error("{operation} of '{name}' was cancelled")]
    Cancelled {
        operation: &'static str,
        name: String,
    },

    #[error("teardown of '{instance}' left {} failure(s): {}", .failures.len(), .failures.join("; "))]
    Teardown {
        instance: String,
        failures: Vec<String>,
    },

    #[error("{} of the batch failed: {}", .0.len(), join_errors(.0))]
    Batch(Vec<FleetError>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[FleetError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl FleetError {
    /// Wraps a Resource Client failure with the name of the resource it hit.
    pub fn resource(name: impl Into<String>) -> impl FnOnce(ResourceError) -> FleetError {
        let name = name.into();
        move |source| FleetError::Resource { name, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FleetError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Cancelled { .. })
    }

    pub fn is_illegal_transition(&self) -> bool {
        matches!(self, FleetError::IllegalTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceState {
    #[default]
    None,
    Preparing,
    Committed,
    Started,
    Stopped,
    Destroyed,
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::None => "None",
            InstanceState::Preparing => "Preparing",
            InstanceState::Committed => "Committed",
            InstanceState::Started => "Started",
            InstanceState::Stopped => "Stopped",
            InstanceState::Destroyed => "Destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    #[default]
    Basic,
    Executor,
    Sidecar,
    TimeoutReaper,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Basic => "basic",
            InstanceKind::Executor => "executor",
            InstanceKind::Sidecar => "sidecar",
            InstanceKind::TimeoutReaper => "timeout-reaper",
        }
    }
}

impl Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
