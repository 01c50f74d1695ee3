//! Run-scoped context shared by every component of one test run.
//!
//! The run identifier and start time are fixed when the context is built and
//! are labeled onto every resource the fleet creates. Those labels are the
//! only selector used to garbage-collect a run.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FleetError, InstanceKind, Result};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Label keys written on every resource.
pub mod labels {
    pub const APP: &str = "app";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const RUN: &str = "testfleet.io/run";
    pub const RUN_STARTED: &str = "testfleet.io/run-started";
    pub const NAME: &str = "testfleet.io/name";
    pub const GENERATED_NAME: &str = "testfleet.io/generated-name";
    pub const KIND: &str = "testfleet.io/kind";

    pub const MANAGER: &str = "testfleet";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    timeout: Duration,
    namespace: String,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, namespace: impl Into<String>, timeout: Duration) -> Result<Self> {
        let run_id = run_id.into();
        if !is_label_value(&run_id) || run_id.is_empty() {
            return Err(FleetError::Config(format!(
                "run identifier '{run_id}' is not a valid label value"
            )));
        }
        Ok(Self {
            run_id,
            started_at: Utc::now(),
            timeout,
            namespace: namespace.into(),
        })
    }

    /// Creates a context with a fresh random run identifier.
    pub fn generate(namespace: impl Into<String>, timeout: Duration) -> Self {
        let started_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            run_id: format!("{}-{}", started_at.format("%Y%m%d-%H%M%S"), &suffix[..6]),
            started_at,
            timeout,
            namespace: namespace.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector matching every resource of this run.
    pub fn run_selector(&self) -> String {
        format!("{}={}", labels::RUN, self.run_id)
    }

    /// Labels for run-scoped resources that belong to no instance, such as build jobs.
    pub fn run_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::MANAGED_BY.to_string(), labels::MANAGER.to_string()),
            (labels::RUN.to_string(), self.run_id.clone()),
            (
                labels::RUN_STARTED.to_string(),
                self.started_at.format("%Y%m%dT%H%M%SZ").to_string(),
            ),
        ])
    }

    /// Label set for a resource owned by the instance `name`/`generated_name`.
    pub fn labels_for(
        &self,
        name: &str,
        generated_name: &str,
        kind: InstanceKind,
    ) -> BTreeMap<String, String> {
        let mut set = self.run_labels();
        set.extend([
            (labels::APP.to_string(), generated_name.to_string()),
            (labels::NAME.to_string(), sanitize_label_value(name)),
            (labels::GENERATED_NAME.to_string(), generated_name.to_string()),
            (labels::KIND.to_string(), kind.as_str().to_string()),
        ]);
        set
    }
}

/// Produces a DNS-1123 compatible, cluster-unique name for `name`.
pub fn generate_name(name: &str) -> String {
    let mut base: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    base = base.trim_matches('-').to_string();
    if base.is_empty() {
        base = "instance".to_string();
    }
    // 63 chars max, minus "-" and an 8 char suffix.
    base.truncate(54);
    let base = base.trim_end_matches('-');
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

fn is_label_value(value: &str) -> bool {
    value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn sanitize_label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(63);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}
