//! Declared runtime shape of one instance, as the orchestrator consumes it.

use std::collections::BTreeMap;

use fleet_common::InstanceKind;
use k8s_openapi::api::rbac::v1::PolicyRule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Udp,
        }
    }

    /// `tcp-8080`, used for Service and container port names.
    pub fn name(&self) -> String {
        format!("{}-{}", self.protocol.as_str().to_ascii_lowercase(), self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub path: String,
    /// Kubernetes quantity, e.g. `1Gi`.
    pub size: String,
    pub owner: i64,
}

/// File added after commit, delivered through a ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFile {
    pub contents: Vec<u8>,
    pub destination: String,
    pub mode: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeAction {
    Http { path: String, port: u16 },
    Tcp { port: u16 },
    Exec { command: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub action: ProbeAction,
    pub initial_delay_seconds: Option<i32>,
    pub period_seconds: Option<i32>,
    pub failure_threshold: Option<i32>,
}

impl Probe {
    pub fn new(action: ProbeAction) -> Self {
        Self {
            action,
            initial_delay_seconds: None,
            period_seconds: None,
            failure_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Probes {
    pub liveness: Option<Probe>,
    pub readiness: Option<Probe>,
    pub startup: Option<Probe>,
}

/// Everything the orchestrator needs to deploy one instance and its sidecars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub generated_name: String,
    pub kind: InstanceKind,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<Port>,
    pub volumes: Vec<Volume>,
    pub files: Vec<RuntimeFile>,
    pub resources: Resources,
    pub probes: Probes,
    pub privileged: bool,
    pub capabilities: Vec<String>,
    pub policy_rules: Vec<PolicyRule>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub sidecars: Vec<WorkloadSpec>,
}

impl WorkloadSpec {
    pub fn new(name: impl Into<String>, generated_name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generated_name: generated_name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// The instance followed by each sidecar.
    pub fn containers(&self) -> impl Iterator<Item = &WorkloadSpec> {
        std::iter::once(self).chain(self.sidecars.iter())
    }

    /// Ports of the instance and its sidecars; they share one network namespace.
    pub fn all_ports(&self) -> Vec<Port> {
        let mut ports: Vec<Port> = Vec::new();
        for port in self.containers().flat_map(|c| c.ports.iter()) {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }

    pub fn all_policy_rules(&self) -> Vec<PolicyRule> {
        self.containers()
            .flat_map(|c| c.policy_rules.iter().cloned())
            .collect()
    }

    pub fn needs_identity(&self) -> bool {
        self.containers().any(|c| !c.policy_rules.is_empty())
    }

    pub fn claim_name(&self) -> String {
        format!("{}-data", self.generated_name)
    }

    pub fn files_name(&self) -> String {
        format!("{}-files", self.generated_name)
    }

    /// Selector matching the pods of this instance.
    pub fn pod_selector(&self) -> String {
        format!("{}={}", fleet_common::labels::APP, self.generated_name)
    }
}
