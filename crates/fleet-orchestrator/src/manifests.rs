//! Translation of a [`WorkloadSpec`] into cluster resources.
//!
//! Every function here is pure; the orchestrator decides what to apply.

use std::collections::BTreeMap;

use fleet_common::{labels, FleetError, Result};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction,
    HTTPGetAction, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe as KubeProbe,
    ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec,
    TCPSocketAction, Volume as KubeVolume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::workload::{Probe, ProbeAction, WorkloadSpec};

pub type Labels = BTreeMap<String, String>;

/// Image of the init container that hands volumes to their owners.
pub const INIT_IMAGE: &str = "docker.io/library/busybox:1.36";

fn meta(name: &str, labels: &Labels, annotations: &Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        annotations: (!annotations.is_empty()).then(|| annotations.clone()),
        ..Default::default()
    }
}

fn app_selector(spec: &WorkloadSpec) -> Labels {
    BTreeMap::from([(labels::APP.to_string(), spec.generated_name.clone())])
}

pub fn service(spec: &WorkloadSpec, labels: &Labels) -> Service {
    let ports = spec
        .all_ports()
        .into_iter()
        .map(|port| ServicePort {
            name: Some(port.name()),
            port: i32::from(port.number),
            target_port: Some(IntOrString::Int(i32::from(port.number))),
            protocol: Some(port.protocol.as_str().to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: meta(&spec.generated_name, labels, &spec.annotations),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(app_selector(spec)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Bytes in a Kubernetes quantity such as `512Mi` or `1G`.
pub fn parse_quantity(value: &str) -> Result<u128> {
    const SUFFIXES: &[(&str, u128)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let value = value.trim();
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| value.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((value, 1));
    digits
        .parse::<u128>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| FleetError::InvalidArgument(format!("invalid volume size '{value}'")))
}

/// One claim sized to the sum of every declared volume.
pub fn claim(spec: &WorkloadSpec, labels: &Labels) -> Result<PersistentVolumeClaim> {
    let mut total = 0u128;
    for volume in &spec.volumes {
        total = total.checked_add(parse_quantity(&volume.size)?).ok_or_else(|| {
            FleetError::InvalidArgument(format!(
                "volumes of '{}' exceed the largest claim size",
                spec.name
            ))
        })?;
    }
    Ok(PersistentVolumeClaim {
        metadata: meta(&spec.claim_name(), labels, &spec.annotations),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(total.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

fn file_key(index: usize) -> String {
    format!("file-{index}")
}

pub fn config_map(spec: &WorkloadSpec, labels: &Labels) -> ConfigMap {
    let mut data = BTreeMap::new();
    let mut binary = BTreeMap::new();
    for (i, file) in spec.files.iter().enumerate() {
        match String::from_utf8(file.contents.clone()) {
            Ok(text) => {
                data.insert(file_key(i), text);
            }
            Err(_) => {
                binary.insert(file_key(i), ByteString(file.contents.clone()));
            }
        }
    }
    ConfigMap {
        metadata: meta(&spec.files_name(), labels, &spec.annotations),
        data: (!data.is_empty()).then_some(data),
        binary_data: (!binary.is_empty()).then_some(binary),
        ..Default::default()
    }
}

pub fn service_account(spec: &WorkloadSpec, labels: &Labels) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(&spec.generated_name, labels, &spec.annotations),
        ..Default::default()
    }
}

pub fn role(spec: &WorkloadSpec, labels: &Labels) -> Role {
    Role {
        metadata: meta(&spec.generated_name, labels, &spec.annotations),
        rules: Some(spec.all_policy_rules()),
    }
}

pub fn role_binding(spec: &WorkloadSpec, labels: &Labels, namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: meta(&spec.generated_name, labels, &spec.annotations),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: spec.generated_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: spec.generated_name.clone(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Denies all ingress and egress to the instance's pods.
pub fn deny_policy(spec: &WorkloadSpec, labels: &Labels) -> Result<NetworkPolicy> {
    let mut policy: NetworkPolicy = serde_json::from_value(serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {},
        "spec": {
            "podSelector": { "matchLabels": app_selector(spec) },
            "policyTypes": ["Ingress", "Egress"],
        },
    }))
    .map_err(|e| FleetError::InvalidArgument(format!("network policy: {e}")))?;
    policy.metadata = meta(&spec.generated_name, labels, &spec.annotations);
    Ok(policy)
}

fn probe(probe: &Probe) -> KubeProbe {
    let mut out = KubeProbe {
        initial_delay_seconds: probe.initial_delay_seconds,
        period_seconds: probe.period_seconds,
        failure_threshold: probe.failure_threshold,
        ..Default::default()
    };
    match &probe.action {
        ProbeAction::Http { path, port } => {
            out.http_get = Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(i32::from(*port)),
                ..Default::default()
            })
        }
        ProbeAction::Tcp { port } => {
            out.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(*port)),
                ..Default::default()
            })
        }
        ProbeAction::Exec { command } => {
            out.exec = Some(ExecAction {
                command: Some(command.clone()),
            })
        }
    }
    out
}

fn resources(spec: &WorkloadSpec) -> Option<ResourceRequirements> {
    let r = &spec.resources;
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &r.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &r.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    let limits = r
        .memory_limit
        .as_ref()
        .map(|m| BTreeMap::from([("memory".to_string(), Quantity(m.clone()))]));
    if requests.is_empty() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits,
        ..Default::default()
    })
}

fn volume_mounts(spec: &WorkloadSpec) -> Vec<VolumeMount> {
    let claim = spec.claim_name();
    let files = spec.files_name();
    let data = spec.volumes.iter().map(|v| VolumeMount {
        name: claim.clone(),
        mount_path: v.path.clone(),
        sub_path: Some(v.path.trim_start_matches('/').to_string()).filter(|p| !p.is_empty()),
        ..Default::default()
    });
    let content = spec.files.iter().enumerate().map(|(i, f)| VolumeMount {
        name: files.clone(),
        mount_path: f.destination.clone(),
        sub_path: Some(file_key(i)),
        ..Default::default()
    });
    data.chain(content).collect()
}

pub fn container(spec: &WorkloadSpec) -> Container {
    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    let ports: Vec<ContainerPort> = spec
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name()),
            container_port: i32::from(p.number),
            protocol: Some(p.protocol.as_str().to_string()),
            ..Default::default()
        })
        .collect();
    let mounts = volume_mounts(spec);
    let security = (spec.privileged || !spec.capabilities.is_empty()).then(|| SecurityContext {
        privileged: spec.privileged.then_some(true),
        capabilities: (!spec.capabilities.is_empty()).then(|| Capabilities {
            add: Some(spec.capabilities.clone()),
            ..Default::default()
        }),
        ..Default::default()
    });

    Container {
        name: spec.generated_name.clone(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        resources: resources(spec),
        liveness_probe: spec.probes.liveness.as_ref().map(probe),
        readiness_probe: spec.probes.readiness.as_ref().map(probe),
        startup_probe: spec.probes.startup.as_ref().map(probe),
        security_context: security,
        ..Default::default()
    }
}

/// Root container that chowns each volume to its declared owner.
pub fn init_container(spec: &WorkloadSpec) -> Option<Container> {
    if spec.volumes.is_empty() {
        return None;
    }
    let script = spec
        .volumes
        .iter()
        .map(|v| format!("chown -R {0}:{0} {1}", v.owner, v.path))
        .collect::<Vec<_>>()
        .join(" && ");
    let mounts = volume_mounts(&WorkloadSpec {
        files: Vec::new(),
        ..spec.clone()
    });
    Some(Container {
        name: format!("{}-init", spec.generated_name),
        image: Some(INIT_IMAGE.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(mounts),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_volumes(spec: &WorkloadSpec) -> Vec<KubeVolume> {
    let mut volumes = Vec::new();
    if !spec.volumes.is_empty() {
        volumes.push(KubeVolume {
            name: spec.claim_name(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: spec.claim_name(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if !spec.files.is_empty() {
        let items = spec
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| KeyToPath {
                key: file_key(i),
                path: file_key(i),
                mode: f.mode,
            })
            .collect();
        volumes.push(KubeVolume {
            name: spec.files_name(),
            config_map: Some(ConfigMapVolumeSource {
                name: spec.files_name(),
                items: Some(items),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

/// Single-replica compute whose pod folds the instance and its sidecars.
pub fn replica_set(spec: &WorkloadSpec, labels: &Labels) -> ReplicaSet {
    let containers: Vec<Container> = spec.containers().map(container).collect();
    let init: Vec<Container> = spec.containers().filter_map(init_container).collect();
    let volumes: Vec<KubeVolume> = spec.containers().flat_map(pod_volumes).collect();

    ReplicaSet {
        metadata: meta(&spec.generated_name, labels, &spec.annotations),
        spec: Some(ReplicaSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_selector(spec)),
                ..Default::default()
            },
            template: Some(PodTemplateSpec {
                metadata: Some(meta(&spec.generated_name, labels, &spec.annotations)),
                spec: Some(PodSpec {
                    containers,
                    init_containers: (!init.is_empty()).then_some(init),
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    service_account_name: spec.needs_identity().then(|| spec.generated_name.clone()),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        status: None,
    }
}
