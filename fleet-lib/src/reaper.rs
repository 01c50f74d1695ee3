//! Per-run timeout reaper: an in-cluster instance that sleeps for the run
//! timeout and then deletes every other resource of the run, so resources
//! never outlive a crashed or abandoned test process.

use fleet_common::k8s_openapi::api::rbac::v1::PolicyRule;
use fleet_common::{labels, InstanceKind, Result, RunContext};
use tracing::{info, instrument};

use crate::instance::Instance;
use crate::Fleet;

pub const REAPER_NAME: &str = "timeout-reaper";

/// Resource kinds the fleet creates, as kubectl names them.
const REAPED_KINDS: &[&str] = &[
    "replicasets.apps",
    "jobs.batch",
    "pods",
    "persistentvolumeclaims",
    "configmaps",
    "networkpolicies.networking.k8s.io",
    "services",
    "rolebindings.rbac.authorization.k8s.io",
    "roles.rbac.authorization.k8s.io",
    "serviceaccounts",
];

/// Shell command of the reaper container.
pub fn reaper_script(run: &RunContext) -> String {
    let selector = format!(
        "{},{}!={}",
        run.run_selector(),
        labels::KIND,
        InstanceKind::TimeoutReaper.as_str()
    );
    format!(
        "sleep {}; kubectl delete {} -n {} -l '{}' --ignore-not-found=true --wait=false; exec sleep infinity",
        run.timeout().as_secs(),
        REAPED_KINDS.join(","),
        run.namespace(),
        selector,
    )
}

fn rule(group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: ["get", "list", "delete", "deletecollection"]
            .iter()
            .map(|v| v.to_string())
            .collect(),
        ..Default::default()
    }
}

/// Permissions to delete everything in [`REAPED_KINDS`].
pub fn reaper_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            "",
            &[
                "pods",
                "persistentvolumeclaims",
                "configmaps",
                "services",
                "serviceaccounts",
            ],
        ),
        rule("apps", &["replicasets"]),
        rule("batch", &["jobs"]),
        rule("networking.k8s.io", &["networkpolicies"]),
        rule("rbac.authorization.k8s.io", &["roles", "rolebindings"]),
    ]
}

impl Fleet {
    /// Deploys and starts the reaper of this run.
    #[instrument(skip(self), fields(run = %self.run().run_id()))]
    pub async fn deploy_timeout_reaper(&self) -> Result<Instance> {
        let reaper = self.new_instance_of_kind(REAPER_NAME, InstanceKind::TimeoutReaper)?;
        reaper.set_image(&self.config().reaper_image).await?;
        reaper
            .set_command(vec![
                "sh".to_string(),
                "-c".to_string(),
                reaper_script(self.run()),
            ])
            .await?;
        for rule in reaper_rules() {
            reaper.add_policy_rule(rule).await?;
        }
        reaper.commit().await?;
        reaper.start().await?;
        info!(timeout = ?self.run().timeout(), "timeout reaper deployed");
        Ok(reaper)
    }
}
