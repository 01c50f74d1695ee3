use std::str::FromStr;
use std::time::Duration;

use fleet_builder::{DEFAULT_REGISTRY, DEFAULT_TAG};
use fleet_common::run::{DEFAULT_NAMESPACE, DEFAULT_TIMEOUT};
use fleet_common::{FleetError, Result, RunContext};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SHAPER_IMAGE: &str = "ghcr.io/celestiaorg/bittwister:0.0.12";
pub const DEFAULT_REAPER_IMAGE: &str = "docker.io/bitnami/kubectl:1.32";
pub const DEFAULT_EXECUTOR_IMAGE: &str = "docker.io/nicolaka/netshoot:v0.13";
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Build strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuilderKind {
    #[default]
    Docker,
    Kaniko,
}

impl FromStr for BuilderKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(BuilderKind::Docker),
            "kaniko" => Ok(BuilderKind::Kaniko),
            other => Err(FleetError::Config(format!(
                "unknown builder '{other}', expected 'docker' or 'kaniko'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub namespace: String,
    /// Generated when absent.
    pub run_id: Option<String>,
    pub timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub registry: String,
    pub image_tag: String,
    pub builder: BuilderKind,
    pub shaper_image: String,
    pub reaper_image: String,
    pub executor_image: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            run_id: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            start_timeout_secs: DEFAULT_START_TIMEOUT.as_secs(),
            registry: DEFAULT_REGISTRY.to_string(),
            image_tag: DEFAULT_TAG.to_string(),
            builder: BuilderKind::default(),
            shaper_image: DEFAULT_SHAPER_IMAGE.to_string(),
            reaper_image: DEFAULT_REAPER_IMAGE.to_string(),
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(FleetError::Config(format!(
            "{key} must be a positive number of seconds, got '{value}'"
        ))),
        Ok(secs) => Ok(secs),
    }
}

impl FleetConfig {
    /// Defaults overridden by `TESTFLEET_*` variables; a `.env` file is honored.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TESTFLEET_NAMESPACE") {
            config.namespace = v;
        }
        if let Some(v) = var("TESTFLEET_RUN_ID") {
            config.run_id = Some(v);
        }
        if let Some(v) = var("TESTFLEET_TIMEOUT_SECS") {
            config.timeout_secs = parse_secs("TESTFLEET_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("TESTFLEET_START_TIMEOUT_SECS") {
            config.start_timeout_secs = parse_secs("TESTFLEET_START_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("TESTFLEET_REGISTRY") {
            config.registry = v;
        }
        if let Some(v) = var("TESTFLEET_IMAGE_TAG") {
            config.image_tag = v;
        }
        if let Some(v) = var("TESTFLEET_BUILDER") {
            config.builder = v.parse()?;
        }
        if let Some(v) = var("TESTFLEET_SHAPER_IMAGE") {
            config.shaper_image = v;
        }
        if let Some(v) = var("TESTFLEET_REAPER_IMAGE") {
            config.reaper_image = v;
        }
        if let Some(v) = var("TESTFLEET_EXECUTOR_IMAGE") {
            config.executor_image = v;
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Run context for this configuration, generating a run id when none is set.
    pub fn run_context(&self) -> Result<RunContext> {
        match &self.run_id {
            Some(id) => RunContext::new(id.clone(), self.namespace.clone(), self.timeout()),
            None => Ok(RunContext::generate(self.namespace.clone(), self.timeout())),
        }
    }
}
