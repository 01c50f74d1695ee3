//! In-memory fleet wiring for tests: the in-memory resource client, a
//! recording image builder and a fixed endpoint resolver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fleet_builder::{BuildPlan, BuiltImage, ImageBuilder, ImageReference};
use fleet_common::testing::InMemoryClient;
use fleet_common::{FleetError, Result, RunContext, WaitOptions};

use crate::shaper::{EndpointResolver, StaticResolver};
use crate::{Fleet, FleetConfig};

pub const TEST_NAMESPACE: &str = "testfleet-test";

#[derive(Default)]
struct BuilderState {
    builds: Vec<(BuildPlan, String)>,
    files: HashMap<(String, String), Vec<u8>>,
    failure: Option<String>,
}

/// Builder that records plans and "pushes" to the requested destination.
#[derive(Default)]
pub struct FakeBuilder {
    state: Mutex<BuilderState>,
}

impl FakeBuilder {
    fn state(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plans built so far with the reference each was pushed to.
    pub fn builds(&self) -> Vec<(BuildPlan, String)> {
        self.state().builds.clone()
    }

    pub fn set_image_file(&self, image: &str, path: &str, contents: &[u8]) {
        self.state()
            .files
            .insert((image.to_string(), path.to_string()), contents.to_vec());
    }

    /// Makes every following build fail with `message`.
    pub fn fail_builds(&self, message: &str) {
        self.state().failure = Some(message.to_string());
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(
        &self,
        plan: &BuildPlan,
        destination: &ImageReference,
        _wait: &WaitOptions,
    ) -> Result<BuiltImage> {
        let mut state = self.state();
        if let Some(message) = &state.failure {
            return Err(FleetError::Build {
                image: destination.to_string(),
                message: message.clone(),
                log: Some("step 1/1 failed".to_string()),
            });
        }
        state.builds.push((plan.clone(), destination.to_string()));
        Ok(BuiltImage {
            reference: destination.to_string(),
            log: None,
        })
    }

    async fn read_image_file(&self, image: &str, path: &str) -> Result<Vec<u8>> {
        self.state()
            .files
            .get(&(image.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| FleetError::InvalidArgument(format!("'{path}' not found in '{image}'")))
    }
}

pub struct TestFleet {
    pub fleet: Fleet,
    pub client: InMemoryClient,
    pub builder: Arc<FakeBuilder>,
}

/// Fleet backed by in-memory collaborators; shaper traffic goes to `shaper_url`.
pub fn test_fleet_with_endpoint(shaper_url: &str) -> Result<TestFleet> {
    let config = FleetConfig {
        namespace: TEST_NAMESPACE.to_string(),
        run_id: Some("test-run".to_string()),
        start_timeout_secs: 60,
        ..FleetConfig::default()
    };
    let run = Arc::new(RunContext::new(
        "test-run",
        TEST_NAMESPACE,
        Duration::from_secs(config.timeout_secs),
    )?);
    let client = InMemoryClient::new(TEST_NAMESPACE);
    let builder = Arc::new(FakeBuilder::default());
    let resolver: Arc<dyn EndpointResolver> = Arc::new(StaticResolver::parse(shaper_url)?);
    let fleet = Fleet::from_parts(
        config,
        run,
        Arc::new(client.clone()),
        builder.clone(),
        resolver,
    );
    Ok(TestFleet {
        fleet,
        client,
        builder,
    })
}

pub fn test_fleet() -> Result<TestFleet> {
    test_fleet_with_endpoint("http://127.0.0.1:9")
}
