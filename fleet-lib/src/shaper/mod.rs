//! Network fault injection through a privileged traffic-control sidecar.
//!
//! The shaper container shares the parent's network namespace and exposes
//! an HTTP control surface. Exactly one fault (bandwidth limit, latency with
//! jitter, or packet loss) is active at a time; every switch stops all
//! services before starting the requested one.

pub mod client;
pub mod resolver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::wait::poll_until;
use fleet_common::{FleetError, InstanceKind, InstanceState, Result, WaitOptions};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub use client::{ServiceStatus, ShaperClient, ShaperError, ShaperService};
pub use resolver::{ClusterDnsResolver, EndpointResolver, StaticResolver};

use crate::instance::Instance;
use crate::sidecar::Sidecar;
use crate::Shared;

pub const DEFAULT_PORT: u16 = 9007;
pub const DEFAULT_INTERFACE: &str = "eth0";
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Bits per second.
    Bandwidth { limit: u64 },
    Latency { latency_ms: u64, jitter_ms: u64 },
    /// Percent of packets dropped.
    PacketLoss { rate: u8 },
}

impl Fault {
    pub fn service(&self) -> ShaperService {
        match self {
            Fault::Bandwidth { .. } => ShaperService::Bandwidth,
            Fault::Latency { .. } => ShaperService::Latency,
            Fault::PacketLoss { .. } => ShaperService::PacketLoss,
        }
    }

    /// Start parameters on `interface`.
    pub fn params(&self, interface: &str) -> Value {
        match *self {
            Fault::Bandwidth { limit } => json!({
                "network_interface_name": interface,
                "limit": limit,
            }),
            Fault::Latency {
                latency_ms,
                jitter_ms,
            } => json!({
                "network_interface_name": interface,
                "latency": latency_ms,
                "jitter": jitter_ms,
            }),
            Fault::PacketLoss { rate } => json!({
                "network_interface_name": interface,
                "packet_loss_rate": rate,
            }),
        }
    }
}

pub struct NetworkShaper {
    instance: Instance,
    image: String,
    port: u16,
    interface: String,
    resolver: Arc<dyn EndpointResolver>,
    /// Built on first use; never carried over to clones.
    client: Mutex<Option<ShaperClient>>,
    active: Mutex<Option<Fault>>,
}

impl NetworkShaper {
    pub(crate) fn new(parent_name: &str, shared: Arc<Shared>) -> Result<Self> {
        let image = shared.config.shaper_image.clone();
        let resolver = shared.resolver.clone();
        let instance = Instance::new(&format!("{parent_name}-shaper"), InstanceKind::Basic, shared)?;
        Ok(Self {
            instance,
            image,
            port: DEFAULT_PORT,
            interface: DEFAULT_INTERFACE.to_string(),
            resolver,
            client: Mutex::new(None),
            active: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn active_fault(&self) -> Option<Fault> {
        *self.active.lock().await
    }

    /// Whether a control client has been built yet.
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    fn error(&self, err: ShaperError) -> FleetError {
        FleetError::Shaper {
            instance: self.instance.name().to_string(),
            message: err.to_string(),
        }
    }

    async fn client(&self) -> Result<ShaperClient> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let parent = self.instance.parent().await.ok_or_else(|| FleetError::Shaper {
            instance: self.instance.name().to_string(),
            message: "not attached to an instance".to_string(),
        })?;
        let url = self.resolver.endpoint(&parent, self.port).await?;
        debug!(%url, "connecting to shaper");
        let client = ShaperClient::new(url).map_err(|e| self.error(e))?;
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn ensure_started(&self, operation: &'static str) -> Result<()> {
        let state = self.instance.state().await;
        if state == InstanceState::Started {
            Ok(())
        } else {
            Err(FleetError::IllegalTransition {
                instance: self.instance.name().to_string(),
                operation,
                state,
            })
        }
    }

    /// Stops every service, then starts `fault` if there is one.
    async fn switch(&self, operation: &'static str, fault: Option<Fault>) -> Result<()> {
        let mut active = self.active.lock().await;
        self.ensure_started(operation).await?;
        let client = self.client().await?;

        for service in ShaperService::ALL {
            match client.stop(service).await {
                Ok(()) => debug!(service = service.path(), "service stopped"),
                Err(e) if e.is_benign() => {
                    debug!(service = service.path(), error = %e, "nothing to stop")
                }
                Err(e) => return Err(self.error(e)),
            }
        }
        *active = None;

        if let Some(fault) = fault {
            client
                .start(fault.service(), &fault.params(&self.interface))
                .await
                .map_err(|e| self.error(e))?;
            info!(instance = %self.instance.name(), ?fault, "fault active");
        }
        *active = fault;
        Ok(())
    }

    /// Caps throughput at `limit` bits per second; zero removes the cap.
    pub async fn set_bandwidth_limit(&self, limit: u64) -> Result<()> {
        let fault = (limit > 0).then_some(Fault::Bandwidth { limit });
        self.switch("set_bandwidth_limit", fault).await
    }

    /// Delays every packet; both values zero removes the delay.
    pub async fn set_latency_and_jitter(&self, latency_ms: u64, jitter_ms: u64) -> Result<()> {
        let fault = (latency_ms > 0 || jitter_ms > 0).then_some(Fault::Latency {
            latency_ms,
            jitter_ms,
        });
        self.switch("set_latency_and_jitter", fault).await
    }

    /// Drops `rate` percent of packets; zero stops dropping.
    pub async fn set_packet_loss(&self, rate: u8) -> Result<()> {
        if rate > 100 {
            return Err(FleetError::InvalidArgument(format!(
                "packet loss rate {rate} is above 100 percent"
            )));
        }
        let fault = (rate > 0).then_some(Fault::PacketLoss { rate });
        self.switch("set_packet_loss", fault).await
    }

    pub async fn clear_faults(&self) -> Result<()> {
        self.switch("clear_faults", None).await
    }

    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        self.ensure_started("status").await?;
        let client = self.client().await?;
        client.status().await.map_err(|e| self.error(e))
    }

    /// Polls the status endpoint until it lists the shaper's services.
    #[instrument(skip(self, opts), fields(instance = %self.instance.name()))]
    pub async fn wait_ready(&self, opts: &WaitOptions) -> Result<()> {
        self.ensure_started("wait_ready").await?;
        let client = self.client().await?;
        let client = &client;
        poll_until(
            opts,
            READY_POLL_INTERVAL,
            "shaper readiness",
            self.instance.name(),
            move || async move {
                match client.status().await {
                    Ok(services) if !services.is_empty() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => {
                        debug!(error = %e, "shaper not answering yet");
                        Ok(None)
                    }
                }
            },
        )
        .await
    }
}

#[async_trait]
impl Sidecar for NetworkShaper {
    /// Declares and commits the shaper container on first attach.
    async fn initialize(&self, _parent: &str) -> Result<()> {
        if self.instance.state().await != InstanceState::None {
            return Ok(());
        }
        self.instance.set_image(&self.image).await?;
        self.instance
            .set_args(vec![
                "serve".to_string(),
                "--serve-addr".to_string(),
                format!("0.0.0.0:{}", self.port),
            ])
            .await?;
        self.instance.set_privileged(true).await?;
        self.instance.add_capability("NET_ADMIN").await?;
        self.instance.add_port_tcp(self.port).await?;
        self.instance.commit().await
    }

    async fn pre_start(&self) -> Result<()> {
        Ok(())
    }

    fn instance(&self) -> &Instance {
        &self.instance
    }

    async fn clone_for(&self, parent: &str) -> Result<Arc<dyn Sidecar>> {
        let instance = self.instance.duplicate(self.instance.name(), Some(parent)).await?;
        Ok(Arc::new(NetworkShaper {
            instance,
            image: self.image.clone(),
            port: self.port,
            interface: self.interface.clone(),
            resolver: self.resolver.clone(),
            client: Mutex::new(None),
            active: Mutex::new(None),
        }))
    }
}
