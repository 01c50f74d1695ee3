//! HTTP client for the shaper's control surface.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Slugs the control surface answers with when a service has nothing to stop.
const BENIGN_SLUGS: &[&str] = &[
    "service-not-initialized",
    "service-not-ready",
    "service-not-started",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ShaperError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        slug: Option<String>,
        message: String,
    },
}

impl ShaperError {
    /// The service was not running, so there was nothing to stop.
    pub fn is_benign(&self) -> bool {
        match self {
            ShaperError::Api { slug, message, .. } => {
                if let Some(slug) = slug {
                    if BENIGN_SLUGS.contains(&slug.as_str()) {
                        return true;
                    }
                }
                let message = message.to_ascii_lowercase();
                ["not initialized", "not ready", "not started"]
                    .iter()
                    .any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }
}

/// One traffic-control service of the shaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaperService {
    Bandwidth,
    Latency,
    PacketLoss,
}

impl ShaperService {
    pub const ALL: [ShaperService; 3] = [
        ShaperService::Bandwidth,
        ShaperService::Latency,
        ShaperService::PacketLoss,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            ShaperService::Bandwidth => "bandwidth",
            ShaperService::Latency => "latency",
            ShaperService::PacketLoss => "packetloss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub network_interface_name: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    slug: Option<String>,
    title: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ShaperClient {
    base_url: Url,
    client: Client,
}

impl ShaperClient {
    /// Requests resolve below `base_url`, so a path prefix such as a proxy
    /// route is kept.
    pub fn new(mut base_url: Url) -> Result<Self, ShaperError> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, ShaperError> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn start(&self, service: ShaperService, params: &Value) -> Result<(), ShaperError> {
        let url = self.url(&format!("api/v1/services/{}/start", service.path()))?;
        let response = self.client.post(url).json(params).send().await?;
        check(response).await.map(drop)
    }

    pub async fn stop(&self, service: ShaperService) -> Result<(), ShaperError> {
        let url = self.url(&format!("api/v1/services/{}/stop", service.path()))?;
        let response = self.client.post(url).send().await?;
        check(response).await.map(drop)
    }

    pub async fn status(&self) -> Result<Vec<ServiceStatus>, ShaperError> {
        let url = self.url("api/v1/services/status")?;
        let response = check(self.client.get(url).send().await?).await?;
        Ok(response.json().await?)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ShaperError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    let (slug, message) = match serde_json::from_str::<ApiErrorBody>(&error_text) {
        Ok(body) => {
            let message = body
                .message
                .or(body.title)
                .unwrap_or_else(|| error_text.clone());
            (body.slug, message)
        }
        Err(_) => (None, error_text),
    };
    Err(ShaperError::Api {
        status: status.as_u16(),
        slug,
        message,
    })
}
