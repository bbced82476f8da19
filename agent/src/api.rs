use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use surveil_common::config::DeviceConfig;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::location::Fix;
use crate::recorder::encoder::FinishedClip;
use crate::recorder::keys::clip_file_name;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Build(reqwest::Error),
    #[error("HTTP request failed: {0}")]
    Request(reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("failed to decode response: {0}")]
    Decode(reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct DeviceStatus {
    recording_enabled: bool,
}

/// Server acknowledgement for an uploaded clip.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    #[serde(default)]
    pub ok: bool,
    pub id: Option<i64>,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
struct MotionReport {
    magnitude: f64,
}

/// Device endpoints of the surveillance server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Upload,
    Status,
    Heartbeat,
    Motion,
    Location,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Endpoint::Upload => "upload",
            Endpoint::Status => "status",
            Endpoint::Heartbeat => "heartbeat",
            Endpoint::Motion => "motion",
            Endpoint::Location => "location",
        }
    }

    /// Status and location hang off the device resource; the rest take the
    /// token after the endpoint name.
    fn is_device_scoped(self) -> bool {
        matches!(self, Endpoint::Status | Endpoint::Location)
    }
}

/// Client for the device endpoints of the surveillance server.
///
/// Telemetry requests are bounded by `request_timeout`. Clip uploads carry a
/// whole video body and get `upload_timeout` instead.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl ApiClient {
    pub fn new(
        device: &DeviceConfig,
        request_timeout: Duration,
        upload_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(ApiError::Build)?;
        Ok(Self {
            http,
            base_url: device.server_url.trim_end_matches('/').to_string(),
            token: device.token.clone(),
            request_timeout,
            upload_timeout,
        })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        let name = endpoint.name();
        if endpoint.is_device_scoped() {
            format!("{}/api/device/{}/{name}/", self.base_url, self.token)
        } else {
            format!("{}/api/{name}/{}/", self.base_url, self.token)
        }
    }

    fn get(&self, endpoint: Endpoint) -> reqwest::RequestBuilder {
        self.http.get(self.url(endpoint)).timeout(self.request_timeout)
    }

    fn post(&self, endpoint: Endpoint) -> reqwest::RequestBuilder {
        self.http.post(self.url(endpoint)).timeout(self.request_timeout)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(ApiError::Request)?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    /// POST a finished clip as multipart form data.
    pub async fn upload_clip(&self, clip: FinishedClip) -> Result<UploadReceipt, ApiError> {
        let file_name = clip_file_name(clip.start_ms, clip.end_ms, clip.format.extension());
        let size = clip.bytes.len();
        let video = Part::bytes(clip.bytes)
            .file_name(file_name.clone())
            .mime_str(clip.format.mime())
            .map_err(ApiError::Build)?;
        let form = Form::new()
            .part("video", video)
            .text("duration_ms", clip.duration_ms.to_string());

        debug!(file_name, size, duration_ms = clip.duration_ms, "uploading clip");

        let response = self
            .send(
                self.http
                    .post(self.url(Endpoint::Upload))
                    .timeout(self.upload_timeout)
                    .multipart(form),
            )
            .await?;
        response.json().await.map_err(ApiError::Decode)
    }

    /// Whether the server currently wants this device to record.
    pub async fn recording_enabled(&self) -> Result<bool, ApiError> {
        let response = self.send(self.get(Endpoint::Status)).await?;
        let status: DeviceStatus = response.json().await.map_err(ApiError::Decode)?;
        Ok(status.recording_enabled)
    }

    pub async fn heartbeat(&self) -> Result<(), ApiError> {
        self.send(self.get(Endpoint::Heartbeat)).await?;
        Ok(())
    }

    pub async fn report_motion(&self, magnitude: f64) -> Result<(), ApiError> {
        self.send(self.post(Endpoint::Motion).json(&MotionReport { magnitude }))
            .await?;
        Ok(())
    }

    pub async fn report_location(&self, fix: Fix) -> Result<(), ApiError> {
        self.send(self.post(Endpoint::Location).json(&fix)).await?;
        Ok(())
    }
}

/// Ping the heartbeat endpoint on a fixed interval. Failures are dropped.
pub async fn run_heartbeat_loop(api: Arc<ApiClient>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        ticker.tick().await;
        match api.heartbeat().await {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!(consecutive_failures, "heartbeat recovered");
                }
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(error = %e, consecutive_failures, "heartbeat failed");
            }
        }
    }
}
