//! Capture workflow.
//!
//! Capturing a still on the backend needs the camera to itself, so the affected tiles
//! are paused first, given a moment to let go of their streams, and always resumed
//! afterwards, whatever the captures returned.

use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::client::{BackendClient, CaptureRecord, DeviceInfo};
use crate::error::ClientError;
use crate::wall::StreamWall;

/// Something that can capture a still from a device.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Capture one image from device `index`.
    async fn capture(&self, index: u32) -> Result<CaptureRecord, ClientError>;
}

#[async_trait]
impl CaptureBackend for BackendClient {
    async fn capture(&self, index: u32) -> Result<CaptureRecord, ClientError> {
        BackendClient::capture(self, index).await
    }
}

/// Pauses and resumes the streams of individual devices.
pub trait StreamControl: Send {
    /// Pause the stream of `index`, if one is shown.
    fn pause_device(&mut self, index: u32);
    /// Resume the stream of `index`, if one is shown.
    fn resume_device(&mut self, index: u32);
}

impl StreamControl for StreamWall {
    fn pause_device(&mut self, index: u32) {
        self.pause(index);
    }

    fn resume_device(&mut self, index: u32) {
        self.resume(index);
    }
}

/// Capture workflow failure.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No active device to capture from.
    #[error("No active cameras to capture from")]
    NoActiveDevices,

    /// Every capture failed.
    #[error("Failed to capture images from all devices ({} failed)", .failures.len())]
    AllFailed {
        /// Device index and error of each failed capture.
        failures: Vec<(u32, ClientError)>,
    },
}

/// Result of one device's capture.
#[derive(Debug)]
pub struct CaptureOutcome {
    /// Device index.
    pub index: u32,
    /// Backend record or error.
    pub result: Result<CaptureRecord, ClientError>,
}

/// Per-device results of a capture run with at least one success.
#[derive(Debug)]
pub struct CaptureReport {
    /// One entry per captured device, in request order.
    pub outcomes: Vec<CaptureOutcome>,
}

impl CaptureReport {
    /// Successful captures.
    pub fn succeeded(&self) -> impl Iterator<Item = (u32, &CaptureRecord)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|r| (o.index, r)))
    }

    /// Failed captures.
    pub fn failed(&self) -> impl Iterator<Item = (u32, &ClientError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.index, e)))
    }

    /// True if some but not all captures failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Resumes every paused device when dropped, including on cancellation.
struct PauseGuard<'a> {
    streams: &'a mut dyn StreamControl,
    paused: Vec<u32>,
}

impl<'a> PauseGuard<'a> {
    fn pause(streams: &'a mut dyn StreamControl, indices: &[u32]) -> Self {
        for &index in indices {
            streams.pause_device(index);
        }
        Self {
            streams,
            paused: indices.to_vec(),
        }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        for &index in &self.paused {
            self.streams.resume_device(index);
        }
    }
}

/// Pause, settle, capture, resume.
#[derive(Debug, Clone)]
pub struct CaptureWorkflow<B> {
    backend: B,
    settle: Duration,
}

impl<B: CaptureBackend> CaptureWorkflow<B> {
    /// Workflow waiting `settle` between pausing and capturing.
    pub fn new(backend: B, settle: Duration) -> Self {
        Self { backend, settle }
    }

    /// Capture from every active device in `devices`.
    pub async fn capture_active(
        &self,
        devices: &[DeviceInfo],
        streams: &mut dyn StreamControl,
    ) -> Result<CaptureReport, CaptureError> {
        let indices: Vec<u32> = devices.iter().filter(|d| d.active).map(|d| d.index).collect();
        self.capture(&indices, streams).await
    }

    /// Capture from the given devices.
    pub async fn capture(
        &self,
        indices: &[u32],
        streams: &mut dyn StreamControl,
    ) -> Result<CaptureReport, CaptureError> {
        if indices.is_empty() {
            return Err(CaptureError::NoActiveDevices);
        }

        info!(devices = ?indices, "Starting capture");
        let guard = PauseGuard::pause(streams, indices);
        tokio::time::sleep(self.settle).await;

        let results = join_all(indices.iter().map(|&index| self.backend.capture(index))).await;
        drop(guard);

        let outcomes: Vec<CaptureOutcome> = indices
            .iter()
            .zip(results)
            .map(|(&index, result)| CaptureOutcome { index, result })
            .collect();

        if outcomes.iter().all(|o| o.result.is_err()) {
            let failures = outcomes
                .into_iter()
                .filter_map(|o| o.result.err().map(|e| (o.index, e)))
                .collect();
            warn!("All captures failed");
            return Err(CaptureError::AllFailed { failures });
        }

        let report = CaptureReport { outcomes };
        for (index, err) in report.failed() {
            warn!(device = index, error = %err, "Capture failed");
        }
        info!(captured = report.succeeded().count(), "Capture finished");
        Ok(report)
    }
}
