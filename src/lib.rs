//! Frame and buffer orchestration for a multi-stage camera capture pipeline.
//!
//! The crate models the streaming core of a camera service: fixed pools of
//! hardware buffers ([`buffer::BufferManager`]), reference-counted per-capture
//! work descriptors ([`frame::Frame`]), blocking FIFO hand-offs between stage
//! worker threads ([`frame::FrameQueue`]), fixed per-mode stage topologies
//! ([`pipeline::Factory`]), and the [`pipeline::Orchestrator`] that generates
//! frames, binds buffers, routes between stages, and retires completed work.
//! Still-capture candidates are held by the [`pipeline::CaptureSelector`].
//!
//! Hardware access itself lives behind the [`pipeline::Stage`] trait; this
//! crate owns everything that moves between the stages.

pub mod buffer;
pub mod error;
pub mod frame;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::frame::{CropRect, PixelFormat, StageId};

/// Operating scenario of the camera service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scenario {
    /// Single-camera preview/capture.
    Normal,
    /// Dual-camera compositing. The instance whose id matches
    /// `fusion_camera_id` hands its capture output to the fusion engine
    /// instead of returning it to the pool.
    Dual { fusion_camera_id: u32 },
    /// Sensor-only low-power stream (iris/face detection).
    Vision,
    /// High-speed recording; the front stages batch buffers per hardware
    /// trigger.
    HighSpeed { batch_size: usize },
}

/// Negotiated preview output geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Per-stage queue wait budgets, in milliseconds. The values are liveness
/// bounds, not deadlines: a timed-out pop loops back to re-check shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTimeouts {
    pub sensor_ms: u64,
    pub three_a_ms: u64,
    pub isp_ms: u64,
    pub scaler_ms: u64,
    pub gdc_ms: u64,
    pub csc_ms: u64,
    pub jpeg_ms: u64,
    pub done_ms: u64,
    /// Bounded wait for an ISP output buffer to return to its pool.
    pub buffer_wait_ms: u64,
}

impl Default for QueueTimeouts {
    fn default() -> Self {
        Self {
            sensor_ms: 1000,
            three_a_ms: 1000,
            isp_ms: 2000,
            scaler_ms: 1000,
            gdc_ms: 500,
            csc_ms: 500,
            jpeg_ms: 5000,
            done_ms: 500,
            buffer_wait_ms: 4000,
        }
    }
}

impl QueueTimeouts {
    pub fn stage_wait(&self, stage: StageId) -> Duration {
        let ms = match stage {
            StageId::Sensor => self.sensor_ms,
            StageId::ThreeA => self.three_a_ms,
            StageId::Isp => self.isp_ms,
            StageId::Scaler => self.scaler_ms,
            StageId::Gdc => self.gdc_ms,
            StageId::Csc => self.csc_ms,
            StageId::Jpeg => self.jpeg_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn done_wait(&self) -> Duration {
        Duration::from_millis(self.done_ms)
    }

    pub fn buffer_wait(&self) -> Duration {
        Duration::from_millis(self.buffer_wait_ms)
    }
}

/// Static configuration for one camera service instance, loadable from a TOML
/// file and fixed for the lifetime of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub camera_id: u32,
    pub scenario: Scenario,
    pub preview: PreviewConfig,
    /// Hand frames to the completion queue as soon as the 3A stage is set up
    /// instead of waiting for the full chain (latency optimisation).
    pub early_frame_return: bool,
    /// Sensor output feeds 3A over the on-the-fly hardware link; 3A then
    /// needs no source buffer of its own.
    pub sensor_otf: bool,
    /// Capacity of the still-capture candidate window.
    pub selector_window: usize,
    pub timeouts: QueueTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            scenario: Scenario::Normal,
            preview: PreviewConfig {
                width: 1920,
                height: 1080,
                format: PixelFormat::Nv12,
            },
            early_frame_return: false,
            sensor_otf: true,
            selector_window: 4,
            timeouts: QueueTimeouts::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file, with defaults for anything unset.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        settings
            .try_deserialize()
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn is_vision(&self) -> bool {
        self.scenario == Scenario::Vision
    }

    pub fn is_dual(&self) -> bool {
        matches!(self.scenario, Scenario::Dual { .. })
    }

    /// Buffers consumed per hardware trigger at a stage. High-speed recording
    /// batches the front stages; everything else runs one buffer per tick.
    pub fn batch_size(&self, stage: StageId) -> usize {
        match self.scenario {
            Scenario::HighSpeed { batch_size } if matches!(stage, StageId::Sensor | StageId::ThreeA) => {
                batch_size.max(1)
            }
            _ => 1,
        }
    }

    pub fn hw_preview_size(&self) -> (u32, u32) {
        (self.preview.width, self.preview.height)
    }

    /// Whether a post-crop scaler output still needs the extra CSC pass to
    /// reach the display target. Matching geometry and format means the
    /// scaler output is display-ready as-is.
    pub fn zoom_csc_required(&self, post_crop: CropRect, format: PixelFormat) -> bool {
        post_crop.size() != self.hw_preview_size() || format != self.preview.format
    }
}
