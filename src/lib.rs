pub mod capture;
pub mod driver;
pub mod pipeline;
pub mod stereo;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Camera, CameraState, CaptureError, FrameHook, Image};
pub use driver::sim::SimulatorConfig;
pub use driver::{Driver, DriverError, DriverSession, SessionConfig};
pub use stereo::{FramePair, StereoCamera};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub camera: CameraConfig,
    pub stereo: StereoConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub buffer_count: usize,
    pub acquisition_mode: String,
    pub trigger_source: String,
    pub pixel_format: PixelFormat,
    /// Requested size; the device may adjust it
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Run right after opening, before configuration
    pub packet_size_command: Option<String>,
    /// How long stop waits for the driver to hand buffers back
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    pub left_id: String,
    pub right_id: String,
    /// Stop the viewer after this many pairs
    pub pair_limit: Option<u64>,
    pub pair_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            acquisition_mode: "Continuous".into(),
            trigger_source: "Freerun".into(),
            pixel_format: PixelFormat::Mono8,
            width: None,
            height: None,
            packet_size_command: Some("GVSPAdjustPacketSize".into()),
            stop_timeout_ms: 1000,
        }
    }
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            left_id: "cam-left".into(),
            right_id: "cam-right".into(),
            pair_limit: None,
            pair_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Defaults, then the optional file, then `STEREOCAM__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("STEREOCAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Delivery counters for one camera
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureMetrics {
    pub delivered: u64,
    pub decoded: u64,
    /// Deliveries with a bad receive status or undecodable payload
    pub dropped: u64,
    pub requeued: u64,
    /// Resubmissions the driver refused, buffer returned to the pool
    pub requeue_rejected: u64,
}
