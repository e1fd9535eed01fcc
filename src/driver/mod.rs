//! Boundary to the vendor capture engine
//!
//! The driver is treated as an opaque collaborator. Buffers cross this
//! boundary by value: submitting a [`Frame`] moves it into the driver, and the
//! driver moves it back into the registered [`FrameCallback`] once it has been
//! filled (or hands it back directly when flushing or rejecting a submission).

pub mod sim;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::frame::Frame;

/// Handle the driver hands out for an open device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

impl DeviceHandle {
    /// Addresses the driver itself rather than a camera
    pub const SYSTEM: DeviceHandle = DeviceHandle(1);
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver not started")]
    NotStarted,
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("camera {0} is already open")]
    AlreadyOpen(String),
    #[error("invalid device handle {0}")]
    BadHandle(DeviceHandle),
    #[error("unknown feature {0}")]
    UnknownFeature(String),
    #[error("invalid value {value:?} for feature {feature}")]
    InvalidValue { feature: String, value: String },
    #[error("capture engine is not running")]
    NotCapturing,
    #[error("buffer slot {0} was not announced")]
    NotAnnounced(usize),
    #[error("announced buffers are still queued")]
    BuffersInUse,
    #[error("{call} failed with code {code}")]
    Vendor { call: &'static str, code: i32 },
}

/// Buffer registration passed to [`Driver::announce_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub slot: usize,
    pub capacity: usize,
}

/// A submission the driver refused; the buffer comes back with the error
pub struct Rejected {
    pub frame: Frame,
    pub error: DriverError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("slot", &self.frame.slot())
            .field("error", &self.error)
            .finish()
    }
}

/// Completion handler registered with every submitted buffer.
///
/// Called on a driver-owned thread once the buffer has been filled. The
/// implementation owns the frame from that point on and is responsible for
/// giving it back to the driver.
pub trait FrameCallback: Send + Sync {
    fn frame_done(self: Arc<Self>, handle: DeviceHandle, frame: Frame);
}

/// Opaque vendor capture engine
pub trait Driver: Send + Sync {
    fn startup(&self) -> Result<(), DriverError>;
    fn shutdown(&self);

    fn open_camera(&self, id: &str) -> Result<DeviceHandle, DriverError>;
    fn close_camera(&self, handle: DeviceHandle) -> Result<(), DriverError>;

    fn run_command(&self, handle: DeviceHandle, name: &str) -> Result<(), DriverError>;
    fn get_int(&self, handle: DeviceHandle, name: &str) -> Result<i64, DriverError>;
    fn set_int(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<(), DriverError>;
    fn get_enum(&self, handle: DeviceHandle, name: &str) -> Result<String, DriverError>;
    fn set_enum(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<(), DriverError>;

    fn announce_frame(
        &self,
        handle: DeviceHandle,
        buffer: BufferDescriptor,
    ) -> Result<(), DriverError>;
    fn revoke_all_frames(&self, handle: DeviceHandle) -> Result<(), DriverError>;

    fn capture_start(&self, handle: DeviceHandle) -> Result<(), DriverError>;
    fn capture_end(&self, handle: DeviceHandle) -> Result<(), DriverError>;

    /// Submit a buffer to the pending-frame queue
    fn queue_frame(
        &self,
        handle: DeviceHandle,
        frame: Frame,
        callback: Arc<dyn FrameCallback>,
    ) -> Result<(), Rejected>;

    /// Discard every pending submission, returning the buffers undelivered
    fn queue_flush(&self, handle: DeviceHandle) -> Result<Vec<Frame>, DriverError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Command run against the system handle right after startup
    pub discovery_command: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_command: Some("GeVDiscoveryAllOnce".into()),
        }
    }
}

/// Started driver, shut down when the last clone is dropped
#[derive(Clone)]
pub struct DriverSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    driver: Arc<dyn Driver>,
}

impl DriverSession {
    pub fn startup(driver: Arc<dyn Driver>, config: &SessionConfig) -> Result<Self, DriverError> {
        driver.startup()?;
        info!("Driver session started");

        if let Some(command) = &config.discovery_command {
            // Not every transport layer knows the discovery command
            if let Err(e) = driver.run_command(DeviceHandle::SYSTEM, command) {
                warn!(command = %command, error = %e, "Discovery command failed");
            }
        }

        Ok(Self {
            inner: Arc::new(SessionInner { driver }),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }
}

impl fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverSession")
            .field("owners", &Arc::strong_count(&self.inner))
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        info!("Driver session shutting down");
        self.driver.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimDriver, SimulatorConfig};

    #[test]
    fn session_shuts_driver_down_with_last_owner() {
        let driver = SimDriver::new(SimulatorConfig::manual());
        driver.add_camera("left", 64, 48);

        let session = DriverSession::startup(driver.clone(), &SessionConfig::default()).unwrap();
        let second = session.clone();
        assert!(driver.is_started());

        drop(session);
        assert!(driver.is_started());
        drop(second);
        assert!(!driver.is_started());
    }

    #[test]
    fn unknown_discovery_command_is_not_fatal() {
        let driver = SimDriver::new(SimulatorConfig::manual());
        let config = SessionConfig {
            discovery_command: Some("NoSuchCommand".into()),
        };
        assert!(DriverSession::startup(driver, &config).is_ok());
    }
}
