//! Per-camera acquisition engine

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::delivery::{CaptureStats, DeliveryContext, FrameHook};
use super::frame::{Geometry, Image};
use super::pool::{FramePool, PoolCensus};
use super::CaptureError;
use crate::driver::{DeviceHandle, Driver, DriverError, DriverSession};
use crate::pipeline::queue::ImageQueue;
use crate::{CameraConfig, CaptureMetrics};

/// Lifecycle position of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Open,
    Configured,
    Capturing,
    Stopped,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One camera driven through the driver session
pub struct Camera {
    session: DriverSession,
    handle: DeviceHandle,
    id: String,
    config: CameraConfig,
    geometry: Geometry,
    state: CameraState,
    pool: Option<FramePool>,
    queue: Arc<ImageQueue>,
    stats: Arc<CaptureStats>,
}

impl Camera {
    /// Open the device and configure it for free-running Mono8 capture.
    ///
    /// The returned camera is `Configured`; its geometry is what the device
    /// reported after configuration.
    #[instrument(skip(session, config))]
    pub fn open(
        session: &DriverSession,
        id: &str,
        config: &CameraConfig,
    ) -> Result<Self, CaptureError> {
        let driver = session.driver();
        let handle = driver.open_camera(id).map_err(|source| CaptureError::Open {
            camera: id.to_string(),
            source,
        })?;
        info!(%handle, "Camera open");

        let geometry = match configure(driver.as_ref(), handle, config) {
            Ok(geometry) => geometry,
            Err(e) => {
                if let Err(close_err) = driver.close_camera(handle) {
                    warn!(error = %close_err, "Failed to close camera after configuration error");
                }
                return Err(e);
            }
        };
        info!(
            width = geometry.width,
            height = geometry.height,
            payload = geometry.payload_size,
            "Camera configured"
        );

        Ok(Self {
            session: session.clone(),
            handle,
            id: id.to_string(),
            config: config.clone(),
            geometry,
            state: CameraState::Configured,
            pool: None,
            queue: Arc::new(ImageQueue::new()),
            stats: Arc::new(CaptureStats::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    /// Negotiated width, height and payload size
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn metrics(&self) -> CaptureMetrics {
        self.stats.snapshot()
    }

    /// Buffer states while capturing
    pub fn pool_census(&self) -> Option<PoolCensus> {
        self.pool.as_ref().map(FramePool::census)
    }

    /// Queue handle for consumers on other threads
    pub fn image_queue(&self) -> Arc<ImageQueue> {
        self.queue.clone()
    }

    /// Announce the buffers, start the engine, queue every buffer and start
    /// acquisition. `hook` runs on the driver thread after each image is
    /// queued.
    #[instrument(skip(self, hook), fields(camera = %self.id))]
    pub fn start_capture(&mut self, hook: Option<FrameHook>) -> Result<(), CaptureError> {
        match self.state {
            CameraState::Configured | CameraState::Stopped => {}
            state => {
                return Err(CaptureError::InvalidState {
                    operation: "start_capture",
                    state,
                })
            }
        }

        let driver = self.session.driver().clone();
        let pool = FramePool::allocate(self.config.buffer_count, &self.geometry)?;

        for descriptor in pool.descriptors() {
            if let Err(e) = driver.announce_frame(self.handle, descriptor) {
                self.revoke(driver.as_ref());
                return Err(CaptureError::driver("announce_frame", e));
            }
        }

        if let Err(e) = driver.capture_start(self.handle) {
            self.revoke(driver.as_ref());
            return Err(CaptureError::driver("capture_start", e));
        }

        let context = Arc::new(DeliveryContext::new(
            self.id.clone(),
            self.handle,
            driver.clone(),
            self.queue.clone(),
            hook,
            pool.home(),
            self.stats.clone(),
        ));

        let mut frames = pool.take_idle().into_iter();
        while let Some(frame) = frames.next() {
            if let Err(e) = context.submit(frame) {
                // Unsubmitted buffers go home first so the unwind can revoke
                for frame in frames {
                    pool.reclaim(frame);
                }
                self.abort_start(driver.as_ref(), &pool);
                return Err(CaptureError::driver("queue_frame", e));
            }
        }

        if let Err(e) = driver.run_command(self.handle, "AcquisitionStart") {
            self.abort_start(driver.as_ref(), &pool);
            return Err(CaptureError::driver("AcquisitionStart", e));
        }

        info!(buffers = pool.len(), "Capture started");
        self.pool = Some(pool);
        self.state = CameraState::Capturing;
        Ok(())
    }

    /// Stop acquisition and take every buffer back from the driver.
    ///
    /// Stopping a camera that is not capturing does nothing.
    #[instrument(skip(self), fields(camera = %self.id))]
    pub fn stop_capture(&mut self) -> Result<(), CaptureError> {
        if self.state != CameraState::Capturing {
            debug!(state = %self.state, "stop_capture ignored, camera not capturing");
            return Ok(());
        }

        let driver = self.session.driver().clone();
        let stop = driver.run_command(self.handle, "AcquisitionStop");

        let result = match self.pool.take() {
            Some(pool) => self.teardown(driver.as_ref(), &pool),
            None => Ok(()),
        };
        self.state = CameraState::Stopped;

        let metrics = self.stats.snapshot();
        info!(
            delivered = metrics.delivered,
            decoded = metrics.decoded,
            dropped = metrics.dropped,
            "Capture stopped"
        );

        stop.map_err(|e| CaptureError::driver("AcquisitionStop", e))?;
        result
    }

    /// Blocking pop of the oldest queued image
    pub fn get_image(&self) -> Result<Image, CaptureError> {
        self.queue.pop().ok_or(CaptureError::QueueClosed)
    }

    pub fn get_image_timeout(&self, timeout: Duration) -> Option<Image> {
        self.queue.pop_timeout(timeout)
    }

    pub fn try_get_image(&self) -> Option<Image> {
        self.queue.try_pop()
    }

    pub async fn get_image_async(&self) -> Result<Image, CaptureError> {
        self.queue.pop_async().await.ok_or(CaptureError::QueueClosed)
    }

    /// Stop if needed and release the device
    pub fn close(mut self) -> Result<(), CaptureError> {
        self.shutdown()
    }

    pub(crate) fn shutdown(&mut self) -> Result<(), CaptureError> {
        if self.state == CameraState::Closed {
            return Ok(());
        }
        let stopped = self.stop_capture();
        self.queue.close();

        let closed = self
            .session
            .driver()
            .close_camera(self.handle)
            .map_err(|e| CaptureError::driver("close_camera", e));
        self.state = CameraState::Closed;
        info!(camera = %self.id, "Camera closed");

        stopped.and(closed)
    }

    /// Flush, end the engine, wait for every buffer and revoke.
    ///
    /// A callback can still be running while this happens. Its resubmission
    /// either lands before the engine ends (caught by the second flush) or
    /// is refused and handed back to the pool.
    fn teardown(&self, driver: &dyn Driver, pool: &FramePool) -> Result<(), CaptureError> {
        let mut first_error = None;
        let mut note = |call: &'static str, result: Result<(), DriverError>| {
            if let Err(e) = result {
                warn!(call, error = %e, "Capture teardown step failed");
                if first_error.is_none() {
                    first_error = Some(CaptureError::driver(call, e));
                }
            }
        };

        note("queue_flush", self.flush(driver, pool));
        note("capture_end", driver.capture_end(self.handle));
        note("queue_flush", self.flush(driver, pool));

        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        if pool.wait_all_idle(timeout) {
            note("revoke_all_frames", driver.revoke_all_frames(self.handle));
        } else {
            // Revoking now would pull buffers out from under the driver
            warn!(
                held = pool.held(),
                buffers = pool.len(),
                "Buffers still out after stop, skipping revoke"
            );
            if first_error.is_none() {
                first_error = Some(CaptureError::BuffersOutstanding {
                    outstanding: pool.len() - pool.held(),
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush(&self, driver: &dyn Driver, pool: &FramePool) -> Result<(), DriverError> {
        let frames = driver.queue_flush(self.handle)?;
        if !frames.is_empty() {
            debug!(count = frames.len(), "Flushed pending frames");
        }
        for frame in frames {
            pool.reclaim(frame);
        }
        Ok(())
    }

    fn abort_start(&self, driver: &dyn Driver, pool: &FramePool) {
        if let Err(e) = self.teardown(driver, pool) {
            warn!(camera = %self.id, error = %e, "Failed to unwind capture start");
        }
    }

    fn revoke(&self, driver: &dyn Driver) {
        if let Err(e) = driver.revoke_all_frames(self.handle) {
            warn!(camera = %self.id, error = %e, "Failed to revoke buffers");
        }
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(camera = %self.id, error = %e, "Camera shutdown failed");
        }
    }
}

/// Apply the capture features, then read back what the device settled on
fn configure(
    driver: &dyn Driver,
    handle: DeviceHandle,
    config: &CameraConfig,
) -> Result<Geometry, CaptureError> {
    if let Some(command) = &config.packet_size_command {
        // GigE-only command; other transports do not know it
        if let Err(e) = driver.run_command(handle, command) {
            warn!(command = %command, error = %e, "Packet size adjustment failed");
        }
    }

    let set_enum = |feature: &'static str, value: &str| {
        driver
            .set_enum(handle, feature, value)
            .map_err(|source| CaptureError::Configure { feature, source })
    };
    set_enum("AcquisitionMode", &config.acquisition_mode)?;
    set_enum("TriggerSource", &config.trigger_source)?;
    set_enum("PixelFormat", config.pixel_format.feature_value())?;

    for (feature, requested) in [("Width", config.width), ("Height", config.height)] {
        if let Some(value) = requested {
            driver
                .set_int(handle, feature, value as i64)
                .map_err(|source| CaptureError::Configure { feature, source })?;
        }
    }

    let get_int = |feature: &'static str| {
        driver
            .get_int(handle, feature)
            .map_err(|source| CaptureError::Configure { feature, source })
    };
    let width = get_int("Width")?;
    let height = get_int("Height")?;
    let payload = get_int("PayloadSize")?;

    let invalid = || CaptureError::InvalidGeometry {
        width,
        height,
        payload,
    };
    Ok(Geometry {
        width: u32::try_from(width).map_err(|_| invalid())?,
        height: u32::try_from(height).map_err(|_| invalid())?,
        payload_size: usize::try_from(payload).map_err(|_| invalid())?,
        pixel_format: config.pixel_format,
    })
}
