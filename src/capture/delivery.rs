//! Completion handler the driver runs for every filled buffer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::{debug, trace, warn};

use super::decoder::decode_frame;
use super::frame::Frame;
use super::pool::{FrameHome, SlotState};
use crate::driver::{DeviceHandle, Driver, DriverError, FrameCallback, Rejected};
use crate::pipeline::queue::ImageQueue;
use crate::CaptureMetrics;

/// Consumer notification, run on the driver thread after each queued image
pub type FrameHook = Arc<dyn Fn() + Send + Sync>;

/// Delivery counters for one camera
#[derive(Default)]
pub(crate) struct CaptureStats {
    delivered: CachePadded<AtomicU64>,
    decoded: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    requeued: CachePadded<AtomicU64>,
    requeue_rejected: CachePadded<AtomicU64>,
}

impl CaptureStats {
    pub(crate) fn snapshot(&self) -> CaptureMetrics {
        CaptureMetrics {
            delivered: self.delivered.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            requeue_rejected: self.requeue_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Everything the completion handler needs, registered with each
/// submission instead of being reached through the camera.
pub(crate) struct DeliveryContext {
    camera_id: String,
    handle: DeviceHandle,
    driver: Arc<dyn Driver>,
    queue: Arc<ImageQueue>,
    hook: Option<FrameHook>,
    home: Arc<FrameHome>,
    stats: Arc<CaptureStats>,
}

impl DeliveryContext {
    pub(crate) fn new(
        camera_id: String,
        handle: DeviceHandle,
        driver: Arc<dyn Driver>,
        queue: Arc<ImageQueue>,
        hook: Option<FrameHook>,
        home: Arc<FrameHome>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            camera_id,
            handle,
            driver,
            queue,
            hook,
            home,
            stats,
        }
    }

    /// Hand a buffer to the driver's pending-frame queue.
    ///
    /// A refused buffer goes back to the pool so it is never lost.
    pub(crate) fn submit(self: &Arc<Self>, frame: Frame) -> Result<(), DriverError> {
        frame.mark(SlotState::Queued);
        let callback: Arc<dyn FrameCallback> = self.clone();
        self.driver
            .queue_frame(self.handle, frame, callback)
            .map_err(|Rejected { frame, error }| {
                debug!(
                    camera = %self.camera_id,
                    slot = frame.slot(),
                    error = %error,
                    "Driver refused buffer, returning it to the pool"
                );
                self.home.put(frame);
                error
            })
    }

    fn count(&self, counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(name, "camera" => self.camera_id.clone()).increment(1);
    }
}

impl FrameCallback for DeliveryContext {
    fn frame_done(self: Arc<Self>, handle: DeviceHandle, frame: Frame) {
        if handle != self.handle {
            warn!(
                camera = %self.camera_id,
                expected = %self.handle,
                got = %handle,
                "Frame delivered for a different device"
            );
        }

        frame.mark(SlotState::Delivered);
        self.count(&self.stats.delivered, "stereocam_frames_delivered_total");

        // The image is an owned copy, so the buffer is free to go back
        match decode_frame(&frame) {
            Ok(image) => {
                trace!(camera = %self.camera_id, frame_id = image.frame_id(), "Frame decoded");
                if self.queue.push(image) {
                    self.count(&self.stats.decoded, "stereocam_frames_decoded_total");
                    if let Some(hook) = &self.hook {
                        hook();
                    }
                } else {
                    debug!(camera = %self.camera_id, "Image queue closed, frame dropped");
                    self.count(&self.stats.dropped, "stereocam_frames_dropped_total");
                }
            }
            Err(e) => {
                debug!(
                    camera = %self.camera_id,
                    frame_id = frame.meta.frame_id,
                    error = %e,
                    "Frame dropped"
                );
                self.count(&self.stats.dropped, "stereocam_frames_dropped_total");
            }
        }

        if self.submit(frame).is_ok() {
            self.count(&self.stats.requeued, "stereocam_frames_requeued_total");
        } else {
            self.count(
                &self.stats.requeue_rejected,
                "stereocam_requeue_rejected_total",
            );
        }
    }
}
