//! Two free-running cameras delivered as "most recent from each" pairs

pub mod rendezvous;

pub use rendezvous::{FramePair, PairPhase, PairRendezvous, Side};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::capture::{Camera, CameraState, CaptureError, FrameHook};
use crate::driver::DriverSession;
use crate::pipeline::queue::ImageQueue;
use crate::{CameraConfig, StereoConfig};

pub struct StereoCamera {
    left: Camera,
    right: Camera,
    rendezvous: Arc<PairRendezvous>,
    dispatcher: Option<JoinHandle<()>>,
}

impl StereoCamera {
    /// Open both cameras of the pair
    #[instrument(skip(session, camera_config))]
    pub fn open(
        session: &DriverSession,
        left_id: &str,
        right_id: &str,
        camera_config: &CameraConfig,
    ) -> Result<Self, CaptureError> {
        let left = Camera::open(session, left_id, camera_config)?;
        let right = Camera::open(session, right_id, camera_config)?;
        info!("Stereo pair open");

        Ok(Self {
            left,
            right,
            rendezvous: Arc::new(PairRendezvous::new()),
            dispatcher: None,
        })
    }

    pub fn from_config(
        session: &DriverSession,
        stereo: &StereoConfig,
        camera_config: &CameraConfig,
    ) -> Result<Self, CaptureError> {
        Self::open(session, &stereo.left_id, &stereo.right_id, camera_config)
    }

    pub fn left(&self) -> &Camera {
        &self.left
    }

    pub fn right(&self) -> &Camera {
        &self.right
    }

    pub fn phase(&self) -> PairPhase {
        self.rendezvous.phase()
    }

    /// Pair source for consumers on other threads
    pub fn pairs(&self) -> Arc<PairRendezvous> {
        self.rendezvous.clone()
    }

    /// Pairs delivered in the current capture session
    pub fn cycles(&self) -> u64 {
        self.rendezvous.cycles()
    }

    /// Start both cameras; pairs are pulled with [`StereoCamera::next_pair`]
    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        // Leave a running session's pairs and queues untouched
        if self.is_capturing() {
            return Err(CaptureError::InvalidState {
                operation: "start_capture",
                state: CameraState::Capturing,
            });
        }

        self.rendezvous.reset();
        self.left.image_queue().clear();
        self.right.image_queue().clear();

        let left_hook = pair_hook(Side::Left, self.left.image_queue(), self.rendezvous.clone());
        let right_hook = pair_hook(Side::Right, self.right.image_queue(), self.rendezvous.clone());

        self.left.start_capture(Some(left_hook))?;
        if let Err(e) = self.right.start_capture(Some(right_hook)) {
            if let Err(stop_err) = self.left.stop_capture() {
                warn!(error = %stop_err, "Failed to stop left camera after start failure");
            }
            return Err(e);
        }
        info!("Stereo capture started");
        Ok(())
    }

    /// Start both cameras and call `on_pair` once per completed pair from a
    /// dedicated thread
    pub fn start_capture_with<F>(&mut self, mut on_pair: F) -> Result<(), CaptureError>
    where
        F: FnMut(FramePair) + Send + 'static,
    {
        self.start_capture()?;

        let rendezvous = self.rendezvous.clone();
        let spawned = thread::Builder::new()
            .name("stereo-pairs".into())
            .spawn(move || {
                while let Some(pair) = rendezvous.wait_pair() {
                    on_pair(pair);
                }
            });

        match spawned {
            Ok(handle) => {
                self.dispatcher = Some(handle);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = self.stop_capture() {
                    warn!(error = %stop_err, "Failed to stop after dispatcher spawn failure");
                }
                Err(CaptureError::Spawn(e))
            }
        }
    }

    /// Block until both cameras have posted in this cycle
    pub fn next_pair(&self) -> Option<FramePair> {
        self.rendezvous.wait_pair()
    }

    pub fn next_pair_timeout(&self, timeout: Duration) -> Option<FramePair> {
        self.rendezvous.wait_pair_timeout(timeout)
    }

    /// Stop pairing and both cameras. A no-op when not capturing.
    pub fn stop_capture(&mut self) -> Result<(), CaptureError> {
        self.rendezvous.close();
        if !self.is_capturing() {
            return Ok(());
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("Pair callback panicked");
            }
        }

        let left = self.left.stop_capture();
        let right = self.right.stop_capture();
        info!(pairs = self.rendezvous.cycles(), "Stereo capture stopped");
        left.and(right)
    }

    /// Either camera capturing or a pair dispatcher still running
    fn is_capturing(&self) -> bool {
        self.dispatcher.is_some()
            || [&self.left, &self.right]
                .iter()
                .any(|camera| camera.state() == CameraState::Capturing)
    }

    pub fn close(mut self) -> Result<(), CaptureError> {
        let stopped = self.stop_capture();
        let left = self.left.shutdown();
        let right = self.right.shutdown();
        stopped.and(left).and(right)
    }
}

impl Drop for StereoCamera {
    fn drop(&mut self) {
        if let Err(e) = self.stop_capture() {
            warn!(error = %e, "Stereo shutdown failed");
        }
    }
}

/// Delivery hook moving the newest queued image into this side's cell
fn pair_hook(side: Side, queue: Arc<ImageQueue>, rendezvous: Arc<PairRendezvous>) -> FrameHook {
    Arc::new(move || {
        if let Some(image) = std::iter::from_fn(|| queue.try_pop()).last() {
            rendezvous.post(side, image);
        }
    })
}
