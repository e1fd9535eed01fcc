pub mod camera;
pub mod decoder;
pub mod delivery;
pub mod frame;
pub mod pool;

pub use camera::{Camera, CameraState};
pub use delivery::FrameHook;
pub use frame::{Frame, FrameMetadata, Geometry, Image, PixelFormat, ReceiveStatus};
pub use pool::{FramePool, PoolCensus, PoolError};

use thiserror::Error;

use crate::driver::DriverError;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera {camera}")]
    Open {
        camera: String,
        #[source]
        source: DriverError,
    },
    #[error("failed to configure feature {feature}")]
    Configure {
        feature: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("device reported an unusable geometry {width}x{height} with payload {payload}")]
    InvalidGeometry { width: i64, height: i64, payload: i64 },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("{call} failed")]
    Driver {
        call: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CameraState,
    },
    #[error("{outstanding} buffers were not returned by the driver")]
    BuffersOutstanding { outstanding: usize },
    #[error("image queue closed")]
    QueueClosed,
    #[error("failed to spawn pair dispatcher")]
    Spawn(#[source] std::io::Error),
}

impl CaptureError {
    pub(crate) fn driver(call: &'static str, source: DriverError) -> Self {
        CaptureError::Driver { call, source }
    }
}
