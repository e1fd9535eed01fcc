use std::fmt;
use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use super::pool::{SlotLedger, SlotState};

/// Raw buffer registered with the driver, plus what the driver reported
/// about its last fill.
///
/// Move-only: whoever holds the value is the only party allowed to touch
/// the buffer.
pub struct Frame {
    buffer: Box<[u8]>,
    slot: usize,
    ledger: Arc<SlotLedger>,

    /// Filled in by the driver on completion
    pub meta: FrameMetadata,
}

/// Frame metadata reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub receive_status: ReceiveStatus,
    /// Bytes of image data actually written into the buffer
    pub image_size: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_id: u64,
    /// Device timestamp in nanoseconds
    pub timestamp: u64,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            receive_status: ReceiveStatus::Complete,
            image_size: 0,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Mono8,
            frame_id: 0,
            timestamp: 0,
        }
    }
}

/// Outcome of a transfer as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Complete,
    Incomplete,
    TooSmall,
    Invalid,
    Other(i32),
}

impl ReceiveStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Complete,
            -1 => Self::Incomplete,
            -2 => Self::TooSmall,
            -3 => Self::Invalid,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Incomplete => -1,
            Self::TooSmall => -2,
            Self::Invalid => -3,
            Self::Other(code) => code,
        }
    }

    pub fn is_complete(self) -> bool {
        self.code() == 0
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
}

impl PixelFormat {
    /// Value of the `PixelFormat` enumeration feature
    pub fn feature_value(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
        }
    }
}

/// Negotiated image layout, read back from the device after configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub payload_size: usize,
    pub pixel_format: PixelFormat,
}

impl Geometry {
    /// Bytes needed for one image without padding or chunk data
    pub fn image_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.pixel_format.bytes_per_pixel())
    }
}

impl Frame {
    pub(crate) fn new(buffer: Box<[u8]>, slot: usize, ledger: Arc<SlotLedger>) -> Self {
        Self {
            buffer,
            slot,
            ledger,
            meta: FrameMetadata::default(),
        }
    }

    /// Index of this buffer within its pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Allocated size of the buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Whole buffer, regardless of how much the driver wrote
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes the driver declared as written, clamped to the allocation
    pub fn payload(&self) -> &[u8] {
        let len = (self.meta.image_size as usize).min(self.buffer.len());
        &self.buffer[..len]
    }

    /// Driver-side access for filling the buffer
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub(crate) fn mark(&self, state: SlotState) {
        self.ledger.set(self.slot, state);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.slot)
            .field("capacity", &self.buffer.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Decoded, immutable single-channel image
///
/// Clones share the pixel storage.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<GrayImage>,
    frame_id: u64,
    timestamp: u64,
}

impl Image {
    pub fn new(pixels: GrayImage, frame_id: u64, timestamp: u64) -> Self {
        Self {
            pixels: Arc::new(pixels),
            frame_id,
            timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.pixels.width() as usize
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels.get_pixel(x, y).0[0]
    }

    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
