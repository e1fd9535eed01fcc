use image::GrayImage;
use thiserror::Error;

use super::frame::{Frame, Image, PixelFormat, ReceiveStatus};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame not received cleanly ({0:?})")]
    Receive(ReceiveStatus),
    #[error("frame declares an empty {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },
    #[error("frame declares a {width}x{height} image too large to address")]
    OversizedImage { width: u32, height: u32 },
    #[error("frame needs {needed} bytes but only {available} were written")]
    Truncated { needed: usize, available: usize },
}

/// Copy a filled buffer into an owned image.
///
/// Reads at most the number of bytes the driver declared as written. The
/// buffer can be resubmitted as soon as this returns.
pub fn decode_frame(frame: &Frame) -> Result<Image, DecodeError> {
    let meta = &frame.meta;
    if !meta.receive_status.is_complete() {
        return Err(DecodeError::Receive(meta.receive_status));
    }

    let (width, height) = (meta.width, meta.height);
    if width == 0 || height == 0 {
        return Err(DecodeError::EmptyImage { width, height });
    }

    let payload = frame.payload();
    let needed = match meta.pixel_format {
        PixelFormat::Mono8 => (width as usize).checked_mul(height as usize),
    }
    .ok_or(DecodeError::OversizedImage { width, height })?;

    if needed > payload.len() {
        return Err(DecodeError::Truncated {
            needed,
            available: payload.len(),
        });
    }

    let pixels = GrayImage::from_raw(width, height, payload[..needed].to_vec()).ok_or(
        DecodeError::Truncated {
            needed,
            available: payload.len(),
        },
    )?;

    Ok(Image::new(pixels, meta.frame_id, meta.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Geometry;
    use crate::capture::pool::FramePool;

    fn filled_frame(width: u32, height: u32, image_size: u32) -> Frame {
        let geometry = Geometry {
            width: 10,
            height: 10,
            payload_size: 100,
            pixel_format: PixelFormat::Mono8,
        };
        let pool = FramePool::allocate(1, &geometry).unwrap();
        let mut frame = pool.take_idle().pop().unwrap();
        for (i, byte) in frame.buffer_mut().iter_mut().enumerate() {
            *byte = i as u8;
        }
        frame.meta.width = width;
        frame.meta.height = height;
        frame.meta.image_size = image_size;
        frame.meta.frame_id = 5;
        frame
    }

    #[test]
    fn decodes_row_major_mono8() {
        let image = decode_frame(&filled_frame(10, 10, 100)).unwrap();
        assert_eq!((image.width(), image.height()), (10, 10));
        assert_eq!(image.pixel(3, 2), 23);
        assert_eq!(image.frame_id(), 5);
    }

    #[test]
    fn skips_incomplete_frames() {
        let mut frame = filled_frame(10, 10, 100);
        frame.meta.receive_status = ReceiveStatus::Incomplete;
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::Receive(ReceiveStatus::Incomplete))
        ));
    }

    #[test]
    fn never_reads_past_declared_size() {
        // 100 bytes allocated but only 50 declared as written
        let frame = filled_frame(10, 10, 50);
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::Truncated {
                needed: 100,
                available: 50
            })
        ));

        // Declared size beyond the allocation is clamped
        let frame = filled_frame(20, 10, 400);
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::Truncated {
                needed: 200,
                available: 100
            })
        ));
    }

    #[test]
    fn huge_geometry_never_reads_past_the_buffer() {
        let frame = filled_frame(u32::MAX, u32::MAX, 100);
        let err = decode_frame(&frame).unwrap_err();

        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            err,
            DecodeError::Truncated { needed, available: 100 }
                if needed == u32::MAX as usize * u32::MAX as usize
        ));
        #[cfg(not(target_pointer_width = "64"))]
        assert!(matches!(
            err,
            DecodeError::OversizedImage {
                width: u32::MAX,
                height: u32::MAX
            }
        ));
    }

    #[test]
    fn rejects_empty_geometry() {
        assert!(matches!(
            decode_frame(&filled_frame(0, 10, 100)),
            Err(DecodeError::EmptyImage { .. })
        ));
    }
}
