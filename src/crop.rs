//! Region cropping for captured frames.
//!
//! `crop_frame` copies a sub-rectangle of a borrowed frame into a buffer owned
//! by the caller. The returned `CroppedFrame` is released exactly once, either
//! by `free_cropped_frame` or by going out of scope.

use crate::capture::{FrameData, PixelFormat, Rect};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CropError {
    #[error("Crop region {region:?} is empty")]
    EmptyRegion { region: Rect },
    #[error("Crop region {region:?} lies outside the {width}x{height} source frame")]
    OutOfBounds { region: Rect, width: u32, height: u32 },
    #[error("Cropping {0:?} frames is not supported")]
    UnsupportedFormat(PixelFormat),
    #[error("Source buffer holds {actual} bytes but the frame needs {required}")]
    SourceTooSmall { actual: usize, required: usize },
    #[error("Failed to allocate {0} bytes for the cropped frame")]
    Allocation(usize),
}

/// Frame produced by `crop_frame`; owns its pixel buffer.
#[derive(Debug)]
pub struct CroppedFrame {
    data: Vec<u8>,
    stride: usize,
    width: u32,
    height: u32,
    timestamp: i64,
    format: PixelFormat,
}

impl CroppedFrame {
    /// Borrow as a regular frame descriptor.
    pub fn as_frame(&self) -> FrameData<'_> {
        FrameData::new(
            &self.data,
            self.stride,
            self.width,
            self.height,
            self.timestamp,
            self.format,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Whether `region` is non-empty and fully inside a `width` x `height` frame.
pub fn is_valid_region(region: &Rect, width: u32, height: u32) -> bool {
    !region.is_empty()
        && region.x >= 0
        && region.y >= 0
        && region.right() <= width as i64
        && region.bottom() <= height as i64
}

/// Copy `region` out of `source` into a newly allocated, tightly packed buffer.
pub fn crop_frame(source: &FrameData<'_>, region: Rect) -> Result<CroppedFrame, CropError> {
    if region.is_empty() {
        return Err(CropError::EmptyRegion { region });
    }
    if !is_valid_region(&region, source.width, source.height) {
        return Err(CropError::OutOfBounds {
            region,
            width: source.width,
            height: source.height,
        });
    }
    let bpp = source
        .format
        .bytes_per_pixel()
        .ok_or(CropError::UnsupportedFormat(source.format))?;

    let src_row_offset = region.x as usize * bpp;
    let dst_stride = region.width as usize * bpp;
    let last_row = region.y as usize + region.height as usize - 1;
    let required = last_row * source.stride + src_row_offset + dst_stride;
    if source.data.len() < required {
        return Err(CropError::SourceTooSmall {
            actual: source.data.len(),
            required,
        });
    }

    let size = dst_stride * region.height as usize;
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| CropError::Allocation(size))?;

    for row in 0..region.height as usize {
        let start = (region.y as usize + row) * source.stride + src_row_offset;
        data.extend_from_slice(&source.data[start..start + dst_stride]);
    }

    log::trace!(target: "screenrec::crop", "Cropped {:?} from {}x{}", region, source.width, source.height);

    Ok(CroppedFrame {
        data,
        stride: dst_stride,
        width: region.width,
        height: region.height,
        timestamp: source.timestamp,
        format: source.format,
    })
}

/// Release a buffer returned by `crop_frame`.
pub fn free_cropped_frame(frame: CroppedFrame) {
    drop(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// W x H BGRA frame where every byte encodes its own position.
    fn patterned(width: u32, height: u32, stride: usize) -> Vec<u8> {
        let mut data = vec![0u8; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..stride {
                data[y * stride + x] = ((y * 31 + x * 7) % 251) as u8;
            }
        }
        data
    }

    #[test]
    fn test_crop_rows_match_source() {
        let (w, h) = (64u32, 48u32);
        let stride = w as usize * 4;
        let data = patterned(w, h, stride);
        let source = FrameData::new(&data, stride, w, h, 1234, PixelFormat::Bgra32);
        let region = Rect::new(10, 5, 20, 12);

        let cropped = crop_frame(&source, region).unwrap();
        assert_eq!(cropped.len(), 20 * 12 * 4);
        assert_eq!(cropped.width(), 20);

        let frame = cropped.as_frame();
        assert_eq!(frame.timestamp, 1234);
        for r in 0..12u32 {
            let src_row = source.row(5 + r).unwrap();
            assert_eq!(frame.row(r).unwrap(), &src_row[10 * 4..10 * 4 + 20 * 4]);
        }
        free_cropped_frame(cropped);
    }

    #[test]
    fn test_crop_honors_padded_stride() {
        let (w, h) = (8u32, 4u32);
        let stride = w as usize * 4 + 16;
        let data = patterned(w, h, stride);
        let source = FrameData::new(&data, stride, w, h, 0, PixelFormat::Rgba32);

        let cropped = crop_frame(&source, Rect::new(2, 1, 6, 3)).unwrap();
        let frame = cropped.as_frame();
        assert_eq!(frame.stride, 24);
        assert_eq!(frame.row(2).unwrap(), &data[3 * stride + 8..3 * stride + 32]);
    }

    #[test]
    fn test_full_frame_crop_is_identity() {
        let data = patterned(4, 4, 16);
        let source = FrameData::new(&data, 16, 4, 4, 0, PixelFormat::Bgra32);
        let cropped = crop_frame(&source, Rect::new(0, 0, 4, 4)).unwrap();
        assert_eq!(cropped.into_inner(), data);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let data = patterned(16, 16, 64);
        let source = FrameData::new(&data, 64, 16, 16, 0, PixelFormat::Bgra32);

        for region in [
            Rect::new(10, 0, 8, 4),
            Rect::new(0, 14, 4, 4),
            Rect::new(-1, 0, 4, 4),
            Rect::new(20, 20, 2, 2),
        ] {
            assert!(matches!(
                crop_frame(&source, region),
                Err(CropError::OutOfBounds { .. })
            ));
        }
        assert!(matches!(
            crop_frame(&source, Rect::new(0, 0, 0, 4)),
            Err(CropError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn test_nv12_not_supported() {
        let data = vec![0u8; 16 * 16 * 3 / 2];
        let source = FrameData::new(&data, 16, 16, 16, 0, PixelFormat::Nv12);
        assert_eq!(
            crop_frame(&source, Rect::new(0, 0, 8, 8)).unwrap_err(),
            CropError::UnsupportedFormat(PixelFormat::Nv12)
        );
    }

    #[test]
    fn test_short_source_buffer_rejected() {
        let data = vec![0u8; 100];
        let source = FrameData::new(&data, 64, 16, 16, 0, PixelFormat::Bgra32);
        assert!(matches!(
            crop_frame(&source, Rect::new(0, 0, 16, 16)),
            Err(CropError::SourceTooSmall { .. })
        ));
    }
}
