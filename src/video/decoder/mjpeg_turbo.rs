//! JPEG/MJPEG decoding via libjpeg-turbo, producing pool-allocated frames (§4.3).

use std::sync::Arc;
use turbojpeg::{Decompressor, Subsamp, YuvImage};

use crate::error::{PipelineError, Result};
use crate::video::chroma::yuv422_to_yuv420_chroma;
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::{Frame, FramePool};

/// Decodes MJPEG/JPEG input into pool-allocated YUV420P frames.
///
/// Decodes straight to planar YUV via libjpeg-turbo rather than going
/// through RGB: 4:2:0 sources land directly in the output layout, and
/// 4:2:2 sources land in a scratch YUV422 buffer that's then resampled
/// down to 4:2:0 one chroma plane at a time (§4.2). Any other subsampling
/// (4:4:4, grayscale, ...) isn't something the capture path is expected
/// to produce and is rejected rather than guessed at.
pub struct JpegDecoder {
    decompressor: Decompressor,
    scratch_yuv: Vec<u8>,
    scratch_chroma: Vec<u8>,
}

impl JpegDecoder {
    pub fn new() -> Result<Self> {
        let decompressor = Decompressor::new()
            .map_err(|e| PipelineError::TransientDecode(format!("turbojpeg init: {e}")))?;
        Ok(Self { decompressor, scratch_yuv: Vec::new(), scratch_chroma: Vec::new() })
    }

    /// Decode one JPEG frame into a pool-allocated YUV420P frame.
    pub fn decode(&mut self, jpeg: &[u8], pool: &Arc<FramePool>) -> Result<Frame> {
        let header = self
            .decompressor
            .read_header(jpeg)
            .map_err(|e| PipelineError::TransientDecode(format!("read_header: {e}")))?;

        let width = header.width;
        let height = header.height;
        let resolution = Resolution::new(width as u32, height as u32);

        match header.subsamp {
            Subsamp::Sub2x2 => self.decode_420(jpeg, width, height, pool, resolution),
            Subsamp::Sub2x1 => self.decode_422(jpeg, width, height, pool, resolution),
            other => Err(PipelineError::TransientDecode(format!("unsupported JPEG subsampling: {other:?}")).into()),
        }
    }

    fn decode_420(
        &mut self,
        jpeg: &[u8],
        width: usize,
        height: usize,
        pool: &Arc<FramePool>,
        resolution: Resolution,
    ) -> Result<Frame> {
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        let needed = width * height + 2 * chroma_w * chroma_h;
        if self.scratch_yuv.len() < needed {
            self.scratch_yuv.resize(needed, 0);
        }

        {
            let image = YuvImage {
                pixels: &mut self.scratch_yuv[..needed],
                width,
                align: 1,
                height,
                subsamp: Subsamp::Sub2x2,
            };
            self.decompressor
                .decompress_to_yuv(jpeg, image)
                .map_err(|e| PipelineError::TransientDecode(format!("decompress_to_yuv: {e}")))?;
        }

        let y_len = width * height;
        let c_len = chroma_w * chroma_h;

        let mut frame = pool.allocate(resolution.width, resolution.height, PixelFormat::Yuv420p);
        copy_plane(&self.scratch_yuv[..y_len], width, height, frame.plane_mut(0), frame_chroma_stride(&frame, true));
        copy_plane(
            &self.scratch_yuv[y_len..y_len + c_len],
            chroma_w,
            chroma_h,
            frame.plane_mut(1),
            frame_chroma_stride(&frame, false),
        );
        copy_plane(
            &self.scratch_yuv[y_len + c_len..y_len + 2 * c_len],
            chroma_w,
            chroma_h,
            frame.plane_mut(2),
            frame_chroma_stride(&frame, false),
        );
        Ok(frame)
    }

    fn decode_422(
        &mut self,
        jpeg: &[u8],
        width: usize,
        height: usize,
        pool: &Arc<FramePool>,
        resolution: Resolution,
    ) -> Result<Frame> {
        debug_assert!(height % 2 == 0, "odd-height 4:2:2 capture not expected");

        let chroma_w = width.div_ceil(2);
        let needed = width * height + 2 * chroma_w * height;
        if self.scratch_yuv.len() < needed {
            self.scratch_yuv.resize(needed, 0);
        }

        {
            let image = YuvImage {
                pixels: &mut self.scratch_yuv[..needed],
                width,
                align: 1,
                height,
                subsamp: Subsamp::Sub2x1,
            };
            self.decompressor
                .decompress_to_yuv(jpeg, image)
                .map_err(|e| PipelineError::TransientDecode(format!("decompress_to_yuv: {e}")))?;
        }

        let y_len = width * height;
        let c_len = chroma_w * height;
        let resampled_h = height / 2;
        let resampled_len = chroma_w * resampled_h;
        if self.scratch_chroma.len() < resampled_len {
            self.scratch_chroma.resize(resampled_len, 0);
        }

        let mut frame = pool.allocate(resolution.width, resolution.height, PixelFormat::Yuv420p);
        copy_plane(&self.scratch_yuv[..y_len], width, height, frame.plane_mut(0), frame_chroma_stride(&frame, true));

        for (plane_index, src_offset) in [(1usize, y_len), (2usize, y_len + c_len)] {
            yuv422_to_yuv420_chroma(
                &self.scratch_yuv[src_offset..src_offset + c_len],
                &mut self.scratch_chroma[..resampled_len],
                chroma_w,
                height,
            );
            copy_plane(
                &self.scratch_chroma[..resampled_len],
                chroma_w,
                resampled_h,
                frame.plane_mut(plane_index),
                frame_chroma_stride(&frame, false),
            );
        }
        Ok(frame)
    }
}

/// Stride of `frame`'s luma (`luma = true`) or chroma plane, in bytes.
/// The pool rounds allocation width/height up to the encoder's macroblock
/// alignment, so this can be wider than the JPEG's own natural dimensions.
fn frame_chroma_stride(frame: &Frame, luma: bool) -> usize {
    if luma {
        frame.width() as usize
    } else {
        frame.width() as usize / 2
    }
}

/// Copy a tightly-packed `src_width * src_height` plane into `dst`, whose
/// rows are `dst_stride` bytes apart (`dst_stride >= src_width`).
fn copy_plane(src: &[u8], src_width: usize, src_height: usize, dst: &mut [u8], dst_stride: usize) {
    for row in 0..src_height {
        let s = &src[row * src_width..(row + 1) * src_width];
        let d = &mut dst[row * dst_stride..row * dst_stride + src_width];
        d.copy_from_slice(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_plane_preserves_rows_across_wider_stride() {
        let src = [1u8, 2, 3, 4]; // 2x2, tightly packed
        let mut dst = vec![0u8; 2 * 4]; // stride 4, 2 rows
        copy_plane(&src, 2, 2, &mut dst, 4);
        assert_eq!(&dst[0..2], &[1, 2]);
        assert_eq!(&dst[4..6], &[3, 4]);
        assert_eq!(&dst[2..4], &[0, 0]);
    }
}
