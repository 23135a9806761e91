//! YUV422→YUV420 and YUYV→YUV420 chroma resampling (§4.2).
//!
//! Hand-rolled rather than delegated to a SIMD conversion crate: the exact
//! half-up rounding behaviour is a tested property, and a wrapped
//! third-party conversion routine wouldn't let us assert on it directly.

/// Downsample a single 4:2:2 chroma plane (U or V) to 4:2:0 by averaging
/// vertically-adjacent pixel pairs, rounding half-up.
///
/// `src` is `width * height` bytes (stride == width). `dst` must be at
/// least `width * (height / 2)` bytes.
pub fn yuv422_to_yuv420_chroma(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    debug_assert!(src.len() >= width * height);
    let out_height = height / 2;
    debug_assert!(dst.len() >= width * out_height);

    for y in 0..out_height {
        let row0 = &src[(2 * y) * width..(2 * y + 1) * width];
        let row1 = &src[(2 * y + 1) * width..(2 * y + 2) * width];
        let out_row = &mut dst[y * width..(y + 1) * width];
        for x in 0..width {
            out_row[x] = ((row0[x] as u16 + row1[x] as u16 + 1) >> 1) as u8;
        }
    }
}

/// Unpack a YUYV (4:2:2, packed) buffer into planar YUV420P.
///
/// `src_yuyv` rows are `src_row_bytes` wide (>= `width * 2`). For every 2x2
/// luma block the four Y samples are copied straight through; U and V are
/// each the half-up average of the even and odd row's chroma sample for
/// that column pair.
pub fn yuyv_to_yuv420(
    src_yuyv: &[u8],
    dst_y: &mut [u8],
    dst_u: &mut [u8],
    dst_v: &mut [u8],
    width: usize,
    height: usize,
    src_row_bytes: usize,
) {
    debug_assert!(width % 2 == 0 && height % 2 == 0);

    for y in 0..height {
        let row = &src_yuyv[y * src_row_bytes..y * src_row_bytes + width * 2];
        let y_out = &mut dst_y[y * width..(y + 1) * width];
        for x in 0..width / 2 {
            let base = x * 4;
            y_out[x * 2] = row[base];
            y_out[x * 2 + 1] = row[base + 2];
        }
    }

    let out_width = width / 2;
    for y in 0..height / 2 {
        let row0 = &src_yuyv[(2 * y) * src_row_bytes..(2 * y) * src_row_bytes + width * 2];
        let row1 = &src_yuyv[(2 * y + 1) * src_row_bytes..(2 * y + 1) * src_row_bytes + width * 2];
        let u_out = &mut dst_u[y * out_width..(y + 1) * out_width];
        let v_out = &mut dst_v[y * out_width..(y + 1) * out_width];
        for x in 0..out_width {
            let base = x * 4;
            let u0 = row0[base + 1] as u16;
            let u1 = row1[base + 1] as u16;
            let v0 = row0[base + 3] as u16;
            let v1 = row1[base + 3] as u16;
            u_out[x] = ((u0 + u1 + 1) >> 1) as u8;
            v_out[x] = ((v0 + v1 + 1) >> 1) as u8;
        }
    }
}
