//! Pool-allocated raw-pixel frames (§3, §4.1).

use parking_lot::Mutex;
use std::sync::Arc;

use super::format::PixelFormat;

/// A `(offset, len)` view into a `Frame`'s backing buffer. Planes are
/// represented this way rather than as raw aliasing pointers into one
/// allocation (see design notes): the buffer stays a single owned `Vec<u8>`
/// and plane accessors slice it on demand.
type PlaneLayout = (usize, usize);

fn plane_layout(width: u32, height: u32, format: PixelFormat) -> ([PlaneLayout; 3], usize) {
    let w = width as usize;
    let h = height as usize;
    match format {
        PixelFormat::Yuv420p => {
            let y = w * h;
            let c = w * h / 4;
            ([(0, y), (y, c), (y + c, c)], y + 2 * c)
        }
        PixelFormat::Yuv422p => {
            let y = w * h;
            let c = w * h / 2;
            ([(0, y), (y, c), (y + c, c)], y + 2 * c)
        }
        PixelFormat::Nv12 => {
            let y = w * h;
            let uv = w * h / 2;
            ([(0, y), (y, uv), (0, 0)], y + uv)
        }
        PixelFormat::Yuyv => {
            let total = w * h * 2;
            ([(0, total), (0, 0), (0, 0)], total)
        }
        PixelFormat::Rgb24 => {
            let total = w * h * 3;
            ([(0, total), (0, 0), (0, 0)], total)
        }
        PixelFormat::Jpeg => (([(0, 0), (0, 0), (0, 0)]), 0),
    }
}

/// A pool-allocated raw-pixel frame.
///
/// Dropping a `Frame` returns its backing buffer to the `FramePool` it was
/// allocated from (§4.1): the pool is a free-list of plain byte buffers, not
/// of `Frame` handles, so there is no reference cycle between pool and frame.
pub struct Frame {
    buf: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: [PlaneLayout; 3],
    pool: Option<Arc<FramePool>>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn allocated_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Borrow plane `index` (0 = Y/packed, 1/2 = chroma or unused).
    pub fn plane(&self, index: usize) -> &[u8] {
        let (offset, len) = self.planes[index];
        &self.buf[offset..offset + len]
    }

    /// Mutably borrow plane `index`.
    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        let (offset, len) = self.planes[index];
        &mut self.buf[offset..offset + len]
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buf = std::mem::take(&mut self.buf);
            pool.put(buf);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("allocated_bytes", &self.buf.len())
            .finish()
    }
}

/// A free-list of raw frame buffers (§4.1).
///
/// `allocate` returns the most-recently-freed buffer (LIFO, cache-warm) if
/// one is available, ignoring its shape; callers that mix shapes on one
/// pool are responsible for re-checking capacity, or should use one pool
/// per shape as the design notes recommend.
pub struct FramePool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl FramePool {
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_buffers: max_buffers.max(1),
        })
    }

    /// Allocate a frame, rounding `width` up to a multiple of 32 and
    /// `height` up to a multiple of 16 as the encoder requires.
    pub fn allocate(self: &Arc<Self>, width: u32, height: u32, format: PixelFormat) -> Frame {
        let width = width.div_ceil(32) * 32;
        let height = height.div_ceil(16) * 16;
        let (planes, total) = plane_layout(width, height, format);

        let mut buf = self.take(total);
        buf.resize(total, 0);

        Frame {
            buf,
            width,
            height,
            format,
            planes,
            pool: Some(self.clone()),
        }
    }

    /// Explicitly return a frame to the pool. Equivalent to dropping it;
    /// provided so call sites can name the operation the design describes.
    pub fn release(&self, frame: Frame) {
        drop(frame);
    }

    fn take(&self, min_capacity: usize) -> Vec<u8> {
        let mut free = self.free.lock();
        if let Some(mut buf) = free.pop() {
            buf.clear();
            if buf.capacity() < min_capacity {
                buf.reserve(min_capacity - buf.capacity());
            }
            buf
        } else {
            Vec::with_capacity(min_capacity)
        }
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }

    /// Number of buffers currently idle in the free list (for tests/stats).
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_to_encoder_alignment() {
        let pool = FramePool::new(4);
        let frame = pool.allocate(1920, 1080, PixelFormat::Yuv420p);
        assert_eq!(frame.width(), 1920);
        assert_eq!(frame.height(), 1088);
    }

    #[test]
    fn yuv420p_plane_sizes_match_subsampling() {
        let pool = FramePool::new(4);
        let frame = pool.allocate(32, 16, PixelFormat::Yuv420p);
        assert_eq!(frame.plane(0).len(), 32 * 16);
        assert_eq!(frame.plane(1).len(), 32 * 16 / 4);
        assert_eq!(frame.plane(2).len(), 32 * 16 / 4);
    }

    #[test]
    fn release_then_allocate_reuses_same_buffer_lifo() {
        let pool = FramePool::new(4);
        let frame = pool.allocate(32, 16, PixelFormat::Yuv420p);
        let ptr = frame.buf.as_ptr();
        pool.release(frame);
        assert_eq!(pool.idle_count(), 1);

        let frame2 = pool.allocate(32, 16, PixelFormat::Yuv420p);
        assert_eq!(frame2.buf.as_ptr(), ptr);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn pool_caps_idle_buffers_at_max() {
        let pool = FramePool::new(2);
        for _ in 0..5 {
            let frame = pool.allocate(32, 16, PixelFormat::Yuv420p);
            pool.release(frame);
        }
        assert!(pool.idle_count() <= 2);
    }
}
