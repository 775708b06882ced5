//! Frame types handed from the source stream to the producer.
//!
//! A [`Frame`] is an immutable snapshot of one PipeWire buffer. It owns
//! every resource it references: DMA-BUF plane fds are dup'ed out of the
//! PipeWire buffer and closed when the frame drops, MemFd payloads are
//! mapped with an unmap-on-drop guard, MemPtr payloads are copied.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::format::PixelFormat;

/// A numerator/denominator framerate, e.g. `{60, 1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    /// Frames per second, rounded up so a `{30000, 1001}` source still
    /// gets a gop sized for 30.
    pub fn ceil(self) -> u32 {
        if self.denom == 0 {
            return 0;
        }
        self.num.div_ceil(self.denom)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Fraction::new(60, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One plane of a DMA-BUF. The fd is owned and closed on drop.
#[derive(Debug)]
pub struct DmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Everything needed to import or re-export a DMA-BUF frame.
#[derive(Debug)]
pub struct DmaBufAttributes {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub modifier: u64,
    /// Never empty.
    pub planes: Vec<DmaBufPlane>,
}

impl DmaBufAttributes {
    pub fn first_plane_fd(&self) -> i32 {
        self.planes[0].fd.as_raw_fd()
    }
}

/// An mmap'ed MemFd region, unmapped on drop.
pub struct MappedRegion {
    ptr: *mut libc::c_void,
    len: usize,
    offset: usize,
}

// The mapping is plain readable memory with no thread affinity.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` readable bytes of `fd`. `offset` is the chunk offset
    /// into the mapping, kept separate because mmap offsets must be
    /// page-aligned while chunk offsets need not be.
    pub fn map(fd: i32, len: usize, offset: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len + offset,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self { ptr, len, offset })
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts((self.ptr as *const u8).add(self.offset), self.len)
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len + self.offset);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}

/// CPU-visible pixel data, either mapped from a MemFd or copied out of a
/// MemPtr buffer.
#[derive(Debug)]
pub enum CpuBuffer {
    Mapped(MappedRegion),
    Owned(Vec<u8>),
}

impl CpuBuffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            CpuBuffer::Mapped(m) => m.bytes(),
            CpuBuffer::Owned(v) => v,
        }
    }
}

#[derive(Debug)]
pub struct CpuImage {
    pub data: CpuBuffer,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Exactly one payload per frame.
#[derive(Debug)]
pub enum FramePayload {
    DmaBuf(DmaBufAttributes),
    CpuMapped(CpuImage),
    /// The buffer chunk was flagged corrupted; carried so the drop is
    /// observable, never encoded.
    Corrupt,
}

/// Cursor bitmap as delivered in the cursor metadata, repacked into an
/// owned tightly-strided RGBA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorBitmap {
    pub width: u32,
    pub height: u32,
    pub hotspot: (i32, i32),
    /// RGBA, `width * 4` stride.
    pub data: Vec<u8>,
}

/// Per-frame cursor metadata. `bitmap` is only present when the cursor
/// image changed since the last frame that carried one.
#[derive(Debug, Clone)]
pub struct FrameCursor {
    pub position: Option<(i32, i32)>,
    pub hotspot: (i32, i32),
    pub bitmap: Option<CursorBitmap>,
}

#[derive(Debug)]
pub struct Frame {
    pub format: PixelFormat,
    pub sequence: Option<u64>,
    /// Presentation timestamp in nanoseconds. Filled from the header
    /// meta, or from the monotonic clock when the source sends none.
    pub presentation_timestamp: Option<i64>,
    pub payload: FramePayload,
    /// Union of the damage regions, when the source reports them.
    pub damage: Option<Vec<Rect>>,
    pub cursor: Option<FrameCursor>,
}

impl Frame {
    pub fn size(&self) -> Option<(u32, u32)> {
        match &self.payload {
            FramePayload::DmaBuf(attrs) => Some((attrs.width, attrs.height)),
            FramePayload::CpuMapped(img) => Some((img.width, img.height)),
            FramePayload::Corrupt => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self.payload, FramePayload::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{FromRawFd, IntoRawFd};

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn fd_is_open(fd: i32) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn dropping_frame_closes_plane_fds() {
        let (r, w) = pipe_fds();
        let raw_r = r.as_raw_fd();
        let raw_w = w.as_raw_fd();
        let frame = Frame {
            format: PixelFormat::Bgra,
            sequence: None,
            presentation_timestamp: None,
            payload: FramePayload::DmaBuf(DmaBufAttributes {
                width: 16,
                height: 16,
                format: PixelFormat::Bgra,
                modifier: 0,
                planes: vec![
                    DmaBufPlane { fd: r, offset: 0, stride: 64 },
                    DmaBufPlane { fd: w, offset: 0, stride: 64 },
                ],
            }),
            damage: None,
            cursor: None,
        };
        assert!(fd_is_open(raw_r));
        assert!(fd_is_open(raw_w));
        drop(frame);
        assert!(!fd_is_open(raw_r));
        assert!(!fd_is_open(raw_w));
    }

    #[test]
    fn mapped_region_unmaps_on_drop() {
        let fd = unsafe { libc::memfd_create(c"pipecast-test".as_ptr(), 0) };
        assert!(fd >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        assert_eq!(unsafe { libc::ftruncate(fd.as_raw_fd(), 4096) }, 0);
        let payload = [0xabu8; 16];
        let written = unsafe {
            libc::pwrite(fd.as_raw_fd(), payload.as_ptr().cast(), payload.len(), 0)
        };
        assert_eq!(written, 16);

        let region = MappedRegion::map(fd.as_raw_fd(), 16, 0).unwrap();
        assert_eq!(region.bytes(), &payload);
        drop(region);
        drop(fd);
    }

    #[test]
    fn zero_length_map_is_rejected() {
        let (r, _w) = pipe_fds();
        assert!(MappedRegion::map(r.into_raw_fd(), 0, 0).is_none());
    }

    #[test]
    fn fraction_ceils_ntsc_rates() {
        assert_eq!(Fraction::new(30000, 1001).ceil(), 30);
        assert_eq!(Fraction::new(60, 1).ceil(), 60);
        assert_eq!(Fraction::new(5, 2).ceil(), 3);
        assert_eq!(Fraction::new(1, 0).ceil(), 0);
    }

    #[test]
    fn corrupt_frame_has_no_size() {
        let frame = Frame {
            format: PixelFormat::Rgba,
            sequence: Some(7),
            presentation_timestamp: Some(1),
            payload: FramePayload::Corrupt,
            damage: None,
            cursor: None,
        };
        assert!(frame.is_corrupt());
        assert_eq!(frame.size(), None);
    }
}
