//! Pixel format conversion tables: SPA video formats, DRM fourccs and
//! libav pixel formats describe the same byte layouts under different
//! names, and every component of the pipeline speaks a different one.

use drm_fourcc::DrmFourcc;
use ffmpeg_next::ffi::AVPixelFormat;
use libspa::param::video::VideoFormat;

/// Video formats the pipeline negotiates and carries on frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgbx,
    Bgrx,
    Rgb,
    Bgr,
    Xbgr,
    Abgr,
    Gray8,
    Yuy2,
}

impl PixelFormat {
    /// Formats offered during negotiation, most preferred first.
    pub const NEGOTIATION_ORDER: &'static [PixelFormat] = &[
        PixelFormat::Rgbx,
        PixelFormat::Rgba,
        PixelFormat::Bgrx,
        PixelFormat::Bgra,
        PixelFormat::Rgb,
        PixelFormat::Bgr,
        PixelFormat::Xbgr,
        PixelFormat::Abgr,
        PixelFormat::Gray8,
    ];

    pub fn to_spa(self) -> VideoFormat {
        match self {
            PixelFormat::Rgba => VideoFormat::RGBA,
            PixelFormat::Bgra => VideoFormat::BGRA,
            PixelFormat::Rgbx => VideoFormat::RGBx,
            PixelFormat::Bgrx => VideoFormat::BGRx,
            PixelFormat::Rgb => VideoFormat::RGB,
            PixelFormat::Bgr => VideoFormat::BGR,
            PixelFormat::Xbgr => VideoFormat::xBGR,
            PixelFormat::Abgr => VideoFormat::ABGR,
            PixelFormat::Gray8 => VideoFormat::GRAY8,
            PixelFormat::Yuy2 => VideoFormat::YUY2,
        }
    }

    pub fn from_spa(format: VideoFormat) -> Option<PixelFormat> {
        Some(match format {
            VideoFormat::RGBA => PixelFormat::Rgba,
            VideoFormat::BGRA => PixelFormat::Bgra,
            VideoFormat::RGBx => PixelFormat::Rgbx,
            VideoFormat::BGRx => PixelFormat::Bgrx,
            VideoFormat::RGB => PixelFormat::Rgb,
            VideoFormat::BGR => PixelFormat::Bgr,
            VideoFormat::xBGR => PixelFormat::Xbgr,
            VideoFormat::ABGR => PixelFormat::Abgr,
            VideoFormat::GRAY8 => PixelFormat::Gray8,
            VideoFormat::YUY2 => PixelFormat::Yuy2,
            _ => return None,
        })
    }

    /// DRM fourcc with the same memory layout. Note the name flip: DRM
    /// fourccs read least-significant byte first, SPA formats read
    /// memory order.
    pub fn to_drm_fourcc(self) -> Option<DrmFourcc> {
        Some(match self {
            PixelFormat::Rgba => DrmFourcc::Abgr8888,
            PixelFormat::Bgra => DrmFourcc::Argb8888,
            PixelFormat::Rgbx => DrmFourcc::Xbgr8888,
            PixelFormat::Bgrx => DrmFourcc::Xrgb8888,
            PixelFormat::Rgb => DrmFourcc::Bgr888,
            PixelFormat::Bgr => DrmFourcc::Rgb888,
            PixelFormat::Xbgr => DrmFourcc::Rgbx8888,
            PixelFormat::Abgr => DrmFourcc::Rgba8888,
            PixelFormat::Gray8 => DrmFourcc::R8,
            PixelFormat::Yuy2 => DrmFourcc::Yuyv,
        })
    }

    pub fn from_drm_fourcc(fourcc: DrmFourcc) -> Option<PixelFormat> {
        Some(match fourcc {
            DrmFourcc::Abgr8888 => PixelFormat::Rgba,
            DrmFourcc::Argb8888 => PixelFormat::Bgra,
            DrmFourcc::Xbgr8888 => PixelFormat::Rgbx,
            DrmFourcc::Xrgb8888 => PixelFormat::Bgrx,
            DrmFourcc::Bgr888 => PixelFormat::Rgb,
            DrmFourcc::Rgb888 => PixelFormat::Bgr,
            DrmFourcc::Rgbx8888 => PixelFormat::Xbgr,
            DrmFourcc::Rgba8888 => PixelFormat::Abgr,
            DrmFourcc::R8 => PixelFormat::Gray8,
            DrmFourcc::Yuyv => PixelFormat::Yuy2,
            _ => return None,
        })
    }

    pub fn to_av_pixel(self) -> AVPixelFormat {
        match self {
            PixelFormat::Rgba => AVPixelFormat::AV_PIX_FMT_RGBA,
            PixelFormat::Bgra => AVPixelFormat::AV_PIX_FMT_BGRA,
            PixelFormat::Rgbx => AVPixelFormat::AV_PIX_FMT_RGB0,
            PixelFormat::Bgrx => AVPixelFormat::AV_PIX_FMT_BGR0,
            PixelFormat::Rgb => AVPixelFormat::AV_PIX_FMT_RGB24,
            PixelFormat::Bgr => AVPixelFormat::AV_PIX_FMT_BGR24,
            PixelFormat::Xbgr => AVPixelFormat::AV_PIX_FMT_0BGR,
            PixelFormat::Abgr => AVPixelFormat::AV_PIX_FMT_ABGR,
            PixelFormat::Gray8 => AVPixelFormat::AV_PIX_FMT_GRAY8,
            PixelFormat::Yuy2 => AVPixelFormat::AV_PIX_FMT_YUYV422,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba
            | PixelFormat::Bgra
            | PixelFormat::Rgbx
            | PixelFormat::Bgrx
            | PixelFormat::Xbgr
            | PixelFormat::Abgr => 4,
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Gray8 => 1,
            PixelFormat::Yuy2 => 2,
        }
    }
}

/// Repack a CPU image into tightly-packed RGBA. Software encoders feed a
/// fixed `rgba` buffer source, so everything funnels through here once.
///
/// Returns `None` for formats with no direct RGBA expansion (YUY2).
pub fn convert_to_rgba(
    format: PixelFormat,
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
) -> Option<Vec<u8>> {
    let bpp = format.bytes_per_pixel();
    if stride < width * bpp || src.len() < stride * height {
        return None;
    }
    let mut out = vec![0u8; width * height * 4];
    for y in 0..height {
        let row = &src[y * stride..y * stride + width * bpp];
        let dst = &mut out[y * width * 4..(y + 1) * width * 4];
        match format {
            PixelFormat::Rgba => dst.copy_from_slice(row),
            PixelFormat::Rgbx => {
                dst.copy_from_slice(row);
                for px in dst.chunks_exact_mut(4) {
                    px[3] = 0xff;
                }
            }
            PixelFormat::Bgra | PixelFormat::Bgrx => {
                for (d, s) in dst.chunks_exact_mut(4).zip(row.chunks_exact(4)) {
                    d[0] = s[2];
                    d[1] = s[1];
                    d[2] = s[0];
                    d[3] = if format == PixelFormat::Bgra { s[3] } else { 0xff };
                }
            }
            PixelFormat::Abgr | PixelFormat::Xbgr => {
                for (d, s) in dst.chunks_exact_mut(4).zip(row.chunks_exact(4)) {
                    d[0] = s[3];
                    d[1] = s[2];
                    d[2] = s[1];
                    d[3] = if format == PixelFormat::Abgr { s[0] } else { 0xff };
                }
            }
            PixelFormat::Rgb => {
                for (d, s) in dst.chunks_exact_mut(4).zip(row.chunks_exact(3)) {
                    d[..3].copy_from_slice(s);
                    d[3] = 0xff;
                }
            }
            PixelFormat::Bgr => {
                for (d, s) in dst.chunks_exact_mut(4).zip(row.chunks_exact(3)) {
                    d[0] = s[2];
                    d[1] = s[1];
                    d[2] = s[0];
                    d[3] = 0xff;
                }
            }
            PixelFormat::Gray8 => {
                for (d, s) in dst.chunks_exact_mut(4).zip(row.iter()) {
                    d[0] = *s;
                    d[1] = *s;
                    d[2] = *s;
                    d[3] = 0xff;
                }
            }
            PixelFormat::Yuy2 => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        for &f in PixelFormat::NEGOTIATION_ORDER {
            let fourcc = f.to_drm_fourcc().unwrap();
            assert_eq!(PixelFormat::from_drm_fourcc(fourcc), Some(f));
        }
    }

    #[test]
    fn spa_round_trip() {
        for &f in PixelFormat::NEGOTIATION_ORDER {
            assert_eq!(PixelFormat::from_spa(f.to_spa()), Some(f));
        }
    }

    #[test]
    fn bgra_maps_to_argb8888() {
        // BGRA in memory is ARGB read as a little-endian word
        assert_eq!(PixelFormat::Bgra.to_drm_fourcc(), Some(DrmFourcc::Argb8888));
        assert_eq!(PixelFormat::Rgba.to_drm_fourcc(), Some(DrmFourcc::Abgr8888));
    }

    #[test]
    fn convert_bgra_swizzles_channels() {
        let src = [0x10, 0x20, 0x30, 0x40]; // B G R A
        let out = convert_to_rgba(PixelFormat::Bgra, &src, 4, 1, 1).unwrap();
        assert_eq!(out, [0x30, 0x20, 0x10, 0x40]);
    }

    #[test]
    fn convert_bgrx_forces_opaque_alpha() {
        let src = [0x10, 0x20, 0x30, 0x00];
        let out = convert_to_rgba(PixelFormat::Bgrx, &src, 4, 1, 1).unwrap();
        assert_eq!(out, [0x30, 0x20, 0x10, 0xff]);
    }

    #[test]
    fn convert_respects_stride_padding() {
        // 1x2 image with 8-byte stride, RGB
        let src = [1, 2, 3, 0, 0, 0, 0, 0, 4, 5, 6, 0, 0, 0, 0, 0];
        let out = convert_to_rgba(PixelFormat::Rgb, &src, 8, 1, 2).unwrap();
        assert_eq!(out, [1, 2, 3, 0xff, 4, 5, 6, 0xff]);
    }

    #[test]
    fn convert_rejects_short_buffer() {
        assert!(convert_to_rgba(PixelFormat::Rgba, &[0; 8], 4, 2, 2).is_none());
    }

    #[test]
    fn yuy2_has_no_rgba_expansion() {
        assert!(convert_to_rgba(PixelFormat::Yuy2, &[0; 16], 8, 4, 2).is_none());
    }
}
