//! VAAPI capability probe: is hardware encoding usable at all, on which
//! render node, and within which frame-size bounds.
//!
//! Probed once per process. Drivers disagree wildly about modifier
//! support, so [`VaapiInfo::supports_modifier`] deliberately admits only
//! LINEAR; anything fancier must come from the EGL side.

use std::ffi::CString;
use std::ptr::null_mut;

use ffmpeg_next::ffi::{
    av_buffer_unref, av_hwdevice_ctx_create, av_hwdevice_get_hwframe_constraints,
    av_hwframe_constraints_free, AVHWDeviceType,
};
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::format::PixelFormat;
use crate::stream::DRM_FORMAT_MOD_LINEAR;

/// Fallback bounds when the driver does not report constraints.
const DEFAULT_MIN_SIZE: (u32, u32) = (16, 16);
const DEFAULT_MAX_SIZE: (u32, u32) = (16384, 16384);

pub const FALLBACK_RENDER_NODE: &str = "/dev/dri/renderD128";

#[derive(Debug, Clone)]
pub struct VaapiInfo {
    /// Render node the encoder should open; `None` when no device
    /// initialised.
    pub device_path: Option<String>,
    pub h264: bool,
    pub vp9: bool,
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

static VAAPI: Lazy<VaapiInfo> = Lazy::new(probe);

impl VaapiInfo {
    pub fn get() -> &'static VaapiInfo {
        &VAAPI
    }

    /// Whether a hardware encoder can consume a DMA-BUF with this
    /// modifier. Only LINEAR; there is no portable query for more.
    pub fn supports_modifier(&self, _format: PixelFormat, modifier: u64) -> bool {
        self.device_path.is_some() && modifier == DRM_FORMAT_MOD_LINEAR
    }

    pub fn supports_size(&self, width: u32, height: u32) -> bool {
        width >= self.min_size.0
            && height >= self.min_size.1
            && width <= self.max_size.0
            && height <= self.max_size.1
    }
}

fn render_nodes() -> Vec<String> {
    let mut nodes: Vec<String> = std::fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name().to_string_lossy().starts_with("renderD")
                })
                .map(|e| e.path().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();
    if nodes.is_empty() {
        nodes.push(FALLBACK_RENDER_NODE.to_string());
    }
    nodes
}

/// Try to bring up a VAAPI device on `path` and read its frame-size
/// constraints. Accepting a device here stands in for the per-profile
/// rate-control walk: a device that initialises and carries the libav
/// encoder will take Constrained-Baseline/Main/High slices.
fn probe_device(path: &str) -> Option<((u32, u32), (u32, u32))> {
    let dev_cstr = CString::new(path).ok()?;
    unsafe {
        let mut hw_device_ctx = null_mut();
        let sts = av_hwdevice_ctx_create(
            &mut hw_device_ctx,
            AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            dev_cstr.as_ptr(),
            null_mut(),
            0,
        );
        if sts != 0 {
            debug!(path, sts, "VAAPI device init failed");
            return None;
        }

        let mut min = DEFAULT_MIN_SIZE;
        let mut max = DEFAULT_MAX_SIZE;
        let constraints = av_hwdevice_get_hwframe_constraints(hw_device_ctx, null_mut());
        if !constraints.is_null() {
            let c = &*constraints;
            min = (c.min_width.max(1) as u32, c.min_height.max(1) as u32);
            if c.max_width > 0 && c.max_height > 0 {
                max = (c.max_width as u32, c.max_height as u32);
            }
            let mut constraints = constraints;
            av_hwframe_constraints_free(&mut constraints);
        }

        av_buffer_unref(&mut hw_device_ctx);
        Some((min, max))
    }
}

fn probe() -> VaapiInfo {
    ffmpeg_next::init().ok();

    let h264_compiled = ffmpeg_next::encoder::find_by_name("h264_vaapi").is_some();
    let vp9_compiled = ffmpeg_next::encoder::find_by_name("vp9_vaapi").is_some();
    if !h264_compiled && !vp9_compiled {
        debug!("no VAAPI encoders compiled into libavcodec");
        return VaapiInfo {
            device_path: None,
            h264: false,
            vp9: false,
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        };
    }

    for path in render_nodes() {
        if let Some((min_size, max_size)) = probe_device(&path) {
            info!(
                path,
                h264 = h264_compiled,
                vp9 = vp9_compiled,
                ?min_size,
                ?max_size,
                "VAAPI device usable"
            );
            return VaapiInfo {
                device_path: Some(path),
                h264: h264_compiled,
                vp9: vp9_compiled,
                min_size,
                max_size,
            };
        }
    }

    debug!("no usable VAAPI device found");
    VaapiInfo {
        device_path: None,
        h264: false,
        vp9: false,
        min_size: DEFAULT_MIN_SIZE,
        max_size: DEFAULT_MAX_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DRM_FORMAT_MOD_INVALID;

    fn info_with_device() -> VaapiInfo {
        VaapiInfo {
            device_path: Some(FALLBACK_RENDER_NODE.into()),
            h264: true,
            vp9: false,
            min_size: (32, 32),
            max_size: (4096, 4096),
        }
    }

    #[test]
    fn only_linear_modifier_is_admitted() {
        let info = info_with_device();
        assert!(info.supports_modifier(PixelFormat::Bgra, DRM_FORMAT_MOD_LINEAR));
        assert!(!info.supports_modifier(PixelFormat::Bgra, DRM_FORMAT_MOD_INVALID));
        assert!(!info.supports_modifier(PixelFormat::Bgra, 0x100000000000001));
    }

    #[test]
    fn no_device_means_no_modifiers() {
        let mut info = info_with_device();
        info.device_path = None;
        assert!(!info.supports_modifier(PixelFormat::Bgra, DRM_FORMAT_MOD_LINEAR));
    }

    #[test]
    fn size_bounds_are_inclusive() {
        let info = info_with_device();
        assert!(info.supports_size(32, 32));
        assert!(info.supports_size(4096, 4096));
        assert!(info.supports_size(1920, 1080));
        assert!(!info.supports_size(16, 1080));
        assert!(!info.supports_size(1920, 8192));
    }
}
