//! Hardware (VAAPI) encoder variants.
//!
//! DMA-BUF frames enter the filter graph as DRM-prime AVFrames on a DRM
//! hardware device; `hwmap` derives a VAAPI device from it, `scale_vaapi`
//! lands on NV12, and the buffer sink's frames context is bound straight
//! into the codec. No pixel ever visits the CPU.

use std::ffi::{c_int, c_void, CString};
use std::ptr::null_mut;

use ffmpeg_next::ffi::{
    av_buffer_create, av_buffer_ref, av_buffer_unref, av_buffersink_get_hw_frames_ctx,
    av_buffersrc_parameters_alloc, av_buffersrc_parameters_set, av_free, av_hwdevice_ctx_create,
    av_hwframe_ctx_alloc, av_hwframe_ctx_init, AVBufferRef, AVDRMFrameDescriptor,
    AVHWDeviceType, AVHWFramesContext, AVPixelFormat, AV_CODEC_FLAG_QSCALE,
    FF_PROFILE_H264_CONSTRAINED_BASELINE, FF_PROFILE_H264_HIGH, FF_PROFILE_H264_MAIN,
};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{filter, frame, Dictionary, Rational};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::DmaBufAttributes;
use crate::vaapi::VaapiInfo;

use super::software::{vp9_bit_rate, vp9_tuning};
use super::{
    alloc_encoder, buffer_source_args, encode_thread_count, map_quality, BuiltEncoder,
    CodecOptions, H264Profile, Variant, TIME_BASE,
};

/// Same headroom band as the software H.264 map.
const H264_VAAPI_WORST_QUALITY: i32 = 87;

const HW_FILTER_CHAIN: &str = "hwmap=mode=direct:derive_device=vaapi,\
                               scale_vaapi=format=nv12:mode=fast";

/// A refcounted libav hardware device context (DRM flavour).
pub(crate) struct AvHwDevCtx {
    ptr: *mut AVBufferRef,
}

impl AvHwDevCtx {
    fn new_drm(path: &str) -> Result<AvHwDevCtx> {
        let dev_cstr = CString::new(path)
            .map_err(|_| Error::Resource(format!("bad device path {path:?}")))?;
        unsafe {
            let mut ptr = null_mut();
            let sts = av_hwdevice_ctx_create(
                &mut ptr,
                AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
                dev_cstr.as_ptr(),
                null_mut(),
                0,
            );
            if sts != 0 {
                return Err(Error::Resource(format!(
                    "DRM device {path}: {}",
                    ffmpeg_next::Error::from(sts)
                )));
            }
            Ok(AvHwDevCtx { ptr })
        }
    }
}

impl Drop for AvHwDevCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ptr);
        }
    }
}

pub(crate) struct AvHwFrameCtx {
    ptr: *mut AVBufferRef,
}

impl Drop for AvHwFrameCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.ptr);
        }
    }
}

/// Frames context describing the incoming DRM-prime frames. No pool:
/// every frame wraps an externally-owned DMA-BUF.
fn create_drm_frames_ctx(
    device: &AvHwDevCtx,
    sw_format: AVPixelFormat,
    width: u32,
    height: u32,
) -> Result<AvHwFrameCtx> {
    unsafe {
        let mut hwframe = av_hwframe_ctx_alloc(device.ptr);
        if hwframe.is_null() {
            return Err(Error::Resource("hwframe ctx alloc failed".into()));
        }
        let casted = (*hwframe).data as *mut AVHWFramesContext;
        (*casted).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME;
        (*casted).sw_format = sw_format;
        (*casted).width = width as c_int;
        (*casted).height = height as c_int;
        (*casted).initial_pool_size = 0;

        let sts = av_hwframe_ctx_init(hwframe);
        if sts != 0 {
            av_buffer_unref(&mut hwframe);
            return Err(Error::Resource(format!(
                "hwframe ctx init: {}",
                ffmpeg_next::Error::from(sts)
            )));
        }
        Ok(AvHwFrameCtx { ptr: hwframe })
    }
}

/// Everything a hardware encoder keeps alive beyond the codec context.
pub(crate) struct HwEncodeContext {
    #[allow(dead_code)]
    device: AvHwDevCtx,
    frames: AvHwFrameCtx,
}

fn build_hw_graph(
    device: &AvHwDevCtx,
    frames: &AvHwFrameCtx,
    width: u32,
    height: u32,
) -> Result<filter::Graph> {
    let mut graph = filter::Graph::new();
    let buffer =
        filter::find("buffer").ok_or_else(|| Error::Resource("no buffer filter".into()))?;
    let buffersink =
        filter::find("buffersink").ok_or_else(|| Error::Resource("no buffersink filter".into()))?;

    graph
        .add(
            &buffer,
            "in",
            &buffer_source_args(width, height, AVPixelFormat::AV_PIX_FMT_DRM_PRIME),
        )
        .map_err(Error::Encoder)?;

    unsafe {
        let params = av_buffersrc_parameters_alloc();
        if params.is_null() {
            return Err(Error::Resource("buffersrc parameters alloc failed".into()));
        }
        let p = &mut *params;
        p.width = width as c_int;
        p.height = height as c_int;
        p.format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
        p.time_base.num = TIME_BASE.0;
        p.time_base.den = TIME_BASE.1;
        p.hw_frames_ctx = frames.ptr;
        let sts = av_buffersrc_parameters_set(
            graph.get("in").expect("just added").as_mut_ptr(),
            params,
        );
        av_free(params as *mut c_void);
        if sts != 0 {
            return Err(Error::Encoder(ffmpeg_next::Error::from(sts)));
        }
    }

    graph.add(&buffersink, "out", "").map_err(Error::Encoder)?;
    if let Some(mut out) = graph.get("out") {
        out.set_pixel_format(Pixel::VAAPI);
    }
    graph
        .output("in", 0)
        .and_then(|o| o.input("out", 0))
        .and_then(|p| p.parse(HW_FILTER_CHAIN))
        .map_err(Error::Encoder)?;

    // hwmap needs the device on every node it may touch; libav only
    // propagates it along hw_frames links.
    unsafe {
        let graph_ptr = graph.as_mut_ptr();
        for i in 0..(*graph_ptr).nb_filters as usize {
            let filter_ctx = *(*graph_ptr).filters.add(i);
            if (*filter_ctx).hw_device_ctx.is_null() {
                (*filter_ctx).hw_device_ctx = av_buffer_ref(device.ptr);
            }
        }
    }

    graph.validate().map_err(Error::Encoder)?;
    Ok(graph)
}

pub(crate) fn build(variant: Variant, options: &CodecOptions) -> Result<BuiltEncoder> {
    let vaapi = VaapiInfo::get();
    let path = vaapi
        .device_path
        .clone()
        .ok_or_else(|| Error::Resource("no VAAPI device".into()))?;
    let (width, height) = options.size;

    let device = AvHwDevCtx::new_drm(&path)?;
    let frames = create_drm_frames_ctx(&device, options.format.to_av_pixel(), width, height)?;
    let mut graph = build_hw_graph(&device, &frames, width, height)?;

    // The sink's frames context (VAAPI NV12, produced by scale_vaapi)
    // becomes the codec's frame pool.
    let sink_frames = unsafe {
        av_buffersink_get_hw_frames_ctx(graph.get("out").expect("validated").as_mut_ptr())
    };
    if sink_frames.is_null() {
        return Err(Error::Resource("filter sink has no hw frames context".into()));
    }

    let fps = options.max_framerate.ceil().max(1);
    let mut enc = alloc_encoder(variant)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::VAAPI);
    enc.set_time_base(TIME_BASE);
    enc.set_frame_rate(Some(Rational(fps as i32, 1)));
    enc.set_max_b_frames(0);

    unsafe {
        let ptr = enc.as_mut_ptr();
        (*ptr).hw_frames_ctx = av_buffer_ref(sink_frames);
        (*ptr).sw_pix_fmt = AVPixelFormat::AV_PIX_FMT_NV12;
    }

    let mut opts = Dictionary::new();
    let encoder = match variant {
        Variant::H264Vaapi => {
            enc.set_gop(100);
            unsafe {
                let ptr = enc.as_mut_ptr();
                if let Some(q) = options.quality {
                    (*ptr).global_quality = map_quality(q, H264_VAAPI_WORST_QUALITY, 1);
                    (*ptr).flags |= AV_CODEC_FLAG_QSCALE as c_int;
                }
                (*ptr).profile = match options.h264_profile.unwrap_or(H264Profile::Main) {
                    H264Profile::Baseline => FF_PROFILE_H264_CONSTRAINED_BASELINE,
                    H264Profile::Main => FF_PROFILE_H264_MAIN,
                    H264Profile::High => FF_PROFILE_H264_HIGH,
                } as c_int;
            }
            opts.set("flags", "+mv4-loop");
            enc.open_with(opts).map_err(Error::Encoder)?
        }
        Variant::Vp9Vaapi => {
            enc.set_gop(2 * fps);
            enc.set_bit_rate(vp9_bit_rate(width, height, fps));
            let tuning = vp9_tuning(options.quality.unwrap_or(50));
            unsafe {
                (*enc.as_mut_ptr()).compression_level = tuning.cpu_used;
            }
            opts.set("async_depth", &encode_thread_count().to_string());
            enc.open_with(opts).map_err(Error::Encoder)?
        }
        other => {
            return Err(Error::Config(format!(
                "{} is not a hardware variant",
                other.codec_name()
            )))
        }
    };

    debug!(device = %path, codec = variant.codec_name(), "hardware encoder ready");
    Ok(BuiltEncoder {
        encoder,
        graph,
        hw: Some(HwEncodeContext { device, frames }),
    })
}

unsafe extern "C" fn free_drm_descriptor(_opaque: *mut c_void, data: *mut u8) {
    let desc = Box::from_raw(data as *mut AVDRMFrameDescriptor);
    libc::close(desc.objects[0].fd);
}

/// Wrap a DMA-BUF frame as a DRM-prime AVFrame. The first plane's fd is
/// dup'ed into object 0 and closed by the AVBuffer free callback when
/// the codec releases the frame.
pub(crate) fn wrap_drm_prime(
    attrs: &DmaBufAttributes,
    hw: &HwEncodeContext,
    pts: i64,
) -> Result<frame::Video> {
    let fourcc = attrs
        .format
        .to_drm_fourcc()
        .ok_or_else(|| Error::Frame(format!("no fourcc for {:?}", attrs.format)))?;
    if attrs.planes.is_empty() || attrs.planes.len() > 4 {
        return Err(Error::Frame(format!(
            "unsupported plane count {}",
            attrs.planes.len()
        )));
    }

    let dup_fd = unsafe { libc::dup(attrs.first_plane_fd()) };
    if dup_fd < 0 {
        return Err(Error::Frame("dup of DMA-BUF fd failed".into()));
    }

    let mut desc: Box<AVDRMFrameDescriptor> = Box::new(unsafe { std::mem::zeroed() });
    desc.nb_objects = 1;
    desc.objects[0].fd = dup_fd;
    desc.objects[0].size = 0;
    desc.objects[0].format_modifier = attrs.modifier;
    desc.nb_layers = 1;
    desc.layers[0].format = fourcc as u32;
    desc.layers[0].nb_planes = attrs.planes.len() as c_int;
    for (i, plane) in attrs.planes.iter().enumerate() {
        desc.layers[0].planes[i].object_index = 0;
        desc.layers[0].planes[i].offset = plane.offset as i64;
        desc.layers[0].planes[i].pitch = plane.stride as i64;
    }

    let mut av_frame = frame::Video::empty();
    unsafe {
        let raw = Box::into_raw(desc);
        let buf = av_buffer_create(
            raw as *mut u8,
            std::mem::size_of::<AVDRMFrameDescriptor>(),
            Some(free_drm_descriptor),
            null_mut(),
            0,
        );
        if buf.is_null() {
            libc::close(dup_fd);
            drop(Box::from_raw(raw));
            return Err(Error::Frame("av_buffer_create failed".into()));
        }
        let f = av_frame.as_mut_ptr();
        (*f).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
        (*f).width = attrs.width as c_int;
        (*f).height = attrs.height as c_int;
        (*f).buf[0] = buf;
        (*f).data[0] = raw as *mut u8;
        (*f).hw_frames_ctx = av_buffer_ref(hw.frames.ptr);
    }
    av_frame.set_pts(Some(pts));
    Ok(av_frame)
}
