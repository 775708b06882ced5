//! Software encoder variants: libx264, libopenh264, libvpx VP8/VP9,
//! WebP and GIF. All of them consume tightly-packed RGBA frames through
//! a `buffer` source declared with the shared millisecond time base.

use std::ffi::c_int;

use ffmpeg_next::ffi::{
    AVPixelFormat, AV_CODEC_FLAG_QSCALE, FF_PROFILE_H264_CONSTRAINED_BASELINE,
    FF_PROFILE_H264_HIGH, FF_PROFILE_H264_MAIN,
};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{encoder, filter, frame, Dictionary, Rational};

use crate::error::{Error, Result};
use crate::frame::CpuImage;

use super::{
    alloc_encoder, buffer_source_args, encode_thread_count, map_quality, BuiltEncoder,
    CodecOptions, EncodingPreference, H264Profile, Variant, TIME_BASE,
};

/// libx264 counts 1..51 plus an headroom band we map the bottom of the
/// quality slider into.
const X264_WORST_QUALITY: i32 = 51 + 36;
const OPENH264_WORST_QUALITY: i32 = 51;
const VPX_WORST_QUALITY: i32 = 63;

unsafe fn set_qp_range(enc: &mut encoder::video::Video, qmin: i32, qmax: i32) {
    let ptr = enc.as_mut_ptr();
    (*ptr).qmin = qmin;
    (*ptr).qmax = qmax;
}

/// `buffer -> <chain> -> buffersink` over RGBA input.
fn build_graph(
    width: u32,
    height: u32,
    chain: &str,
    sink_format: Pixel,
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
            &buffer_source_args(width, height, AVPixelFormat::AV_PIX_FMT_RGBA),
        )
        .map_err(Error::Encoder)?;
    graph.add(&buffersink, "out", "").map_err(Error::Encoder)?;
    if let Some(mut out) = graph.get("out") {
        out.set_pixel_format(sink_format);
    }
    graph
        .output("in", 0)
        .and_then(|o| o.input("out", 0))
        .and_then(|p| p.parse(chain))
        .map_err(Error::Encoder)?;
    graph.validate().map_err(Error::Encoder)?;
    Ok(graph)
}

fn preset_for(preference: EncodingPreference) -> &'static str {
    match preference {
        EncodingPreference::NoPreference => "veryfast",
        EncodingPreference::Speed => "ultrafast",
        EncodingPreference::Quality => "slow",
        EncodingPreference::Size => "veryslow",
    }
}

unsafe fn set_global_quality(enc: &mut encoder::video::Video, value: i32) {
    let ptr = enc.as_mut_ptr();
    (*ptr).global_quality = value;
    (*ptr).flags |= AV_CODEC_FLAG_QSCALE as c_int;
}

unsafe fn set_h264_profile(enc: &mut encoder::video::Video, profile: H264Profile) {
    // libopenh264 reads CONSTRAINED_BASELINE but is known to emit plain
    // baseline through libav; the constant is kept regardless.
    let value = match profile {
        H264Profile::Baseline => FF_PROFILE_H264_CONSTRAINED_BASELINE,
        H264Profile::Main => FF_PROFILE_H264_MAIN,
        H264Profile::High => FF_PROFILE_H264_HIGH,
    };
    (*enc.as_mut_ptr()).profile = value as c_int;
}

pub(crate) fn build(variant: Variant, options: &CodecOptions) -> Result<BuiltEncoder> {
    match variant {
        Variant::X264 => build_x264(options),
        Variant::OpenH264 => build_openh264(options),
        Variant::Vp8 => build_vp8(options),
        Variant::Vp9 => build_vp9(options),
        Variant::Webp => build_webp(options),
        Variant::Gif => build_gif(options),
        Variant::H264Vaapi | Variant::Vp9Vaapi => {
            Err(Error::Config("hardware variant in software builder".into()))
        }
    }
}

fn build_x264(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    // The codec only takes even dimensions; the pad filter grows odd
    // input by one row/column of replicated edge.
    let enc_width = width.div_ceil(2) * 2;
    let enc_height = height.div_ceil(2) * 2;

    let graph = build_graph(
        width,
        height,
        "pad=ceil(iw/2)*2:ceil(ih/2)*2,format=yuv420p",
        Pixel::YUV420P,
    )?;

    let mut enc = alloc_encoder(Variant::X264)?;
    enc.set_width(enc_width);
    enc.set_height(enc_height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(TIME_BASE);
    enc.set_frame_rate(Some(Rational(options.max_framerate.ceil().max(1) as i32, 1)));
    enc.set_gop(100);
    enc.set_max_b_frames(0);
    unsafe {
        if let Some(q) = options.quality {
            set_global_quality(&mut enc, map_quality(q, X264_WORST_QUALITY, 1));
        }
        if let Some(profile) = options.h264_profile {
            set_h264_profile(&mut enc, profile);
        }
    }

    let mut opts = Dictionary::new();
    opts.set("threads", &encode_thread_count().to_string());
    opts.set("flags", "+mv4-loop");
    opts.set("preset", preset_for(options.preference));

    let encoder = enc.open_with(opts).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

fn build_openh264(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    let graph = build_graph(width, height, "format=yuv420p", Pixel::YUV420P)?;

    let mut enc = alloc_encoder(Variant::OpenH264)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(TIME_BASE);
    enc.set_frame_rate(Some(Rational(options.max_framerate.ceil().max(1) as i32, 1)));
    enc.set_gop(100);
    enc.set_max_b_frames(0);
    unsafe {
        if let Some(q) = options.quality {
            let qp = map_quality(q, OPENH264_WORST_QUALITY, 1);
            set_qp_range(&mut enc, qp, qp);
        }
        set_h264_profile(
            &mut enc,
            options.h264_profile.unwrap_or(H264Profile::Baseline),
        );
    }

    let mut opts = Dictionary::new();
    opts.set("loopfilter", "0");
    opts.set("flags", "+mv4");

    let encoder = enc.open_with(opts).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

fn build_vp8(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    let graph = build_graph(width, height, "format=yuv420p", Pixel::YUV420P)?;

    let mut enc = alloc_encoder(Variant::Vp8)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(TIME_BASE);
    enc.set_frame_rate(Some(Rational(options.max_framerate.ceil().max(1) as i32, 1)));
    enc.set_bit_rate(2 * width as usize * height as usize);
    unsafe {
        if let Some(q) = options.quality {
            set_global_quality(&mut enc, map_quality(q, VPX_WORST_QUALITY, 1));
        }
    }

    let mut opts = Dictionary::new();
    opts.set("tune-content", "screen");
    opts.set("deadline", "realtime");
    // Quieter than the bitrate cap alone; the encoder still undershoots
    // on static content.
    opts.set("crf", "45");

    let encoder = enc.open_with(opts).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

/// VP9 rate/quality knobs derived from the quality slider.
pub(crate) struct Vp9Tuning {
    pub crf: i32,
    pub qmin: i32,
    pub qmax: i32,
    pub cpu_used: i32,
}

pub(crate) fn vp9_tuning(quality: u8) -> Vp9Tuning {
    let crf = map_quality(quality, VPX_WORST_QUALITY, 1);
    let qmin = (crf / 2).clamp(0, crf);
    let qmax = (crf * 3 / 2).clamp(crf, VPX_WORST_QUALITY);
    let effort = 3 - ((quality.min(100) as f64 / 100.0) * 3.0).round() as i32;
    let cpu_used = 5 + effort.clamp(1, 3);
    Vp9Tuning { crf, qmin, qmax, cpu_used }
}

/// Bitrate grows with the frame area and with framerates beyond 30.
pub(crate) fn vp9_bit_rate(width: u32, height: u32, fps: u32) -> usize {
    let fps_factor = (fps as f64 / 30.0).max(1.0);
    (width as f64 * height as f64 * fps_factor) as usize
}

fn build_vp9(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    let fps = options.max_framerate.ceil().max(1);
    let graph = build_graph(width, height, "format=yuv420p", Pixel::YUV420P)?;

    let mut enc = alloc_encoder(Variant::Vp9)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(TIME_BASE);
    enc.set_frame_rate(Some(Rational(fps as i32, 1)));
    enc.set_gop(2 * fps);

    let bit_rate = vp9_bit_rate(width, height, fps);
    enc.set_bit_rate(bit_rate);
    enc.set_max_bit_rate(bit_rate * 3 / 2);
    unsafe {
        (*enc.as_mut_ptr()).rc_min_rate = (bit_rate / 2) as i64;
    }

    let tuning = vp9_tuning(options.quality.unwrap_or(50));
    unsafe {
        set_qp_range(&mut enc, tuning.qmin, tuning.qmax);
    }

    let mut opts = Dictionary::new();
    opts.set("crf", &tuning.crf.to_string());
    opts.set("cpu-used", &tuning.cpu_used.to_string());
    opts.set("tile-columns", "6");
    opts.set("tile-rows", "2");
    opts.set("frame-parallel", "1");

    let encoder = enc.open_with(opts).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

fn build_webp(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    let graph = build_graph(width, height, "format=yuv420p", Pixel::YUVA420P)?;

    let mut enc = alloc_encoder(Variant::Webp)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::YUVA420P);
    enc.set_time_base(TIME_BASE);

    let mut opts = Dictionary::new();
    if let Some(q) = options.quality {
        opts.set("quality", &q.min(100).to_string());
    }

    let encoder = enc.open_with(opts).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

const GIF_CHAIN: &str = "split[v1][v2];\
                         [v1]palettegen=stats_mode=single[palette];\
                         [v2][palette]paletteuse=new=1:dither=sierra2_4a";

fn build_gif(options: &CodecOptions) -> Result<BuiltEncoder> {
    let (width, height) = options.size;
    let graph = build_graph(width, height, GIF_CHAIN, Pixel::PAL8)?;

    let mut enc = alloc_encoder(Variant::Gif)?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::PAL8);
    enc.set_time_base(TIME_BASE);

    // The gif muxer path logs one INFO line per palette frame; that is
    // thousands of lines per minute of capture.
    ffmpeg_next::log::set_level(ffmpeg_next::log::Level::Warning);

    let encoder = enc.open_with(Dictionary::new()).map_err(Error::Encoder)?;
    Ok(BuiltEncoder { encoder, graph, hw: None })
}

/// Copy a (possibly padded) RGBA image into a freshly allocated AVFrame.
pub(crate) fn upload_rgba(image: &CpuImage, pts: i64) -> Result<frame::Video> {
    let width = image.width;
    let height = image.height;
    let src = image.data.bytes();
    let src_stride = image.stride as usize;
    let row_bytes = width as usize * 4;
    if src_stride < row_bytes || src.len() < src_stride * height as usize {
        return Err(Error::Frame(format!(
            "short RGBA buffer: {} bytes for {}x{} stride {}",
            src.len(),
            width,
            height,
            src_stride
        )));
    }

    let mut frame = frame::Video::new(Pixel::RGBA, width, height);
    let dst_stride = frame.stride(0);
    let data = frame.data_mut(0);
    for y in 0..height as usize {
        let src_row = &src[y * src_stride..y * src_stride + row_bytes];
        data[y * dst_stride..y * dst_stride + row_bytes].copy_from_slice(src_row);
    }
    frame.set_pts(Some(pts));
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp9_tuning_brackets_the_crf() {
        let t = vp9_tuning(50);
        assert_eq!(t.crf, 32);
        assert_eq!(t.qmin, 16);
        assert_eq!(t.qmax, 48);
        assert!(t.qmin <= t.crf && t.crf <= t.qmax);
    }

    #[test]
    fn vp9_cpu_used_tracks_quality() {
        // Low quality encodes fast, high quality spends effort.
        assert_eq!(vp9_tuning(0).cpu_used, 8);
        assert_eq!(vp9_tuning(50).cpu_used, 6);
        assert_eq!(vp9_tuning(100).cpu_used, 6);
        for q in [0u8, 25, 50, 75, 100] {
            let c = vp9_tuning(q).cpu_used;
            assert!((6..=8).contains(&c));
        }
    }

    #[test]
    fn vp9_qmax_never_exceeds_codec_range() {
        for q in 0..=100u8 {
            let t = vp9_tuning(q);
            assert!(t.qmax <= VPX_WORST_QUALITY);
            assert!(t.qmin >= 0);
        }
    }

    #[test]
    fn vp9_bitrate_scales_with_framerate_above_30() {
        let base = vp9_bit_rate(1920, 1080, 30);
        assert_eq!(base, 1920 * 1080);
        assert_eq!(vp9_bit_rate(1920, 1080, 60), base * 2);
        // Below 30 fps the factor clamps at 1.
        assert_eq!(vp9_bit_rate(1920, 1080, 15), base);
    }

    #[test]
    fn presets_cover_all_preferences() {
        assert_eq!(preset_for(EncodingPreference::Speed), "ultrafast");
        assert_eq!(preset_for(EncodingPreference::Quality), "slow");
        assert_eq!(preset_for(EncodingPreference::Size), "veryslow");
        assert_eq!(preset_for(EncodingPreference::NoPreference), "veryfast");
    }
}
