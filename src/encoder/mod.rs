//! The encoder family: one libav codec context plus a filter graph per
//! variant, driven through a fixed operation set.
//!
//! ```text
//! [buffer source] -> [filters...] -> [buffer sink] -> [codec] -> [packets]
//! ```
//!
//! `filter` pushes a captured frame into the buffer source, `encode`
//! drains filtered frames into the codec (bounded by the pending-packet
//! budget), `receive` pulls packets out, `finish` starts the drain.
//! Three different producer threads call into one encoder; the graph and
//! the codec context are each behind their own mutex.

mod hardware;
mod software;

pub(crate) use hardware::HwEncodeContext;

use std::ffi::c_int;

use ffmpeg_next::ffi::AVPixelFormat;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{encoder, filter, frame, Rational};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::frame::{Frame, FramePayload};
use crate::vaapi::VaapiInfo;

/// Millisecond time base shared by every variant.
pub(crate) const TIME_BASE: Rational = Rational(1, 1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingPreference {
    #[default]
    NoPreference,
    Quality,
    Speed,
    Size,
}

/// Caller-facing codec selection; the producer resolves it to a
/// [`Variant`], hardware first where a device exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderType {
    H264Baseline,
    H264Main,
    H264High,
    Vp8,
    Vp9,
    WebP,
    Gif,
    #[default]
    NoEncoder,
}

impl EncoderType {
    pub fn h264_profile(self) -> Option<H264Profile> {
        match self {
            EncoderType::H264Baseline => Some(H264Profile::Baseline),
            EncoderType::H264Main => Some(H264Profile::Main),
            EncoderType::H264High => Some(H264Profile::High),
            _ => None,
        }
    }
}

/// Concrete encoder implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    H264Vaapi,
    X264,
    OpenH264,
    Vp8,
    Vp9,
    Vp9Vaapi,
    Webp,
    Gif,
}

impl Variant {
    pub fn codec_name(self) -> &'static str {
        match self {
            Variant::H264Vaapi => "h264_vaapi",
            Variant::X264 => "libx264",
            Variant::OpenH264 => "libopenh264",
            Variant::Vp8 => "libvpx",
            Variant::Vp9 => "libvpx-vp9",
            Variant::Vp9Vaapi => "vp9_vaapi",
            Variant::Webp => "libwebp",
            Variant::Gif => "gif",
        }
    }

    pub fn is_hardware(self) -> bool {
        matches!(self, Variant::H264Vaapi | Variant::Vp9Vaapi)
    }

    pub fn is_available(self) -> bool {
        encoder::find_by_name(self.codec_name()).is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub size: (u32, u32),
    /// The negotiated source format; hardware variants need it to
    /// describe their DRM-prime frames.
    pub format: PixelFormat,
    /// `None` leaves the codec defaults alone.
    pub quality: Option<u8>,
    pub preference: EncodingPreference,
    pub max_framerate: crate::frame::Fraction,
    pub h264_profile: Option<H264Profile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub is_key_frame: bool,
    pub data: Vec<u8>,
    /// Milliseconds since the first frame.
    pub pts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderState {
    Ready,
    Draining,
    Finished,
}

/// Maps the public 0..100 quality scale onto a codec's native range.
/// `worst`/`best` are the codec's numeric endpoints; most codecs count
/// down (larger number, worse picture).
pub(crate) fn map_quality(quality: u8, worst: i32, best: i32) -> i32 {
    let q = quality.min(100) as f64 / 100.0;
    (worst as f64 + (best - worst) as f64 * q).round() as i32
}

pub(crate) fn encode_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(16)
}

/// Monotonic pts: milliseconds since the first frame, duplicates
/// promoted by one.
struct PtsTracker {
    base_ns: Option<i64>,
    last_ms: Option<i64>,
}

impl PtsTracker {
    fn new() -> Self {
        Self { base_ns: None, last_ms: None }
    }

    fn next(&mut self, pts_ns: Option<i64>) -> i64 {
        let mut ms = match pts_ns {
            Some(ns) => {
                let base = *self.base_ns.get_or_insert(ns);
                (ns - base) / 1_000_000
            }
            None => self.last_ms.map_or(0, |l| l + 1),
        };
        if let Some(last) = self.last_ms {
            if ms <= last {
                ms = last + 1;
            }
        }
        self.last_ms = Some(ms);
        ms
    }
}

struct CodecCtx {
    encoder: encoder::Video,
    state: EncoderState,
    /// Frames sent to the codec and not yet received back as packets.
    in_flight: usize,
}

// The raw libav pointers inside are only touched under the mutexes; the
// graph is written by `filter` and read by `encode`, the codec context
// by `encode`, `receive` and `finish`.
unsafe impl Send for Encoder {}
unsafe impl Sync for Encoder {}

pub struct Encoder {
    variant: Variant,
    graph: Mutex<filter::Graph>,
    codec: Mutex<CodecCtx>,
    pts: Mutex<PtsTracker>,
    /// Keeps the DRM device and frames contexts alive for hardware
    /// variants; software variants have none.
    hw: Option<HwEncodeContext>,
}

impl Encoder {
    /// Build the codec context and filter graph for `variant`. Fails on
    /// a degenerate size, a size outside the hardware bounds, or a codec
    /// that is not compiled in.
    pub fn new(variant: Variant, options: &CodecOptions) -> Result<Encoder> {
        ffmpeg_next::init().map_err(Error::Encoder)?;

        let (width, height) = options.size;
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "cannot encode a {width}x{height} stream"
            )));
        }
        if !variant.is_available() {
            return Err(Error::Config(format!(
                "encoder {} is not compiled into libavcodec",
                variant.codec_name()
            )));
        }

        let built = if variant.is_hardware() {
            let vaapi = VaapiInfo::get();
            if !vaapi.supports_size(width, height) {
                return Err(Error::Config(format!(
                    "{width}x{height} outside VAAPI bounds {:?}..{:?}",
                    vaapi.min_size, vaapi.max_size
                )));
            }
            hardware::build(variant, options)?
        } else {
            software::build(variant, options)?
        };

        debug!(
            codec = variant.codec_name(),
            width,
            height,
            quality = options.quality,
            "encoder initialized"
        );

        Ok(Encoder {
            variant,
            graph: Mutex::new(built.graph),
            codec: Mutex::new(CodecCtx {
                encoder: built.encoder,
                state: EncoderState::Ready,
                in_flight: 0,
            }),
            pts: Mutex::new(PtsTracker::new()),
            hw: built.hw,
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Push a captured frame into the filter graph. Returns false when
    /// the frame cannot feed this variant (wrong payload, convert
    /// failure, draining encoder); the frame is dropped, the stream
    /// lives on.
    pub fn filter(&self, frame: &Frame) -> bool {
        if self.codec.lock().state != EncoderState::Ready {
            return false;
        }
        let pts = self.pts.lock().next(frame.presentation_timestamp);

        let av_frame = match (&frame.payload, &self.hw) {
            (FramePayload::DmaBuf(attrs), Some(hw)) => {
                match hardware::wrap_drm_prime(attrs, hw, pts) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("DRM-prime wrap failed: {e}");
                        return false;
                    }
                }
            }
            (FramePayload::CpuMapped(image), None) => {
                match software::upload_rgba(image, pts) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("frame upload failed: {e}");
                        return false;
                    }
                }
            }
            (FramePayload::Corrupt, _) => return false,
            _ => {
                trace!("payload does not match encoder kind, dropping frame");
                return false;
            }
        };

        let mut graph = self.graph.lock();
        match graph.get("in") {
            Some(mut ctx) => match ctx.source().add(&av_frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!("buffer source rejected frame: {e}");
                    false
                }
            },
            None => false,
        }
    }

    /// Drain filtered frames into the codec. Refuses to push the libav
    /// queue beyond `max_pending - 1` outstanding frames; the excess is
    /// dropped with a warning rather than buffered unboundedly.
    ///
    /// Returns `(frames_filtered, frames_queued)`.
    pub fn encode(&self, max_pending: usize) -> (usize, usize) {
        let mut filtered = 0usize;
        let mut queued = 0usize;

        loop {
            let mut av_frame = frame::Video::empty();
            {
                let mut graph = self.graph.lock();
                let Some(mut ctx) = graph.get("out") else { break };
                if ctx.sink().frame(&mut av_frame).is_err() {
                    break;
                }
            }
            filtered += 1;

            let mut codec = self.codec.lock();
            if codec.state == EncoderState::Finished {
                break;
            }
            if codec.in_flight + 1 >= max_pending {
                warn!(
                    in_flight = codec.in_flight,
                    max_pending, "encoder queue full, dropping frame"
                );
                continue;
            }
            match codec.encoder.send_frame(&av_frame) {
                Ok(()) => {
                    codec.in_flight += 1;
                    queued += 1;
                }
                Err(ffmpeg_next::Error::Other { errno: EAGAIN }) => {
                    warn!("codec not accepting input, dropping frame");
                }
                Err(e) => {
                    warn!("send_frame failed: {e}");
                }
            }
        }

        (filtered, queued)
    }

    /// Pull every packet the codec has ready. Returns an empty vec on
    /// EAGAIN; flips to `Finished` on EOF while draining.
    pub fn receive(&self) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        let mut codec = self.codec.lock();
        if codec.state == EncoderState::Finished {
            return Ok(packets);
        }
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match codec.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    codec.in_flight = codec.in_flight.saturating_sub(1);
                    packets.push(Packet {
                        is_key_frame: packet.is_key(),
                        data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                        pts: packet.pts().unwrap_or(0),
                    });
                }
                Err(ffmpeg_next::Error::Other { errno: EAGAIN }) => break,
                Err(ffmpeg_next::Error::Eof) => {
                    codec.state = EncoderState::Finished;
                    break;
                }
                Err(e) => {
                    warn!("receive_packet failed: {e}");
                    return Err(Error::Encoder(e));
                }
            }
        }
        Ok(packets)
    }

    /// Flush the filter graph into the codec and send EOF. Subsequent
    /// `receive` calls drain the remaining packets until EOF.
    pub fn finish(&self) {
        {
            let mut graph = self.graph.lock();
            if let Some(mut ctx) = graph.get("in") {
                if let Err(e) = ctx.source().flush() {
                    trace!("filter flush: {e}");
                }
            }
        }
        // Push whatever the flush released; the pending bound no longer
        // matters, everything drains from here.
        self.encode(usize::MAX);

        let mut codec = self.codec.lock();
        if codec.state != EncoderState::Ready {
            return;
        }
        if let Err(e) = codec.encoder.send_eof() {
            warn!("send_eof failed: {e}");
        }
        codec.state = EncoderState::Draining;
    }

    pub fn is_finished(&self) -> bool {
        self.codec.lock().state == EncoderState::Finished
    }
}

/// Result of a per-variant build.
pub(crate) struct BuiltEncoder {
    pub(crate) encoder: encoder::Video,
    pub(crate) graph: filter::Graph,
    pub(crate) hw: Option<HwEncodeContext>,
}

pub(crate) fn alloc_encoder(variant: Variant) -> Result<ffmpeg_next::encoder::video::Video> {
    let codec = encoder::find_by_name(variant.codec_name()).ok_or_else(|| {
        Error::Config(format!("{} not compiled in", variant.codec_name()))
    })?;
    let context = unsafe {
        ffmpeg_next::codec::context::Context::wrap(
            ffmpeg_next::ffi::avcodec_alloc_context3(codec.as_ptr()),
            None,
        )
    };
    context.encoder().video().map_err(Error::Encoder)
}

/// Shared buffer-source arguments: pixel format as a numeric id, the
/// millisecond time base every variant uses.
pub(crate) fn buffer_source_args(width: u32, height: u32, pix_fmt: AVPixelFormat) -> String {
    format!(
        "video_size={width}x{height}:pix_fmt={}:time_base=1/1000:pixel_aspect=1/1",
        pix_fmt as c_int
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_maps_are_linear_and_clamped() {
        // libx264 scale: 87 (worst) .. 1 (best)
        assert_eq!(map_quality(0, 87, 1), 87);
        assert_eq!(map_quality(100, 87, 1), 1);
        assert_eq!(map_quality(50, 87, 1), 44);
        // beyond 100 clamps
        assert_eq!(map_quality(200, 87, 1), 1);
        // openh264 scale: 51 .. 1
        assert_eq!(map_quality(0, 51, 1), 51);
        assert_eq!(map_quality(100, 51, 1), 1);
        // vpx scale: 63 .. 1
        assert_eq!(map_quality(0, 63, 1), 63);
        assert_eq!(map_quality(100, 63, 1), 1);
        assert_eq!(map_quality(50, 63, 1), 32);
    }

    #[test]
    fn pts_counts_milliseconds_from_first_frame() {
        let mut t = PtsTracker::new();
        assert_eq!(t.next(Some(1_000_000_000)), 0);
        assert_eq!(t.next(Some(1_033_333_333)), 33);
        assert_eq!(t.next(Some(1_066_666_666)), 66);
    }

    #[test]
    fn duplicate_pts_is_promoted() {
        let mut t = PtsTracker::new();
        assert_eq!(t.next(Some(5_000_000_000)), 0);
        assert_eq!(t.next(Some(5_000_000_000)), 1);
        assert_eq!(t.next(Some(5_000_500_000)), 2); // sub-ms step still promotes
        assert_eq!(t.next(Some(5_100_000_000)), 100);
    }

    #[test]
    fn missing_timestamps_still_increase() {
        let mut t = PtsTracker::new();
        assert_eq!(t.next(None), 0);
        assert_eq!(t.next(None), 1);
        assert_eq!(t.next(None), 2);
    }

    #[test]
    fn backwards_timestamps_never_regress() {
        let mut t = PtsTracker::new();
        assert_eq!(t.next(Some(2_000_000_000)), 0);
        assert_eq!(t.next(Some(2_050_000_000)), 50);
        assert_eq!(t.next(Some(2_010_000_000)), 51);
    }

    #[test]
    fn variant_names_match_libav_registry() {
        assert_eq!(Variant::X264.codec_name(), "libx264");
        assert_eq!(Variant::H264Vaapi.codec_name(), "h264_vaapi");
        assert_eq!(Variant::Vp9.codec_name(), "libvpx-vp9");
        assert!(Variant::H264Vaapi.is_hardware());
        assert!(Variant::Vp9Vaapi.is_hardware());
        assert!(!Variant::Gif.is_hardware());
    }

    #[test]
    fn buffer_source_args_use_millisecond_time_base() {
        let args = buffer_source_args(1920, 1080, AVPixelFormat::AV_PIX_FMT_RGBA);
        assert!(args.contains("video_size=1920x1080"));
        assert!(args.contains("time_base=1/1000"));
    }

    #[test]
    fn zero_size_fails_initialization() {
        let options = CodecOptions {
            size: (0, 0),
            format: PixelFormat::Rgba,
            quality: None,
            preference: EncodingPreference::NoPreference,
            max_framerate: crate::frame::Fraction::new(30, 1),
            h264_profile: None,
        };
        assert!(Encoder::new(Variant::Vp8, &options).is_err());
        assert!(Encoder::new(Variant::X264, &options).is_err());
        assert!(Encoder::new(Variant::H264Vaapi, &options).is_err());
    }

    #[test]
    fn encoder_type_carries_its_profile() {
        assert_eq!(EncoderType::H264Baseline.h264_profile(), Some(H264Profile::Baseline));
        assert_eq!(EncoderType::H264Main.h264_profile(), Some(H264Profile::Main));
        assert_eq!(EncoderType::H264High.h264_profile(), Some(H264Profile::High));
        assert_eq!(EncoderType::Vp8.h264_profile(), None);
        assert_eq!(EncoderType::default(), EncoderType::NoEncoder);
    }
}
