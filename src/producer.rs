//! The producer glues one source stream to one encoder.
//!
//! Three workers share the encoder: the capture worker drains stream
//! events, keeps cursor state, converts or imports frames and pushes
//! them into the filter graph; the encode worker drains the graph into
//! the codec under the pending-frame budget; the packet worker pulls
//! packets and hands them to the sink. All three stop on one atomic
//! flag, and `deactivate` never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::dmabuf::{DmaBufImporter, GpuCapabilities, ImportFailure};
use crate::encoder::{
    CodecOptions, Encoder, EncoderType, EncodingPreference, Packet, Variant,
};
use crate::error::{Error, Result};
use crate::format::{convert_to_rgba, PixelFormat};
use crate::frame::{CpuBuffer, CpuImage, CursorBitmap, Fraction, Frame, FramePayload};
use crate::stream::{
    FormatCandidates, NegotiatedFormat, SourceState, SourceStream, StreamEvent, StreamUsage,
};
use crate::vaapi::VaapiInfo;

/// Upper bound on frames queued inside libav before the filter stage
/// starts dropping.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 50;

/// How long teardown waits for the stream to reach `Paused` before
/// finishing the encoder regardless.
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub encoder: EncoderType,
    pub node_id: u32,
    /// PipeWire daemon fd; 0 selects the default connection.
    pub fd: i32,
    pub quality: Option<u8>,
    pub preference: EncodingPreference,
    pub max_framerate: Fraction,
    pub max_pending_frames: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            encoder: EncoderType::NoEncoder,
            node_id: 0,
            fd: 0,
            quality: None,
            preference: EncodingPreference::NoPreference,
            max_framerate: Fraction::default(),
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

/// Everything the producer reports back to its owner.
pub struct ProducerCallbacks {
    pub on_packet: Box<dyn FnMut(&Packet) + Send>,
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_size_changed: Option<Box<dyn Fn(u32, u32) + Send + Sync>>,
    pub on_cursor_changed: Option<Box<dyn Fn(Option<(i32, i32)>) + Send + Sync>>,
    pub on_streaming: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// Runs right before a frame enters the filter graph, after cursor
    /// compositing; overlays go here.
    pub on_frame: Option<Box<dyn FnMut(&mut Frame) + Send>>,
}

impl ProducerCallbacks {
    pub fn with_packet_sink(on_packet: impl FnMut(&Packet) + Send + 'static) -> Self {
        Self {
            on_packet: Box::new(on_packet),
            on_error: None,
            on_size_changed: None,
            on_cursor_changed: None,
            on_streaming: None,
            on_frame: None,
        }
    }
}

/// Sticky cursor bookkeeping: the bitmap survives frames that only move
/// the pointer, and survives frames that hide it.
#[derive(Default)]
pub(crate) struct CursorState {
    pub position: Option<(i32, i32)>,
    pub hotspot: (i32, i32),
    pub bitmap: Option<CursorBitmap>,
}

impl CursorState {
    /// Returns true when the visible position changed.
    pub fn update(&mut self, cursor: &Option<crate::frame::FrameCursor>) -> bool {
        let old_position = self.position;
        match cursor {
            Some(c) => {
                self.position = c.position;
                self.hotspot = c.hotspot;
                if let Some(bitmap) = &c.bitmap {
                    self.bitmap = Some(bitmap.clone());
                }
            }
            // Cursor meta absent: the position is unknown, the texture
            // is not.
            None => self.position = None,
        }
        old_position != self.position
    }
}

/// SrcOver-blend the cursor bitmap into a tightly-packed RGBA image.
pub(crate) fn overlay_cursor(
    image: &mut [u8],
    width: u32,
    height: u32,
    state: &CursorState,
) {
    let (Some(position), Some(bitmap)) = (state.position, &state.bitmap) else {
        return;
    };
    let origin_x = position.0 - state.hotspot.0;
    let origin_y = position.1 - state.hotspot.1;

    for cy in 0..bitmap.height as i32 {
        let y = origin_y + cy;
        if y < 0 || y >= height as i32 {
            continue;
        }
        for cx in 0..bitmap.width as i32 {
            let x = origin_x + cx;
            if x < 0 || x >= width as i32 {
                continue;
            }
            let src = &bitmap.data[(cy as usize * bitmap.width as usize + cx as usize) * 4..][..4];
            let alpha = src[3] as u32;
            if alpha == 0 {
                continue;
            }
            let dst = &mut image[(y as usize * width as usize + x as usize) * 4..][..4];
            for c in 0..3 {
                dst[c] = ((src[c] as u32 * alpha + dst[c] as u32 * (255 - alpha)) / 255) as u8;
            }
            dst[3] = (alpha + dst[3] as u32 * (255 - alpha) / 255).min(255) as u8;
        }
    }
}

struct WorkerSignals {
    encoder: Mutex<Option<Arc<Encoder>>>,
    encoder_ready: Condvar,
    encode_pending: Mutex<bool>,
    encode_cond: Condvar,
    packet_pending: Mutex<bool>,
    packet_cond: Condvar,
    stop: AtomicBool,
}

impl WorkerSignals {
    fn new() -> Self {
        Self {
            encoder: Mutex::new(None),
            encoder_ready: Condvar::new(),
            encode_pending: Mutex::new(false),
            encode_cond: Condvar::new(),
            packet_pending: Mutex::new(false),
            packet_cond: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    fn signal_encode(&self) {
        *self.encode_pending.lock() = true;
        self.encode_cond.notify_one();
    }

    fn signal_packets(&self) {
        *self.packet_pending.lock() = true;
        self.packet_cond.notify_one();
    }

    fn stop_all(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.encoder_ready.notify_all();
        self.signal_encode();
        self.signal_packets();
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Block until the capture worker installed the encoder (or the
    /// producer is stopping).
    fn wait_for_encoder(&self) -> Option<Arc<Encoder>> {
        let mut slot = self.encoder.lock();
        loop {
            if let Some(enc) = slot.as_ref() {
                return Some(enc.clone());
            }
            if self.stopping() {
                return None;
            }
            self.encoder_ready.wait(&mut slot);
        }
    }
}

pub struct Producer {
    stream: Arc<SourceStream>,
    signals: Arc<WorkerSignals>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    deactivated: AtomicBool,
    _connection: Arc<Connection>,
}

impl Producer {
    /// Connect the stream, spawn the workers and start capturing. The
    /// encoder is built on the first format event; a hardware failure
    /// there silently falls back to the software variant.
    pub fn start(options: ProducerOptions, callbacks: ProducerCallbacks) -> Result<Producer> {
        if options.node_id == 0 {
            return Err(Error::Config("no PipeWire node id".into()));
        }
        if options.encoder == EncoderType::NoEncoder {
            return Err(Error::Config("no encoder selected".into()));
        }

        let connection = Connection::fetch(options.fd);
        if let Some(error) = connection.error() {
            return Err(Error::Negotiation(error));
        }

        let vaapi = VaapiInfo::get();
        let gpu = GpuCapabilities::get();
        let hardware_preferred = hardware_candidate(options.encoder, vaapi);
        let usage = if hardware_preferred {
            StreamUsage::EncodeHardware
        } else {
            StreamUsage::EncodeSoftware
        };

        // Hardware consumers constrain the modifier offer to what VAAPI
        // admits; software consumers take everything the importer can
        // read back.
        let formats: Vec<(PixelFormat, Vec<u64>)> = gpu
            .formats()
            .iter()
            .map(|(format, modifiers)| {
                let modifiers = if hardware_preferred {
                    modifiers
                        .iter()
                        .copied()
                        .filter(|&m| vaapi.supports_modifier(*format, m))
                        .collect()
                } else {
                    modifiers.clone()
                };
                (*format, modifiers)
            })
            .collect();
        let candidates = FormatCandidates::new(&formats, gpu.available());

        let stream = Arc::new(SourceStream::new(
            connection.clone(),
            options.node_id,
            usage,
            options.max_framerate,
            candidates,
        )?);
        stream.set_active(true);

        let signals = Arc::new(WorkerSignals::new());
        let mut threads = Vec::with_capacity(3);

        let ProducerCallbacks {
            on_packet,
            on_error,
            on_size_changed,
            on_cursor_changed,
            on_streaming,
            on_frame,
        } = callbacks;

        threads.push(spawn_capture_worker(
            stream.clone(),
            signals.clone(),
            options.clone(),
            CaptureCallbacks { on_error, on_size_changed, on_cursor_changed, on_streaming, on_frame },
        )?);
        threads.push(spawn_encode_worker(signals.clone(), options.max_pending_frames)?);
        threads.push(spawn_packet_worker(signals.clone(), on_packet)?);

        Ok(Producer {
            stream,
            signals,
            threads: Mutex::new(threads),
            deactivated: AtomicBool::new(false),
            _connection: connection,
        })
    }

    /// Ask the pipeline to stop. Idempotent, safe from any thread,
    /// returns immediately; the actual teardown finishes when the
    /// stream pauses (or after a short grace period).
    pub fn deactivate(&self) {
        if self.deactivated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("producer deactivating");
        self.signals.stop.store(true, Ordering::SeqCst);
        self.stream.set_active(false);
        // The capture worker owns the rest of the shutdown; wake it in
        // case it is parked between events.
        self.signals.signal_encode();
    }

    /// Join all three workers. Call after `deactivate`.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.deactivate();
        self.join();
    }
}

fn hardware_candidate(encoder: EncoderType, vaapi: &VaapiInfo) -> bool {
    match encoder {
        EncoderType::H264Baseline | EncoderType::H264Main | EncoderType::H264High => vaapi.h264,
        EncoderType::Vp9 => vaapi.vp9,
        _ => false,
    }
}

/// Resolve the user selection against the negotiated format; hardware
/// first, software on any failure.
fn create_encoder(
    selection: EncoderType,
    negotiated: &NegotiatedFormat,
    options: &ProducerOptions,
) -> Result<Encoder> {
    let vaapi = VaapiInfo::get();
    let codec_options = CodecOptions {
        size: (negotiated.width, negotiated.height),
        format: negotiated.format,
        quality: options.quality,
        preference: options.preference,
        max_framerate: options.max_framerate,
        h264_profile: selection.h264_profile(),
    };

    let hardware = match selection {
        EncoderType::H264Baseline | EncoderType::H264Main | EncoderType::H264High
            if vaapi.h264 =>
        {
            Some(Variant::H264Vaapi)
        }
        EncoderType::Vp9 if vaapi.vp9 => Some(Variant::Vp9Vaapi),
        _ => None,
    };

    // The hardware path needs DMA-BUF transport; a CPU-negotiated
    // stream goes straight to software.
    if let (Some(variant), Some(_)) = (hardware, negotiated.modifier) {
        match Encoder::new(variant, &codec_options) {
            Ok(encoder) => return Ok(encoder),
            Err(e) => {
                info!("hardware encoder unavailable ({e}), falling back to software");
            }
        }
    }

    let software = match selection {
        EncoderType::H264Baseline | EncoderType::H264Main | EncoderType::H264High => {
            if Variant::X264.is_available() {
                Variant::X264
            } else {
                Variant::OpenH264
            }
        }
        EncoderType::Vp8 => Variant::Vp8,
        EncoderType::Vp9 => Variant::Vp9,
        EncoderType::WebP => Variant::Webp,
        EncoderType::Gif => Variant::Gif,
        EncoderType::NoEncoder => {
            return Err(Error::Config("no encoder selected".into()))
        }
    };
    Encoder::new(software, &codec_options)
}

struct CaptureCallbacks {
    on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_size_changed: Option<Box<dyn Fn(u32, u32) + Send + Sync>>,
    on_cursor_changed: Option<Box<dyn Fn(Option<(i32, i32)>) + Send + Sync>>,
    on_streaming: Option<Box<dyn Fn(bool) + Send + Sync>>,
    on_frame: Option<Box<dyn FnMut(&mut Frame) + Send>>,
}

fn spawn_capture_worker(
    stream: Arc<SourceStream>,
    signals: Arc<WorkerSignals>,
    options: ProducerOptions,
    mut callbacks: CaptureCallbacks,
) -> Result<JoinHandle<()>> {
    let events = stream.events().clone();
    std::thread::Builder::new()
        .name("pipecast-capture".to_string())
        .spawn(move || {
            let mut cursor = CursorState::default();
            let mut importer: Option<DmaBufImporter> = None;
            let mut importer_dead = false;
            let mut teardown_deadline: Option<Instant> = None;
            let report = |cb: &CaptureCallbacks, msg: &str| {
                warn!("{msg}");
                if let Some(on_error) = &cb.on_error {
                    on_error(msg);
                }
            };

            loop {
                if signals.stopping() && teardown_deadline.is_none() {
                    teardown_deadline = Some(Instant::now() + TEARDOWN_GRACE);
                }

                let event = match events.recv_timeout(Duration::from_millis(50)) {
                    Ok(event) => event,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if teardown_deadline.is_some_and(|d| Instant::now() >= d) {
                            break;
                        }
                        continue;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                };

                match event {
                    StreamEvent::ParamsChanged(negotiated) => {
                        if let Some(cb) = &callbacks.on_size_changed {
                            cb(negotiated.width, negotiated.height);
                        }
                        let mut slot = signals.encoder.lock();
                        if slot.is_none() {
                            match create_encoder(options.encoder, &negotiated, &options) {
                                Ok(encoder) => {
                                    info!(
                                        codec = encoder.variant().codec_name(),
                                        width = negotiated.width,
                                        height = negotiated.height,
                                        "encoder selected"
                                    );
                                    *slot = Some(Arc::new(encoder));
                                    signals.encoder_ready.notify_all();
                                }
                                Err(e) => {
                                    drop(slot);
                                    report(&callbacks, &format!("encoder setup failed: {e}"));
                                    signals.stop_all();
                                    break;
                                }
                            }
                        } else {
                            // One encoder per producer; a mid-stream
                            // format change means the owner rebuilds us.
                            warn!("format renegotiated mid-stream, keeping existing encoder");
                        }
                    }
                    StreamEvent::Frame(frame) => {
                        if teardown_deadline.is_some() {
                            continue;
                        }
                        handle_frame(
                            frame,
                            &stream,
                            &signals,
                            &mut cursor,
                            &mut importer,
                            &mut importer_dead,
                            &mut callbacks,
                        );
                    }
                    StreamEvent::StateChanged(state) => {
                        trace!(?state, "stream state");
                        match state {
                            SourceState::Streaming => {
                                if let Some(cb) = &callbacks.on_streaming {
                                    cb(true);
                                }
                            }
                            SourceState::Paused if teardown_deadline.is_some() => break,
                            _ => {}
                        }
                    }
                    StreamEvent::Stopped => {
                        if let Some(cb) = &callbacks.on_streaming {
                            cb(false);
                        }
                        break;
                    }
                    StreamEvent::Error(message) => {
                        report(&callbacks, &format!("stream error: {message}"));
                        break;
                    }
                    StreamEvent::PipeBroken => {
                        report(&callbacks, "PipeWire daemon connection lost");
                        break;
                    }
                }
            }

            // Drain path: flush the graph, EOF the codec, wake both
            // workers so they can run the queue dry and exit.
            let encoder = signals.encoder.lock().clone();
            if let Some(encoder) = encoder {
                encoder.finish();
            }
            signals.stop_all();
            debug!("capture worker exiting");
        })
        .map_err(|e| Error::Resource(format!("spawn capture worker: {e}")))
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: Frame,
    stream: &SourceStream,
    signals: &WorkerSignals,
    cursor: &mut CursorState,
    importer: &mut Option<DmaBufImporter>,
    importer_dead: &mut bool,
    callbacks: &mut CaptureCallbacks,
) {
    if frame.is_corrupt() {
        debug!("dropping corrupt frame");
        return;
    }
    if cursor.update(&frame.cursor) {
        if let Some(cb) = &callbacks.on_cursor_changed {
            cb(cursor.position);
        }
    }

    let Some(encoder) = signals.encoder.lock().clone() else {
        trace!("frame before encoder selection, dropping");
        return;
    };

    let mut frame = if encoder.variant().is_hardware() {
        frame
    } else {
        match prepare_software_frame(frame, cursor, stream, importer, importer_dead) {
            Some(frame) => frame,
            None => return,
        }
    };

    if let Some(hook) = &mut callbacks.on_frame {
        hook(&mut frame);
    }

    if encoder.filter(&frame) {
        signals.signal_encode();
    }
}

/// Get the frame into the shape the software encoders eat: an owned or
/// mapped CPU image in tightly-meaningful RGBA, cursor composited.
fn prepare_software_frame(
    frame: Frame,
    cursor: &CursorState,
    stream: &SourceStream,
    importer: &mut Option<DmaBufImporter>,
    importer_dead: &mut bool,
) -> Option<Frame> {
    let needs_cursor = cursor.position.is_some() && cursor.bitmap.is_some();

    let image: CpuImage = match &frame.payload {
        FramePayload::CpuMapped(image) => {
            if frame.format == PixelFormat::Rgba && !needs_cursor {
                // Pass through; the upload copies row by row anyway.
                return Some(frame);
            }
            let rgba = convert_to_rgba(
                frame.format,
                image.data.bytes(),
                image.stride as usize,
                image.width as usize,
                image.height as usize,
            )?;
            CpuImage {
                width: image.width,
                height: image.height,
                stride: image.width * 4,
                data: CpuBuffer::Owned(rgba),
            }
        }
        FramePayload::DmaBuf(attrs) => {
            if *importer_dead {
                return None;
            }
            if importer.is_none() {
                match DmaBufImporter::new() {
                    Ok(i) => *importer = Some(i),
                    Err(e) => {
                        warn!("DMA-BUF importer unavailable: {e}; GPU frames will be dropped");
                        *importer_dead = true;
                        return None;
                    }
                }
            }
            match importer.as_mut().unwrap().download(attrs) {
                Ok(image) => image,
                Err(ImportFailure::Rejected { format, modifier }) => {
                    stream.reject_modifier(format, modifier);
                    return None;
                }
                Err(ImportFailure::Unavailable) => {
                    *importer_dead = true;
                    return None;
                }
            }
        }
        FramePayload::Corrupt => return None,
    };

    let mut image = image;
    if needs_cursor {
        if let CpuBuffer::Owned(data) = &mut image.data {
            overlay_cursor(data, image.width, image.height, cursor);
        }
    }

    Some(Frame {
        format: PixelFormat::Rgba,
        sequence: frame.sequence,
        presentation_timestamp: frame.presentation_timestamp,
        payload: FramePayload::CpuMapped(image),
        damage: frame.damage,
        cursor: frame.cursor,
    })
}

fn spawn_encode_worker(
    signals: Arc<WorkerSignals>,
    max_pending: usize,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pipecast-encode".to_string())
        .spawn(move || {
            let Some(encoder) = signals.wait_for_encoder() else {
                return;
            };
            loop {
                {
                    let mut pending = signals.encode_pending.lock();
                    while !*pending && !signals.stopping() {
                        signals.encode_cond.wait(&mut pending);
                    }
                    *pending = false;
                }

                let (filtered, queued) = encoder.encode(max_pending);
                if queued > 0 || signals.stopping() {
                    signals.signal_packets();
                }
                if filtered > 0 {
                    // More frames may already be waiting in the graph.
                    signals.signal_encode();
                }

                if signals.stopping() && filtered == 0 {
                    break;
                }
            }
            debug!("encode worker exiting");
        })
        .map_err(|e| Error::Resource(format!("spawn encode worker: {e}")))
}

fn spawn_packet_worker(
    signals: Arc<WorkerSignals>,
    mut on_packet: Box<dyn FnMut(&Packet) + Send>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pipecast-packets".to_string())
        .spawn(move || {
            let Some(encoder) = signals.wait_for_encoder() else {
                return;
            };
            loop {
                if !signals.stopping() {
                    let mut pending = signals.packet_pending.lock();
                    while !*pending && !signals.stopping() {
                        signals.packet_cond.wait(&mut pending);
                    }
                    *pending = false;
                }

                match encoder.receive() {
                    Ok(packets) => {
                        for packet in &packets {
                            on_packet(packet);
                        }
                        if signals.stopping() {
                            if encoder.is_finished() {
                                break;
                            }
                            if packets.is_empty() {
                                // EOF not flagged yet; the encode worker
                                // may still be flushing the graph.
                                std::thread::sleep(Duration::from_millis(1));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("packet drain failed: {e}");
                        break;
                    }
                }
            }
            debug!("packet worker exiting");
        })
        .map_err(|e| Error::Resource(format!("spawn packet worker: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameCursor;

    fn bitmap(w: u32, h: u32, px: [u8; 4]) -> CursorBitmap {
        CursorBitmap {
            width: w,
            height: h,
            hotspot: (0, 0),
            data: px.repeat((w * h) as usize),
        }
    }

    #[test]
    fn cursor_texture_is_sticky_across_frames() {
        let mut state = CursorState::default();

        // First frame carries the bitmap.
        state.update(&Some(FrameCursor {
            position: Some((100, 200)),
            hotspot: (8, 8),
            bitmap: Some(bitmap(32, 32, [1, 2, 3, 255])),
        }));
        assert!(state.bitmap.is_some());
        assert_eq!(state.position, Some((100, 200)));
        assert_eq!(state.hotspot, (8, 8));

        // Next two frames move the cursor without a bitmap.
        state.update(&Some(FrameCursor {
            position: Some((100, 200)),
            hotspot: (8, 8),
            bitmap: None,
        }));
        assert!(state.bitmap.is_some());
        state.update(&Some(FrameCursor {
            position: Some((110, 210)),
            hotspot: (8, 8),
            bitmap: None,
        }));
        assert_eq!(state.position, Some((110, 210)));
        assert_eq!(state.bitmap.as_ref().unwrap().width, 32);
    }

    #[test]
    fn cursor_absence_clears_position_keeps_texture() {
        let mut state = CursorState::default();
        state.update(&Some(FrameCursor {
            position: Some((5, 5)),
            hotspot: (0, 0),
            bitmap: Some(bitmap(4, 4, [9, 9, 9, 255])),
        }));
        let changed = state.update(&None);
        assert!(changed);
        assert_eq!(state.position, None);
        assert!(state.bitmap.is_some());
    }

    #[test]
    fn overlay_blends_opaque_cursor_pixels() {
        let mut image = vec![0u8; 4 * 4 * 4]; // 4x4 black, transparent
        let mut state = CursorState::default();
        state.position = Some((1, 1));
        state.bitmap = Some(bitmap(2, 2, [200, 100, 50, 255]));

        overlay_cursor(&mut image, 4, 4, &state);

        let px = |x: usize, y: usize| &image[(y * 4 + x) * 4..][..4];
        assert_eq!(px(1, 1), &[200, 100, 50, 255]);
        assert_eq!(px(2, 2), &[200, 100, 50, 255]);
        assert_eq!(px(0, 0), &[0, 0, 0, 0]);
        assert_eq!(px(3, 3), &[0, 0, 0, 0]);
    }

    #[test]
    fn overlay_respects_hotspot_and_clipping() {
        let mut image = vec![0u8; 4 * 4 * 4];
        let mut state = CursorState::default();
        state.position = Some((0, 0));
        state.hotspot = (1, 1); // bitmap origin at (-1, -1)
        state.bitmap = Some(bitmap(2, 2, [255, 255, 255, 255]));

        overlay_cursor(&mut image, 4, 4, &state);

        // Only the bitmap's bottom-right pixel lands inside the image.
        let px = |x: usize, y: usize| &image[(y * 4 + x) * 4..][..4];
        assert_eq!(px(0, 0), &[255, 255, 255, 255]);
        assert_eq!(px(1, 0), &[0, 0, 0, 0]);
        assert_eq!(px(0, 1), &[0, 0, 0, 0]);
    }

    #[test]
    fn overlay_without_position_is_a_no_op() {
        let mut image = vec![7u8; 2 * 2 * 4];
        let mut state = CursorState::default();
        state.bitmap = Some(bitmap(1, 1, [0, 0, 0, 255]));
        overlay_cursor(&mut image, 2, 2, &state);
        assert!(image.iter().all(|&b| b == 7));
    }

    #[test]
    fn semi_transparent_cursor_blends() {
        let mut image = vec![100u8, 100, 100, 255]; // one pixel
        let mut state = CursorState::default();
        state.position = Some((0, 0));
        state.bitmap = Some(bitmap(1, 1, [200, 200, 200, 128]));
        overlay_cursor(&mut image, 1, 1, &state);
        // (200*128 + 100*127) / 255 = 150
        assert_eq!(&image[..3], &[150, 150, 150]);
        assert_eq!(image[3], 255);
    }

    #[test]
    fn default_options_are_sane() {
        let o = ProducerOptions::default();
        assert_eq!(o.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(o.encoder, EncoderType::NoEncoder);
        assert_eq!(o.fd, 0);
    }
}
