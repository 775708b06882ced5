//! Public capture surface: configure a node/fd pair, flip `active`, get
//! encoded packets through a sink callback.
//!
//! The surface owns no packet buffer; each packet is delivered
//! synchronously from the packet worker. File writers and in-memory
//! consumers specialize the sink, not this type.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::encoder::{EncoderType, EncodingPreference, Packet, Variant};
use crate::error::Result;
use crate::frame::Fraction;
use crate::producer::{Producer, ProducerCallbacks, ProducerOptions};
use crate::vaapi::VaapiInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodedStreamState {
    /// Not capturing; check `error` if you expected otherwise.
    #[default]
    Idle,
    /// Frames are flowing into the encoder.
    Recording,
    /// Capture stopped, the encoder is draining its queue.
    Rendering,
}

#[derive(Clone)]
struct Config {
    node_id: u32,
    fd: i32,
    encoder: EncoderType,
    quality: Option<u8>,
    preference: EncodingPreference,
    max_framerate: Fraction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            fd: 0,
            encoder: EncoderType::default(),
            quality: None,
            preference: EncodingPreference::default(),
            max_framerate: Fraction::default(),
        }
    }
}

type PacketCallback = Box<dyn FnMut(&Packet) + Send>;

#[derive(Default)]
struct CallbackSlots {
    packet: Mutex<Option<PacketCallback>>,
    error: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    state: Mutex<Option<Box<dyn Fn(EncodedStreamState) + Send + Sync>>>,
    size: Mutex<Option<Box<dyn Fn(u32, u32) + Send + Sync>>>,
    cursor: Mutex<Option<Box<dyn Fn(Option<(i32, i32)>) + Send + Sync>>>,
}

#[derive(Default)]
pub struct EncodedStream {
    config: Mutex<Config>,
    state: Arc<Mutex<EncodedStreamState>>,
    error: Arc<Mutex<Option<String>>>,
    producer: Arc<Mutex<Option<Arc<Producer>>>>,
    callbacks: Arc<CallbackSlots>,
}

impl EncodedStream {
    pub fn new() -> Self {
        Self::default()
    }

    // -- configuration ----------------------------------------------------

    pub fn set_node_id(&self, node_id: u32) {
        self.config.lock().node_id = node_id;
    }

    pub fn node_id(&self) -> u32 {
        self.config.lock().node_id
    }

    /// `0` means the default daemon connection; any other fd is shared
    /// with every stream on the same fd and must stay open while active.
    pub fn set_fd(&self, fd: i32) {
        self.config.lock().fd = fd;
    }

    pub fn fd(&self) -> i32 {
        self.config.lock().fd
    }

    pub fn set_encoder(&self, encoder: EncoderType) {
        self.config.lock().encoder = encoder;
    }

    pub fn encoder(&self) -> EncoderType {
        self.config.lock().encoder
    }

    pub fn set_quality(&self, quality: Option<u8>) {
        self.config.lock().quality = quality.map(|q| q.min(100));
    }

    pub fn set_max_framerate(&self, framerate: Fraction) {
        self.config.lock().max_framerate = framerate;
    }

    pub fn max_framerate(&self) -> Fraction {
        self.config.lock().max_framerate
    }

    pub fn set_encoding_preference(&self, preference: EncodingPreference) {
        self.config.lock().preference = preference;
    }

    pub fn state(&self) -> EncodedStreamState {
        *self.state.lock()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    // -- callbacks --------------------------------------------------------

    /// The packet sink: `(is_key_frame, bytes, pts_ms)` per packet,
    /// called synchronously from the packet worker.
    pub fn on_packet(&self, sink: impl FnMut(&Packet) + Send + 'static) {
        *self.callbacks.packet.lock() = Some(Box::new(sink));
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.callbacks.error.lock() = Some(Box::new(callback));
    }

    pub fn on_state_changed(
        &self,
        callback: impl Fn(EncodedStreamState) + Send + Sync + 'static,
    ) {
        *self.callbacks.state.lock() = Some(Box::new(callback));
    }

    pub fn on_size_changed(&self, callback: impl Fn(u32, u32) + Send + Sync + 'static) {
        *self.callbacks.size.lock() = Some(Box::new(callback));
    }

    pub fn on_cursor_changed(
        &self,
        callback: impl Fn(Option<(i32, i32)>) + Send + Sync + 'static,
    ) {
        *self.callbacks.cursor.lock() = Some(Box::new(callback));
    }

    // -- lifecycle --------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.producer.lock().is_some()
    }

    /// Start or stop the pipeline. Starting requires a node id and an
    /// encoder selection; failures land in [`EncodedStream::error`] and
    /// leave the state at `Idle`.
    pub fn set_active(&self, active: bool) -> Result<()> {
        if active {
            self.activate()
        } else {
            self.deactivate();
            Ok(())
        }
    }

    fn activate(&self) -> Result<()> {
        let mut producer_slot = self.producer.lock();
        if producer_slot.is_some() {
            return Ok(());
        }
        *self.error.lock() = None;

        let config = self.config.lock().clone();
        let options = ProducerOptions {
            encoder: config.encoder,
            node_id: config.node_id,
            fd: config.fd,
            quality: config.quality,
            preference: config.preference,
            max_framerate: config.max_framerate,
            ..Default::default()
        };

        let callbacks = self.build_producer_callbacks();
        match Producer::start(options, callbacks) {
            Ok(producer) => {
                *producer_slot = Some(Arc::new(producer));
                self.transition(EncodedStreamState::Recording);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!("capture failed to start: {message}");
                *self.error.lock() = Some(message.clone());
                if let Some(cb) = self.callbacks.error.lock().as_ref() {
                    cb(&message);
                }
                Err(e)
            }
        }
    }

    fn deactivate(&self) {
        let Some(producer) = self.producer.lock().take() else {
            return;
        };
        self.transition(EncodedStreamState::Rendering);
        producer.deactivate();

        // Joining drains the remaining packets through the sink; do it
        // off the caller's thread and flip to Idle when dry.
        let state = self.state.clone();
        let slots = self.callbacks.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("pipecast-drain".to_string())
            .spawn(move || {
                producer.join();
                *state.lock() = EncodedStreamState::Idle;
                if let Some(cb) = slots.state.lock().as_ref() {
                    cb(EncodedStreamState::Idle);
                }
                debug!("capture drained");
            })
        {
            warn!("drain thread failed to spawn ({e}), joining inline");
            producer.join();
            self.transition(EncodedStreamState::Idle);
        }
    }

    fn transition(&self, new_state: EncodedStreamState) {
        *self.state.lock() = new_state;
        if let Some(cb) = self.callbacks.state.lock().as_ref() {
            cb(new_state);
        }
    }

    fn build_producer_callbacks(&self) -> ProducerCallbacks {
        let slots = self.callbacks.clone();
        let error_slot = self.error.clone();
        let error_slots = self.callbacks.clone();
        let size_slots = self.callbacks.clone();
        let cursor_slots = self.callbacks.clone();

        ProducerCallbacks {
            on_packet: Box::new(move |packet| {
                if let Some(sink) = slots.packet.lock().as_mut() {
                    sink(packet);
                }
            }),
            on_error: Some(Box::new(move |message| {
                *error_slot.lock() = Some(message.to_string());
                if let Some(cb) = error_slots.error.lock().as_ref() {
                    cb(message);
                }
            })),
            on_size_changed: Some(Box::new(move |width, height| {
                if let Some(cb) = size_slots.size.lock().as_ref() {
                    cb(width, height);
                }
            })),
            on_cursor_changed: Some(Box::new(move |position| {
                if let Some(cb) = cursor_slots.cursor.lock().as_ref() {
                    cb(position);
                }
            })),
            on_streaming: None,
            on_frame: None,
        }
    }
}

impl Drop for EncodedStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.lock().take() {
            producer.deactivate();
            producer.join();
        }
    }
}

/// The encoders this machine can actually run: hardware codecs the
/// VAAPI probe admits plus the software codecs compiled into libav.
pub fn suggested_encoders() -> Vec<EncoderType> {
    suggested_encoders_with(VaapiInfo::get(), Variant::is_available)
}

fn suggested_encoders_with(
    vaapi: &VaapiInfo,
    available: impl Fn(Variant) -> bool,
) -> Vec<EncoderType> {
    let mut out = Vec::new();
    let h264_software = available(Variant::X264) || available(Variant::OpenH264);
    if vaapi.h264 || h264_software {
        out.extend([
            EncoderType::H264Main,
            EncoderType::H264Baseline,
            EncoderType::H264High,
        ]);
    }
    if available(Variant::Vp8) {
        out.push(EncoderType::Vp8);
    }
    if vaapi.vp9 || available(Variant::Vp9) {
        out.push(EncoderType::Vp9);
    }
    if available(Variant::Webp) {
        out.push(EncoderType::WebP);
    }
    if available(Variant::Gif) {
        out.push(EncoderType::Gif);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vaapi_none() -> VaapiInfo {
        VaapiInfo {
            device_path: None,
            h264: false,
            vp9: false,
            min_size: (16, 16),
            max_size: (4096, 4096),
        }
    }

    #[test]
    fn new_stream_is_idle_with_no_error() {
        let stream = EncodedStream::new();
        assert_eq!(stream.state(), EncodedStreamState::Idle);
        assert!(stream.error().is_none());
        assert!(!stream.is_active());
    }

    #[test]
    fn activating_without_node_id_fails_and_stays_idle() {
        let stream = EncodedStream::new();
        stream.set_encoder(EncoderType::Vp8);
        assert!(stream.set_active(true).is_err());
        assert_eq!(stream.state(), EncodedStreamState::Idle);
        assert!(stream.error().is_some());
    }

    #[test]
    fn activating_without_encoder_fails() {
        let stream = EncodedStream::new();
        stream.set_node_id(42);
        assert!(stream.set_active(true).is_err());
        assert!(stream.error().unwrap().contains("encoder"));
    }

    #[test]
    fn quality_is_clamped_to_100() {
        let stream = EncodedStream::new();
        stream.set_quality(Some(250));
        assert_eq!(stream.config.lock().quality, Some(100));
    }

    #[test]
    fn suggested_encoders_intersect_hardware_and_software() {
        // Nothing available at all.
        let none = suggested_encoders_with(&vaapi_none(), |_| false);
        assert!(none.is_empty());

        // Software-only x264 + vpx.
        let sw = suggested_encoders_with(&vaapi_none(), |v| {
            matches!(v, Variant::X264 | Variant::Vp8 | Variant::Vp9)
        });
        assert!(sw.contains(&EncoderType::H264Main));
        assert!(sw.contains(&EncoderType::Vp8));
        assert!(sw.contains(&EncoderType::Vp9));
        assert!(!sw.contains(&EncoderType::WebP));
        assert!(!sw.contains(&EncoderType::Gif));

        // Hardware H.264 with no software H.264 still lists the
        // profiles.
        let mut hw = vaapi_none();
        hw.h264 = true;
        let with_hw = suggested_encoders_with(&hw, |_| false);
        assert!(with_hw.contains(&EncoderType::H264Baseline));
        assert!(with_hw.contains(&EncoderType::H264Main));
        assert!(with_hw.contains(&EncoderType::H264High));
    }
}
