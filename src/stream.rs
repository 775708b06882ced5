//! PipeWire source stream: format and modifier negotiation, buffer
//! dequeue, metadata extraction and frame assembly.
//!
//! The stream itself lives on the connection's loop thread
//! ([`LoopStream`]); the [`SourceStream`] handle owned by the producer
//! talks to it through the connection's request channel and receives
//! [`StreamEvent`]s over a bounded queue.

use std::cell::RefCell;
use std::io::Cursor as IoCursor;
use std::mem::size_of;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pipewire::core::Core;
use pipewire::spa;
use pipewire::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pipewire::spa::param::video::VideoInfoRaw;
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::deserialize::{
    DeserializeError, DeserializeSuccess, ObjectPodDeserializer, PodDeserialize, PodDeserializer,
    Visitor,
};
use pipewire::spa::pod::serialize::PodSerializer;
use pipewire::spa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
use pipewire::spa::utils::{
    Choice, ChoiceEnum, ChoiceFlags, Direction, Fraction as SpaFraction, Id, Rectangle, SpaTypes,
};
use pipewire::stream::{Stream, StreamFlags, StreamListener, StreamState};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ServerVersion};
use crate::error::{Error, Result};
use crate::format::{convert_to_rgba, PixelFormat};
use crate::frame::{
    CpuBuffer, CpuImage, CursorBitmap, DmaBufAttributes, DmaBufPlane, Fraction, Frame,
    FrameCursor, FramePayload, MappedRegion, Rect,
};

/// "No explicit modifier": linear layout chosen by the driver.
pub const DRM_FORMAT_MOD_INVALID: u64 = (1 << 56) - 1;
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Property flags on the modifier choice: MANDATORY | DONT_FIXATE.
const MODIFIER_PROP_FLAGS: u32 = 0x18;

/// What the frames are for; constrains the modifier offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamUsage {
    /// Frames end up in CPU memory (software encoder, possibly via GL
    /// readback).
    EncodeSoftware,
    /// Frames are handed to a VAAPI encoder as DMA-BUFs; only modifiers
    /// the hardware accepts may be offered.
    EncodeHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    /// Absorbing.
    Error,
}

/// The format the server settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    /// Present iff the stream negotiated DMA-BUF transport.
    pub modifier: Option<u64>,
}

#[derive(Debug)]
pub enum StreamEvent {
    /// Format negotiation (or renegotiation) completed.
    ParamsChanged(NegotiatedFormat),
    StateChanged(SourceState),
    Frame(Frame),
    /// The stream reached `Unconnected` without a deliberate stop.
    Stopped,
    Error(String),
    /// The daemon connection died (EPIPE on the core). Terminal.
    PipeBroken,
}

#[derive(Debug)]
pub enum StreamCommand {
    SetActive(bool),
    /// An importer failed on this (format, modifier) pair; renegotiate
    /// without it.
    RejectModifier { format: PixelFormat, modifier: u64 },
    Disconnect,
}

/// One format with the DMA-BUF modifiers currently on offer for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    pub format: PixelFormat,
    /// Explicit modifiers; the INVALID sentinel is appended at pod build
    /// time, never stored.
    pub modifiers: Vec<u64>,
}

/// The candidate set offered to the server, shrunk as importers reject
/// modifiers.
#[derive(Debug, Clone)]
pub struct FormatCandidates {
    pub entries: Vec<FormatEntry>,
    /// DMA-BUF transport may be offered at all.
    pub dmabuf_allowed: bool,
}

impl FormatCandidates {
    /// Build the offer list: every negotiable format, with the modifier
    /// set the GPU reported for it (already constrained to
    /// VAAPI-supported modifiers for hardware usage by the caller).
    pub fn new(gpu_formats: &[(PixelFormat, Vec<u64>)], dmabuf_allowed: bool) -> Self {
        let entries = PixelFormat::NEGOTIATION_ORDER
            .iter()
            .map(|&format| FormatEntry {
                format,
                modifiers: gpu_formats
                    .iter()
                    .find(|(f, _)| *f == format)
                    .map(|(_, m)| m.clone())
                    .unwrap_or_default(),
            })
            .collect();
        FormatCandidates { entries, dmabuf_allowed }
    }

    /// Remove a rejected `(format, modifier)` pair. On servers without
    /// per-modifier drop the whole DMA-BUF path is disabled instead.
    /// Returns true when the offer actually changed.
    pub fn reject_modifier(
        &mut self,
        format: PixelFormat,
        modifier: u64,
        per_modifier_drop: bool,
    ) -> bool {
        if !self.dmabuf_allowed {
            return false;
        }
        if !per_modifier_drop {
            self.dmabuf_allowed = false;
            return true;
        }
        let Some(entry) = self.entries.iter_mut().find(|e| e.format == format) else {
            return false;
        };
        let before = entry.modifiers.len();
        entry.modifiers.retain(|&m| m != modifier);
        if modifier == DRM_FORMAT_MOD_INVALID && entry.modifiers.is_empty() {
            // The implicit-modifier fallback failed too; nothing left
            // to offer this format over DMA-BUF.
            self.dmabuf_allowed = self.entries.iter().any(|e| !e.modifiers.is_empty());
            return true;
        }
        before != entry.modifiers.len()
    }

    pub fn offers_dmabuf(&self) -> bool {
        self.dmabuf_allowed
    }
}

// ---------------------------------------------------------------------------
// Pod construction

fn serialize_object(obj: Object) -> Vec<u8> {
    match PodSerializer::serialize(IoCursor::new(Vec::new()), &Value::Object(obj)) {
        Ok((cursor, _len)) => cursor.into_inner(),
        Err(e) => {
            warn!("failed to serialize pod: {e:?}");
            Vec::new()
        }
    }
}

/// One EnumFormat pod for `format`, with or without the modifier choice.
fn build_format_pod(
    format: PixelFormat,
    modifiers: Option<&[u64]>,
    max_framerate: Fraction,
) -> Vec<u8> {
    let mut properties = vec![
        Property {
            key: FormatProperties::MediaType.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(MediaType::Video.as_raw())),
        },
        Property {
            key: FormatProperties::MediaSubtype.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(MediaSubtype::Raw.as_raw())),
        },
        Property {
            key: FormatProperties::VideoFormat.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(format.to_spa().as_raw())),
        },
    ];

    if let Some(modifiers) = modifiers {
        // The INVALID sentinel always closes the list: "linear, pick for
        // me" keeps negotiation alive when every explicit modifier is
        // refused.
        let mut alternatives: Vec<i64> = modifiers.iter().map(|&m| m as i64).collect();
        if !alternatives.contains(&(DRM_FORMAT_MOD_INVALID as i64)) {
            alternatives.push(DRM_FORMAT_MOD_INVALID as i64);
        }
        let default = alternatives[0];
        properties.push(Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::from_bits_retain(MODIFIER_PROP_FLAGS),
            value: Value::Choice(ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum { default, alternatives },
            ))),
        });
    }

    properties.push(Property {
        key: FormatProperties::VideoSize.as_raw(),
        flags: PropertyFlags::empty(),
        value: Value::Choice(ChoiceValue::Rectangle(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: Rectangle { width: 1920, height: 1080 },
                min: Rectangle { width: 1, height: 1 },
                max: Rectangle { width: i32::MAX as u32, height: i32::MAX as u32 },
            },
        ))),
    });

    let max_fps = max_framerate.ceil().max(1);
    properties.push(Property {
        key: FormatProperties::VideoFramerate.as_raw(),
        flags: PropertyFlags::empty(),
        value: Value::Choice(ChoiceValue::Fraction(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: SpaFraction { num: max_fps, denom: 1 },
                min: SpaFraction { num: 1, denom: 1 },
                max: SpaFraction { num: max_fps, denom: 1 },
            },
        ))),
    });

    serialize_object(Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    })
}

/// The full EnumFormat offer: per format, DMA-BUF with modifiers first,
/// then the linear-only fallback.
pub(crate) fn build_format_pods(
    candidates: &FormatCandidates,
    max_framerate: Fraction,
) -> Vec<Vec<u8>> {
    let mut pods = Vec::new();
    for entry in &candidates.entries {
        if candidates.dmabuf_allowed && !entry.modifiers.is_empty() {
            pods.push(build_format_pod(entry.format, Some(&entry.modifiers), max_framerate));
        }
        pods.push(build_format_pod(entry.format, None, max_framerate));
    }
    pods
}

fn meta_pod(meta_type: u32, size: Value) -> Vec<u8> {
    serialize_object(Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            Property {
                key: spa::sys::SPA_PARAM_META_type,
                flags: PropertyFlags::empty(),
                value: Value::Id(Id(meta_type)),
            },
            Property {
                key: spa::sys::SPA_PARAM_META_size,
                flags: PropertyFlags::empty(),
                value: size,
            },
        ],
    })
}

fn cursor_meta_size(side: i32) -> i32 {
    (size_of::<spa::sys::spa_meta_cursor>() + size_of::<spa::sys::spa_meta_bitmap>()) as i32
        + side * side * 4
}

/// Buffer requirements + metadata subscriptions published after the
/// format settles.
fn build_stream_param_pods(use_dmabuf: bool) -> Vec<Vec<u8>> {
    let data_types = if use_dmabuf {
        1 << spa::sys::SPA_DATA_DmaBuf
    } else {
        (1 << spa::sys::SPA_DATA_MemFd) | (1 << spa::sys::SPA_DATA_MemPtr)
    };

    let buffers = serialize_object(Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![
            Property {
                key: spa::sys::SPA_PARAM_BUFFERS_buffers,
                flags: PropertyFlags::empty(),
                value: Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Range { default: 16, min: 3, max: 16 },
                ))),
            },
            Property {
                key: spa::sys::SPA_PARAM_BUFFERS_align,
                flags: PropertyFlags::empty(),
                value: Value::Int(16),
            },
            Property {
                key: spa::sys::SPA_PARAM_BUFFERS_dataType,
                flags: PropertyFlags::empty(),
                value: Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Flags { default: data_types, flags: vec![data_types] },
                ))),
            },
        ],
    });

    let header = meta_pod(
        spa::sys::SPA_META_Header,
        Value::Int(size_of::<spa::sys::spa_meta_header>() as i32),
    );

    let cursor = meta_pod(
        spa::sys::SPA_META_Cursor,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: cursor_meta_size(64),
                min: cursor_meta_size(1),
                max: cursor_meta_size(1024),
            },
        ))),
    );

    let region = size_of::<spa::sys::spa_meta_region>() as i32;
    let damage = meta_pod(
        spa::sys::SPA_META_VideoDamage,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range { default: region * 16, min: region, max: region * 16 },
        ))),
    );

    vec![buffers, header, cursor, damage]
}

// ---------------------------------------------------------------------------
// Loop-side stream

pub(crate) struct StreamSpec {
    pub id: u64,
    pub node_id: u32,
    pub usage: StreamUsage,
    pub max_framerate: Fraction,
    pub candidates: FormatCandidates,
    pub events: crossbeam_channel::Sender<StreamEvent>,
}

struct StreamShared {
    events: crossbeam_channel::Sender<StreamEvent>,
    candidates: FormatCandidates,
    max_framerate: Fraction,
    server_version: Option<ServerVersion>,
    negotiated: Option<NegotiatedFormat>,
    state: SourceState,
    /// Set by a deliberate `set_active(false)`; suppresses `Stopped`.
    deactivated: bool,
    sequence: u64,
}

impl StreamShared {
    fn emit(&self, event: StreamEvent) {
        if self.events.try_send(event).is_err() {
            trace!("stream event dropped, consumer queue full or gone");
        }
    }
}

pub(crate) struct LoopStream {
    stream: Stream,
    _listener: StreamListener<Rc<RefCell<StreamShared>>>,
    shared: Rc<RefCell<StreamShared>>,
}

impl LoopStream {
    pub(crate) fn create(
        core: &Core,
        spec: StreamSpec,
        server_version: Option<ServerVersion>,
    ) -> Result<LoopStream> {
        let props = pipewire::properties::properties! {
            *pipewire::keys::MEDIA_TYPE => "Video",
            *pipewire::keys::MEDIA_CATEGORY => "Capture",
            *pipewire::keys::MEDIA_ROLE => "Screen",
        };
        let stream = Stream::new(core, "pipecast-capture", props)
            .map_err(|e| Error::Negotiation(format!("stream: {e}")))?;

        // Modifier-aware offers need server support; without it the
        // candidates degrade to linear-only CPU transport.
        let mut candidates = spec.candidates;
        if !server_version.is_some_and(ServerVersion::supports_dmabuf_modifiers) {
            candidates.dmabuf_allowed = false;
        }

        let shared = Rc::new(RefCell::new(StreamShared {
            events: spec.events,
            candidates,
            max_framerate: spec.max_framerate,
            server_version,
            negotiated: None,
            state: SourceState::Unconnected,
            deactivated: false,
            sequence: 0,
        }));

        let listener = stream
            .add_local_listener_with_user_data(shared.clone())
            .state_changed(|_stream, shared, old, new| {
                on_state_changed(shared, old, new);
            })
            .param_changed(|stream, shared, id, pod| {
                if id != ParamType::Format.as_raw() {
                    return;
                }
                on_format_changed(stream, shared, pod);
            })
            .process(|stream, shared| {
                // The daemon may destroy the stream mid-dispatch; the
                // dequeue result is the only safe probe.
                let raw = unsafe { stream.dequeue_raw_buffer() };
                if raw.is_null() {
                    return;
                }
                let frame = unsafe { frame_from_buffer(raw, &mut shared.borrow_mut()) };
                if let Some(frame) = frame {
                    shared.borrow().emit(StreamEvent::Frame(frame));
                }
                unsafe { stream.queue_raw_buffer(raw) };
            })
            .register()
            .map_err(|e| Error::Negotiation(format!("stream listener: {e}")))?;

        let pods = build_format_pods(&shared.borrow().candidates, spec.max_framerate);
        let mut params: Vec<&Pod> = pods.iter().filter_map(|p| Pod::from_bytes(p)).collect();
        if params.is_empty() {
            return Err(Error::Negotiation("no format candidates to offer".into()));
        }

        debug!(
            node_id = spec.node_id,
            pods = params.len(),
            usage = ?spec.usage,
            "connecting capture stream"
        );
        stream
            .connect(
                Direction::Input,
                Some(spec.node_id),
                StreamFlags::AUTOCONNECT | StreamFlags::DONT_RECONNECT,
                &mut params,
            )
            .map_err(|e| Error::Negotiation(format!("connect node {}: {e}", spec.node_id)))?;

        Ok(LoopStream { stream, _listener: listener, shared })
    }

    pub(crate) fn handle(&self, command: StreamCommand) {
        match command {
            StreamCommand::SetActive(active) => {
                if !active {
                    self.shared.borrow_mut().deactivated = true;
                }
                if let Err(e) = self.stream.set_active(active) {
                    warn!("set_active({active}) failed: {e}");
                }
            }
            StreamCommand::RejectModifier { format, modifier } => {
                self.renegotiate_without(format, modifier);
            }
            StreamCommand::Disconnect => {
                self.shared.borrow_mut().deactivated = true;
                let _ = self.stream.disconnect();
            }
        }
    }

    fn renegotiate_without(&self, format: PixelFormat, modifier: u64) {
        let (changed, pods) = {
            let mut shared = self.shared.borrow_mut();
            let per_modifier = shared
                .server_version
                .is_some_and(ServerVersion::supports_modifier_drop);
            let changed = shared.candidates.reject_modifier(format, modifier, per_modifier);
            let pods = build_format_pods(&shared.candidates, shared.max_framerate);
            (changed, pods)
        };
        if !changed {
            return;
        }
        debug!(?format, modifier = format_args!("{modifier:#x}"), "renegotiating after import rejection");
        let mut params: Vec<&Pod> = pods.iter().filter_map(|p| Pod::from_bytes(p)).collect();
        if let Err(e) = self.stream.update_params(&mut params) {
            warn!("renegotiation update_params failed: {e}");
        }
    }
}

impl Drop for LoopStream {
    fn drop(&mut self) {
        let _ = self.stream.disconnect();
    }
}

fn on_state_changed(
    shared: &Rc<RefCell<StreamShared>>,
    old: StreamState,
    new: StreamState,
) {
    trace!("stream state: {old:?} -> {new:?}");
    let mapped = match &new {
        StreamState::Unconnected => SourceState::Unconnected,
        StreamState::Connecting => SourceState::Connecting,
        StreamState::Paused => SourceState::Paused,
        StreamState::Streaming => SourceState::Streaming,
        StreamState::Error(_) => SourceState::Error,
    };
    let mut s = shared.borrow_mut();
    if s.state == mapped {
        return;
    }
    s.state = mapped;
    match &new {
        StreamState::Error(message) => {
            s.emit(StreamEvent::Error(message.clone()));
        }
        StreamState::Unconnected if !s.deactivated => {
            s.emit(StreamEvent::Stopped);
        }
        _ => {}
    }
    s.emit(StreamEvent::StateChanged(mapped));
}

fn on_format_changed(
    stream: &pipewire::stream::StreamRef,
    shared: &Rc<RefCell<StreamShared>>,
    pod: Option<&Pod>,
) {
    let Some(param) = pod else { return };

    let mut info = VideoInfoRaw::default();
    if let Err(e) = info.parse(param) {
        warn!("failed to parse negotiated format: {e:?}");
        return;
    }
    let Some(format) = PixelFormat::from_spa(info.format()) else {
        warn!(format = ?info.format(), "server chose a format we never offered");
        return;
    };

    // DMA-BUF transport is signalled by the presence of the modifier
    // property, not by its value.
    let has_modifier = has_modifier_prop(param);

    let negotiated = NegotiatedFormat {
        format,
        width: info.size().width,
        height: info.size().height,
        framerate: Fraction::new(info.framerate().num, info.framerate().denom.max(1)),
        modifier: has_modifier.then(|| info.modifier()),
    };
    debug!(?negotiated, "format negotiated");

    let pods = build_stream_param_pods(has_modifier);
    let mut params: Vec<&Pod> = pods.iter().filter_map(|p| Pod::from_bytes(p)).collect();
    if let Err(e) = stream.update_params(&mut params) {
        warn!("update_params after format change failed: {e}");
    }

    let mut s = shared.borrow_mut();
    s.negotiated = Some(negotiated);
    s.emit(StreamEvent::ParamsChanged(negotiated));
}

/// Scan a negotiated format pod for the VideoModifier property.
struct ModifierProbe(bool);

impl<'a> PodDeserialize<'a> for ModifierProbe {
    fn deserialize(
        deserializer: PodDeserializer<'a>,
    ) -> std::result::Result<(Self, DeserializeSuccess<'a>), DeserializeError<&'a [u8]>>
    where
        Self: Sized,
    {
        struct ProbeVisitor;
        impl<'de> Visitor<'de> for ProbeVisitor {
            type Value = ModifierProbe;
            type ArrayElem = std::convert::Infallible;

            fn visit_object(
                &self,
                object_deserializer: &mut ObjectPodDeserializer<'de>,
            ) -> std::result::Result<Self::Value, DeserializeError<&'de [u8]>> {
                let mut found = false;
                while let Some((_value, id, _flags)) =
                    object_deserializer.deserialize_property::<Value>()?
                {
                    if id == FormatProperties::VideoModifier.as_raw() {
                        found = true;
                    }
                }
                Ok(ModifierProbe(found))
            }
        }
        deserializer.deserialize_object(ProbeVisitor)
    }
}

fn has_modifier_prop(param: &Pod) -> bool {
    PodDeserializer::deserialize_from::<ModifierProbe>(param.as_bytes())
        .map(|(_, probe)| probe.0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Buffer -> Frame

unsafe fn frame_from_buffer(
    raw: *mut pipewire::sys::pw_buffer,
    shared: &mut StreamShared,
) -> Option<Frame> {
    let Some(negotiated) = shared.negotiated else {
        return None;
    };
    let buffer = &*(*raw).buffer;
    if buffer.n_datas == 0 {
        return None;
    }
    let datas = std::slice::from_raw_parts(buffer.datas, buffer.n_datas as usize);
    let metas = std::slice::from_raw_parts(buffer.metas, buffer.n_metas as usize);

    let mut header: Option<&spa::sys::spa_meta_header> = None;
    let mut cursor = None;
    let mut damage = None;
    for meta in metas {
        match meta.type_ {
            spa::sys::SPA_META_Header if meta.size as usize >= size_of::<spa::sys::spa_meta_header>() => {
                header = Some(&*(meta.data as *const spa::sys::spa_meta_header));
            }
            spa::sys::SPA_META_Cursor => {
                cursor = parse_cursor_meta(meta);
            }
            spa::sys::SPA_META_VideoDamage => {
                damage = parse_damage_meta(meta);
            }
            _ => {}
        }
    }

    if let Some(h) = header {
        if h.flags & spa::sys::SPA_META_HEADER_FLAG_CORRUPTED != 0 {
            warn!("dropping corrupted buffer (header flag)");
            return Some(corrupt_frame(negotiated.format, cursor, damage));
        }
    }

    let data = &datas[0];
    let chunk = &*data.chunk;
    if chunk.flags & spa::sys::SPA_CHUNK_FLAG_CORRUPTED as i32 != 0 {
        warn!("dropping corrupted buffer (chunk flag)");
        return Some(corrupt_frame(negotiated.format, cursor, damage));
    }

    let (pts, sequence) = match header {
        Some(h) => (h.pts, Some(h.seq)),
        None => {
            shared.sequence += 1;
            (monotonic_ns(), Some(shared.sequence))
        }
    };

    let payload = match data.type_ {
        t if t == spa::sys::SPA_DATA_DmaBuf => {
            let mut planes = Vec::with_capacity(datas.len());
            for plane in datas {
                let fd = plane.fd as i32;
                if fd < 0 {
                    return None;
                }
                let chunk = &*plane.chunk;
                let fd = BorrowedFd::borrow_raw(fd).try_clone_to_owned().ok()?;
                planes.push(DmaBufPlane {
                    fd,
                    offset: chunk.offset,
                    stride: chunk.stride as u32,
                });
            }
            FramePayload::DmaBuf(DmaBufAttributes {
                width: negotiated.width,
                height: negotiated.height,
                format: negotiated.format,
                modifier: negotiated.modifier.unwrap_or(DRM_FORMAT_MOD_LINEAR),
                planes,
            })
        }
        t if t == spa::sys::SPA_DATA_MemFd => {
            let region = MappedRegion::map(
                data.fd as i32,
                chunk.size as usize,
                (data.mapoffset + chunk.offset) as usize,
            )?;
            FramePayload::CpuMapped(CpuImage {
                data: CpuBuffer::Mapped(region),
                width: negotiated.width,
                height: negotiated.height,
                stride: chunk.stride as u32,
            })
        }
        t if t == spa::sys::SPA_DATA_MemPtr => {
            if data.data.is_null() {
                return None;
            }
            let bytes = std::slice::from_raw_parts(
                (data.data as *const u8).add(chunk.offset as usize),
                chunk.size as usize,
            );
            FramePayload::CpuMapped(CpuImage {
                data: CpuBuffer::Owned(bytes.to_vec()),
                width: negotiated.width,
                height: negotiated.height,
                stride: chunk.stride as u32,
            })
        }
        other => {
            warn!("unsupported buffer data type {other}");
            return None;
        }
    };

    Some(Frame {
        format: negotiated.format,
        sequence,
        presentation_timestamp: Some(pts),
        payload,
        damage,
        cursor,
    })
}

fn corrupt_frame(
    format: PixelFormat,
    cursor: Option<FrameCursor>,
    damage: Option<Vec<Rect>>,
) -> Frame {
    Frame {
        format,
        sequence: None,
        presentation_timestamp: None,
        payload: FramePayload::Corrupt,
        damage,
        cursor,
    }
}

unsafe fn parse_cursor_meta(meta: &spa::sys::spa_meta) -> Option<FrameCursor> {
    if (meta.size as usize) < size_of::<spa::sys::spa_meta_cursor>() {
        return None;
    }
    let cursor = &*(meta.data as *const spa::sys::spa_meta_cursor);
    if cursor.id == 0 {
        // Invalid cursor: the pointer left the stream.
        return Some(FrameCursor { position: None, hotspot: (0, 0), bitmap: None });
    }

    let mut bitmap = None;
    if cursor.bitmap_offset as usize >= size_of::<spa::sys::spa_meta_cursor>() {
        let raw_bitmap = &*((meta.data as *const u8).add(cursor.bitmap_offset as usize)
            as *const spa::sys::spa_meta_bitmap);
        let width = raw_bitmap.size.width;
        let height = raw_bitmap.size.height;
        if width > 0 && height > 0 && raw_bitmap.offset > 0 {
            let stride = raw_bitmap.stride as usize;
            let pixels = std::slice::from_raw_parts(
                (raw_bitmap as *const spa::sys::spa_meta_bitmap as *const u8)
                    .add(raw_bitmap.offset as usize),
                stride * height as usize,
            );
            let format = spa::param::video::VideoFormat::from_raw(raw_bitmap.format);
            bitmap = PixelFormat::from_spa(format)
                .and_then(|f| convert_to_rgba(f, pixels, stride, width as usize, height as usize))
                .map(|data| CursorBitmap {
                    width,
                    height,
                    hotspot: (cursor.hotspot.x, cursor.hotspot.y),
                    data,
                });
        }
    }

    Some(FrameCursor {
        position: Some((cursor.position.x, cursor.position.y)),
        hotspot: (cursor.hotspot.x, cursor.hotspot.y),
        bitmap,
    })
}

unsafe fn parse_damage_meta(meta: &spa::sys::spa_meta) -> Option<Vec<Rect>> {
    let region_size = size_of::<spa::sys::spa_meta_region>();
    let count = meta.size as usize / region_size;
    if count == 0 {
        return None;
    }
    let regions = std::slice::from_raw_parts(meta.data as *const spa::sys::spa_meta_region, count);
    let rects: Vec<Rect> = regions
        .iter()
        .take_while(|r| r.region.size.width != 0 && r.region.size.height != 0)
        .map(|r| Rect {
            x: r.region.position.x,
            y: r.region.position.y,
            width: r.region.size.width,
            height: r.region.size.height,
        })
        .collect();
    (!rects.is_empty()).then_some(rects)
}

fn monotonic_ns() -> i64 {
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Producer-side handle

static STREAM_IDS: AtomicU64 = AtomicU64::new(1);

/// Handle to a capture stream running on the connection's loop thread.
pub struct SourceStream {
    id: u64,
    connection: Arc<Connection>,
    events: crossbeam_channel::Receiver<StreamEvent>,
}

impl SourceStream {
    pub fn new(
        connection: Arc<Connection>,
        node_id: u32,
        usage: StreamUsage,
        max_framerate: Fraction,
        candidates: FormatCandidates,
    ) -> Result<SourceStream> {
        if node_id == 0 {
            return Err(Error::Config("no PipeWire node id".into()));
        }
        let id = STREAM_IDS.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = crossbeam_channel::bounded(64);
        connection.create_stream(StreamSpec {
            id,
            node_id,
            usage,
            max_framerate,
            candidates,
            events: events_tx,
        })?;
        Ok(SourceStream { id, connection, events: events_rx })
    }

    pub fn events(&self) -> &crossbeam_channel::Receiver<StreamEvent> {
        &self.events
    }

    pub fn set_active(&self, active: bool) {
        self.send(StreamCommand::SetActive(active));
    }

    pub fn reject_modifier(&self, format: PixelFormat, modifier: u64) {
        self.send(StreamCommand::RejectModifier { format, modifier });
    }

    fn send(&self, command: StreamCommand) {
        if self.connection.send_stream_command(self.id, command).is_err() {
            trace!("stream command after loop shutdown, ignored");
        }
    }
}

impl Drop for SourceStream {
    fn drop(&mut self) {
        self.send(StreamCommand::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates_with(mods: &[u64]) -> FormatCandidates {
        FormatCandidates::new(&[(PixelFormat::Bgra, mods.to_vec())], true)
    }

    #[test]
    fn candidates_cover_every_negotiable_format() {
        let c = FormatCandidates::new(&[], true);
        assert_eq!(c.entries.len(), PixelFormat::NEGOTIATION_ORDER.len());
        assert!(c.entries.iter().all(|e| e.modifiers.is_empty()));
    }

    #[test]
    fn rejected_modifier_is_never_offered_again() {
        let mut c = candidates_with(&[0x100, DRM_FORMAT_MOD_LINEAR]);
        assert!(c.reject_modifier(PixelFormat::Bgra, 0x100, true));
        let entry = c.entries.iter().find(|e| e.format == PixelFormat::Bgra).unwrap();
        assert_eq!(entry.modifiers, vec![DRM_FORMAT_MOD_LINEAR]);
        assert!(c.offers_dmabuf());

        // Rejecting again is a no-op.
        assert!(!c.reject_modifier(PixelFormat::Bgra, 0x100, true));
    }

    #[test]
    fn rejecting_last_modifier_disables_dmabuf_for_format() {
        let mut c = candidates_with(&[DRM_FORMAT_MOD_LINEAR]);
        assert!(c.reject_modifier(PixelFormat::Bgra, DRM_FORMAT_MOD_LINEAR, true));
        assert!(c.reject_modifier(PixelFormat::Bgra, DRM_FORMAT_MOD_INVALID, true));
        assert!(!c.offers_dmabuf());
    }

    #[test]
    fn old_server_drops_dmabuf_wholesale() {
        let mut c = candidates_with(&[0x100, 0x200]);
        assert!(c.reject_modifier(PixelFormat::Bgra, 0x100, false));
        assert!(!c.offers_dmabuf());
        // Modifier lists are untouched; the whole path is gone.
        let entry = c.entries.iter().find(|e| e.format == PixelFormat::Bgra).unwrap();
        assert_eq!(entry.modifiers.len(), 2);
    }

    #[test]
    fn format_pods_pair_dmabuf_and_linear_offers() {
        let c = candidates_with(&[DRM_FORMAT_MOD_LINEAR]);
        let pods = build_format_pods(&c, Fraction::new(30, 1));
        // One format has modifiers (2 pods), the rest linear-only.
        assert_eq!(pods.len(), PixelFormat::NEGOTIATION_ORDER.len() + 1);
        assert!(pods.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn dmabuf_disabled_offers_linear_only() {
        let mut c = candidates_with(&[DRM_FORMAT_MOD_LINEAR]);
        c.dmabuf_allowed = false;
        let pods = build_format_pods(&c, Fraction::new(30, 1));
        assert_eq!(pods.len(), PixelFormat::NEGOTIATION_ORDER.len());
    }

    #[test]
    fn stream_param_pods_cover_buffers_and_metas() {
        let pods = build_stream_param_pods(true);
        assert_eq!(pods.len(), 4);
        assert!(pods.iter().all(|p| !p.is_empty()));
    }
}
