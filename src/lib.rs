//! PipeWire capture-and-encode pipeline.
//!
//! Consumes a live video stream from a PipeWire node (screen cast,
//! camera, virtual monitor), negotiates CPU or DMA-BUF pixel transport,
//! and emits compressed packets through libav codecs - H.264 (VAAPI or
//! software), VP8, VP9, WebP or GIF.
//!
//! The pieces, bottom up:
//!
//! - [`connection::Connection`]: one PipeWire core per daemon fd, loop
//!   on a dedicated thread, shared by every stream on that fd.
//! - [`stream::SourceStream`]: format/modifier negotiation and frame
//!   delivery with cursor and damage metadata.
//! - [`dmabuf::DmaBufImporter`]: EGL-backed readback of GPU frames for
//!   the software encoders.
//! - [`vaapi::VaapiInfo`]: is hardware encode usable, and within which
//!   bounds.
//! - [`encoder::Encoder`]: one codec context plus filter graph per
//!   variant, shared operation set.
//! - [`producer::Producer`]: the three-worker pipeline with bounded
//!   queues and backpressure.
//! - [`EncodedStream`]: the public surface; set a node id and an fd,
//!   flip active, receive packets.
//!
//! ```no_run
//! use pipecast::{EncodedStream, EncoderType};
//!
//! let stream = EncodedStream::new();
//! stream.set_node_id(51);
//! stream.set_fd(0); // default PipeWire connection
//! stream.set_encoder(EncoderType::H264Main);
//! stream.on_packet(|packet| {
//!     println!("{} bytes at {} ms", packet.data.len(), packet.pts);
//! });
//! stream.set_active(true)?;
//! # Ok::<(), pipecast::Error>(())
//! ```

pub mod connection;
pub mod dmabuf;
pub mod encoder;
mod encoded_stream;
pub mod error;
pub mod format;
pub mod frame;
pub mod producer;
pub mod stream;
pub mod vaapi;

pub use connection::{Connection, ConnectionState, ServerVersion};
pub use encoded_stream::{suggested_encoders, EncodedStream, EncodedStreamState};
pub use encoder::{
    CodecOptions, Encoder, EncoderType, EncodingPreference, H264Profile, Packet, Variant,
};
pub use error::{Error, Result};
pub use format::PixelFormat;
pub use frame::{
    CursorBitmap, DmaBufAttributes, DmaBufPlane, Fraction, Frame, FrameCursor, FramePayload, Rect,
};
pub use producer::{Producer, ProducerCallbacks, ProducerOptions};
pub use stream::{NegotiatedFormat, SourceState, SourceStream, StreamEvent, StreamUsage};
pub use vaapi::VaapiInfo;
