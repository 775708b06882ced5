//! Error kinds, split by the pipeline stage that produced them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing caller-supplied configuration: no node id, no fd,
    /// an encoder that is not compiled in, or a size the hardware
    /// encoder cannot accept.
    #[error("configuration: {0}")]
    Config(String),

    /// Stream negotiation with the PipeWire daemon failed.
    #[error("negotiation: {0}")]
    Negotiation(String),

    /// A single frame could not be processed. Local; the stream continues.
    #[error("frame: {0}")]
    Frame(String),

    /// libav returned an error other than EAGAIN/EOF.
    #[error("encoder: {0}")]
    Encoder(#[from] ffmpeg_next::Error),

    /// A device-level resource could not be acquired: render node, GBM
    /// device, EGL display, or the VAAPI device a hardware encoder needs.
    #[error("resource: {0}")]
    Resource(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
