//! DMA-BUF import: bridge GPU frames into CPU memory for software
//! encoders, and answer "what can the GPU import" during negotiation.
//!
//! The GL context is single-threaded; a [`DmaBufImporter`] must be
//! created and used on one thread only. The capability snapshot is a
//! process singleton so negotiation does not need a GL context at all.

use std::os::fd::AsFd;

use once_cell::sync::Lazy;
use smithay::backend::allocator::dmabuf::{Dmabuf, DmabufFlags};
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::backend::drm::{DrmNode, NodeType};
use smithay::backend::egl::{EGLContext, EGLDevice, EGLDisplay};
use smithay::backend::renderer::gles::GlesRenderer;
use smithay::backend::renderer::{ExportMem, ImportDma};
use smithay::utils::Rectangle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::frame::{CpuBuffer, CpuImage, DmaBufAttributes};

/// Why a DMA-BUF frame could not be turned into a CPU image.
#[derive(Debug)]
pub enum ImportFailure {
    /// This (format, modifier) combination was refused; the stream
    /// should renegotiate without it.
    Rejected { format: PixelFormat, modifier: u64 },
    /// No EGL at all; every DMA-BUF frame will fail.
    Unavailable,
}

/// What the GPU can import, probed once per process.
pub struct GpuCapabilities {
    render_node: Option<DrmNode>,
    /// Importable (and renderable, hence readable) format/modifier sets.
    /// External-only formats are already excluded.
    formats: Vec<(PixelFormat, Vec<u64>)>,
}

static GPU_CAPS: Lazy<GpuCapabilities> = Lazy::new(GpuCapabilities::probe);

impl GpuCapabilities {
    pub fn get() -> &'static GpuCapabilities {
        &GPU_CAPS
    }

    fn probe() -> GpuCapabilities {
        match Self::try_probe() {
            Ok(caps) => caps,
            Err(e) => {
                warn!("GPU capability probe failed, DMA-BUF import disabled: {e}");
                GpuCapabilities { render_node: None, formats: Vec::new() }
            }
        }
    }

    fn try_probe() -> Result<GpuCapabilities> {
        let (node, device) = find_render_device()?;
        let display = unsafe { EGLDisplay::new(device) }
            .map_err(|e| Error::Resource(format!("EGLDisplay: {e:?}")))?;

        let mut formats: Vec<(PixelFormat, Vec<u64>)> = Vec::new();
        for entry in display.dmabuf_render_formats().iter() {
            let Some(format) = PixelFormat::from_drm_fourcc(entry.code) else {
                continue;
            };
            let modifier: u64 = entry.modifier.into();
            match formats.iter_mut().find(|(f, _)| *f == format) {
                Some((_, mods)) => {
                    if !mods.contains(&modifier) {
                        mods.push(modifier);
                    }
                }
                None => formats.push((format, vec![modifier])),
            }
        }
        info!(
            node = ?node.dev_path(),
            formats = formats.len(),
            "GPU DMA-BUF import capabilities probed"
        );
        Ok(GpuCapabilities { render_node: Some(node), formats })
    }

    pub fn available(&self) -> bool {
        self.render_node.is_some() && !self.formats.is_empty()
    }

    pub fn render_node(&self) -> Option<&DrmNode> {
        self.render_node.as_ref()
    }

    pub fn formats(&self) -> &[(PixelFormat, Vec<u64>)] {
        &self.formats
    }

    pub fn modifiers_for(&self, format: PixelFormat) -> &[u64] {
        self.formats
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[])
    }
}

fn find_render_device() -> Result<(DrmNode, EGLDevice)> {
    let devices = EGLDevice::enumerate()
        .map_err(|e| Error::Resource(format!("EGLDevice enumeration: {e:?}")))?;
    for device in devices {
        let Ok(Some(node)) = device.try_get_render_node() else {
            continue;
        };
        let node = node
            .node_with_type(NodeType::Render)
            .and_then(std::result::Result::ok)
            .unwrap_or(node);
        return Ok((node, device));
    }
    // Documented fallback when no EGLDevice advertises a node.
    let node = DrmNode::from_path("/dev/dri/renderD128")
        .map_err(|e| Error::Resource(format!("no render node: {e:?}")))?;
    let device = EGLDevice::enumerate()
        .map_err(|e| Error::Resource(format!("EGLDevice enumeration: {e:?}")))?
        .next()
        .ok_or_else(|| Error::Resource("no EGL device".into()))?;
    Ok((node, device))
}

/// Imports DMA-BUF frames as GL textures and reads them back as RGBA.
pub struct DmaBufImporter {
    renderer: GlesRenderer,
}

impl DmaBufImporter {
    pub fn new() -> Result<DmaBufImporter> {
        let caps = GpuCapabilities::get();
        let node = caps
            .render_node()
            .ok_or_else(|| Error::Resource("no usable render node".into()))?;
        let device = EGLDevice::enumerate()
            .map_err(|e| Error::Resource(format!("EGLDevice enumeration: {e:?}")))?
            .find(|d| d.try_get_render_node().unwrap_or_default().as_ref() == Some(node))
            .ok_or_else(|| Error::Resource("no EGL device for render node".into()))?;
        let display = unsafe { EGLDisplay::new(device) }
            .map_err(|e| Error::Resource(format!("EGLDisplay: {e:?}")))?;
        let context = EGLContext::new(&display)
            .map_err(|e| Error::Resource(format!("EGLContext: {e:?}")))?;
        let renderer = unsafe { GlesRenderer::new(context) }
            .map_err(|e| Error::Resource(format!("GlesRenderer: {e:?}")))?;
        Ok(DmaBufImporter { renderer })
    }

    /// Import `attrs` and read the pixels back into a tightly-packed
    /// RGBA image.
    pub fn download(
        &mut self,
        attrs: &DmaBufAttributes,
    ) -> std::result::Result<CpuImage, ImportFailure> {
        let rejected = || ImportFailure::Rejected {
            format: attrs.format,
            modifier: attrs.modifier,
        };

        let fourcc: Fourcc = attrs.format.to_drm_fourcc().ok_or_else(rejected)?;
        let mut builder = Dmabuf::builder(
            (attrs.width as i32, attrs.height as i32),
            fourcc,
            Modifier::from(attrs.modifier),
            DmabufFlags::empty(),
        );
        for (idx, plane) in attrs.planes.iter().enumerate() {
            let fd = plane
                .fd
                .as_fd()
                .try_clone_to_owned()
                .map_err(|_| rejected())?;
            builder.add_plane(fd, idx as u32, plane.offset, plane.stride);
        }
        let dmabuf = builder.build().ok_or_else(rejected)?;

        let texture = self.renderer.import_dmabuf(&dmabuf, None).map_err(|e| {
            debug!(
                format = ?attrs.format,
                modifier = format_args!("{:#x}", attrs.modifier),
                "EGLImage import failed: {e}"
            );
            rejected()
        })?;

        let region = Rectangle::from_size((attrs.width as i32, attrs.height as i32).into());
        let mapping = self
            .renderer
            .copy_texture(&texture, region, Fourcc::Abgr8888)
            .map_err(|e| {
                debug!("texture readback failed: {e}");
                rejected()
            })?;
        let bytes = self
            .renderer
            .map_texture(&mapping)
            .map_err(|_| rejected())?;

        Ok(CpuImage {
            data: CpuBuffer::Owned(bytes.to_vec()),
            width: attrs.width,
            height: attrs.height,
            stride: attrs.width * 4,
        })
    }
}
