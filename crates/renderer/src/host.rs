use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pixel::convert_pixel_format;
use crate::{
    Frame, FramebufferId, GraphicsContext, PixelFormatInfo, RendererError, TextureHandle,
    TextureId,
};

/// Texture store of a [`HostContext`], shared with whoever renders frames.
#[derive(Clone, Default)]
pub struct HostTextures {
    inner: Arc<Mutex<HashMap<TextureId, Frame>>>,
    next_id: Arc<AtomicU64>,
}

impl HostTextures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload(&self, frame: Frame) -> TextureHandle {
        let id = TextureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TextureHandle {
            id,
            width: frame.width,
            height: frame.height,
            format: frame.format,
        };
        self.inner.lock().insert(id, frame);
        handle
    }

    pub fn release(&self, id: TextureId) -> Option<Frame> {
        self.inner.lock().remove(&id)
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// CPU-only [`GraphicsContext`] for headless rendering and tests.
///
/// Reads convert from the texture's format to the requested transfer format
/// the way a GL implementation converts in `glReadPixels`.
pub struct HostContext {
    textures: HostTextures,
    framebuffers: HashMap<FramebufferId, Option<TextureHandle>>,
    bound: Option<FramebufferId>,
    next_framebuffer: u32,
}

impl HostContext {
    pub fn new(textures: HostTextures) -> Self {
        Self {
            textures,
            framebuffers: HashMap::new(),
            bound: None,
            next_framebuffer: 1,
        }
    }

    pub fn textures(&self) -> &HostTextures {
        &self.textures
    }

    pub fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.bound
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }
}

impl GraphicsContext for HostContext {
    fn create_read_framebuffer(&mut self, _capacity: usize) -> Result<FramebufferId, RendererError> {
        let id = FramebufferId(self.next_framebuffer);
        self.next_framebuffer += 1;
        self.framebuffers.insert(id, None);
        Ok(id)
    }

    fn bind_read_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.bound = framebuffer.filter(|id| self.framebuffers.contains_key(id));
    }

    fn attach_texture(&mut self, texture: Option<&TextureHandle>) -> Result<(), RendererError> {
        let Some(bound) = self.bound else {
            return match texture {
                Some(_) => Err(RendererError::Readback("no read framebuffer bound".into())),
                None => Ok(()),
            };
        };
        if let Some(handle) = texture {
            if !self.textures.contains(handle.id) {
                return Err(RendererError::UnknownTexture(handle.id));
            }
        }
        self.framebuffers.insert(bound, texture.copied());
        Ok(())
    }

    fn read_pixels(
        &mut self,
        width: u32,
        height: u32,
        info: &PixelFormatInfo,
        out: &mut [u8],
    ) -> Result<(), RendererError> {
        let bound = self
            .bound
            .ok_or_else(|| RendererError::Readback("no read framebuffer bound".into()))?;
        let handle = self
            .framebuffers
            .get(&bound)
            .copied()
            .flatten()
            .ok_or_else(|| RendererError::Readback("no texture attached".into()))?;

        let expected = info.buffer_size(width, height);
        if out.len() != expected {
            return Err(RendererError::BufferSizeMismatch {
                expected,
                actual: out.len(),
            });
        }

        let frame = self
            .textures
            .inner
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or(RendererError::UnknownTexture(handle.id))?;
        if width > frame.width || height > frame.height {
            return Err(RendererError::Readback(format!(
                "read region {width}x{height} exceeds texture {}x{}",
                frame.width, frame.height
            )));
        }

        let converted = convert_pixel_format(Arc::new(frame), info.format)?;
        let src_row = converted.width as usize * info.bytes_per_pixel;
        let dst_row = width as usize * info.bytes_per_pixel;
        for row in 0..height as usize {
            let src = &converted.data[row * src_row..row * src_row + dst_row];
            out[row * dst_row..(row + 1) * dst_row].copy_from_slice(src);
        }
        Ok(())
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }
}
