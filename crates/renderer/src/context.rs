use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PixelFormat, PixelFormatInfo, RendererError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Reference to a rendered texture plus the metadata the readback needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Minimal surface of a graphics API needed to read textures back to host
/// memory through a dedicated read framebuffer.
///
/// A context is owned by exactly one thread at a time; the download worker
/// takes it by value and is the only code that calls into it afterwards.
pub trait GraphicsContext: Send {
    /// Allocates a read framebuffer. `capacity` is the expected transfer size
    /// in bytes and may be used to pre-size staging storage.
    fn create_read_framebuffer(&mut self, capacity: usize) -> Result<FramebufferId, RendererError>;

    /// `None` restores the default binding.
    fn bind_read_framebuffer(&mut self, framebuffer: Option<FramebufferId>);

    /// Attaches `texture` as the color target of the bound framebuffer, or
    /// detaches the current one when `None`.
    fn attach_texture(&mut self, texture: Option<&TextureHandle>) -> Result<(), RendererError>;

    /// Reads the top-left `width` x `height` region of the attached texture
    /// into `out`, tightly packed in `info`'s layout.
    fn read_pixels(
        &mut self,
        width: u32,
        height: u32,
        info: &PixelFormatInfo,
        out: &mut [u8],
    ) -> Result<(), RendererError>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
}

impl<C: GraphicsContext + ?Sized> GraphicsContext for Box<C> {
    fn create_read_framebuffer(&mut self, capacity: usize) -> Result<FramebufferId, RendererError> {
        (**self).create_read_framebuffer(capacity)
    }

    fn bind_read_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        (**self).bind_read_framebuffer(framebuffer)
    }

    fn attach_texture(&mut self, texture: Option<&TextureHandle>) -> Result<(), RendererError> {
        (**self).attach_texture(texture)
    }

    fn read_pixels(
        &mut self,
        width: u32,
        height: u32,
        info: &PixelFormatInfo,
        out: &mut [u8],
    ) -> Result<(), RendererError> {
        (**self).read_pixels(width, height, info, out)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        (**self).delete_framebuffer(framebuffer)
    }
}
