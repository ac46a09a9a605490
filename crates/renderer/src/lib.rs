use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

mod config;
mod context;
mod download;
mod gpu;
mod hash;
mod host;
pub mod pixel;
mod writer;

pub use config::RendererConfig;
pub use context::{FramebufferId, GraphicsContext, TextureHandle, TextureId};
pub use download::{DownloadEvent, DownloadQueue, DownloadQueueEntry, DownloadThread};
pub use gpu::{TextureRegistry, WgpuContext};
pub use hash::FrameHash;
pub use host::{HostContext, HostTextures};
pub use pixel::{
    ChannelLayout, ChannelType, Frame, FramePtr, PixelFormat, PixelFormatInfo,
};
pub use writer::{
    create_image_output, write_image, ImageOutput, ImageSpec, DISK_CACHE_COMPRESSION,
};

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Request device error: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("No suitable GPU adapter")]
    NoAdapter,
    #[error("Buffer async error")]
    BufferAsync,
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to open output file {path:?}: {reason}")]
    OutputOpenFailure { path: PathBuf, reason: String },
    #[error("Failed to write image: {0}")]
    Write(String),
    #[error("Readback failed: {0}")]
    Readback(String),
    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },
    #[error("Unknown texture {0}")]
    UnknownTexture(TextureId),
    #[error("Download thread stopped")]
    Stopped,
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Output dimensions and transfer format shared by a render session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoRenderingParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl VideoRenderingParams {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && pixel::get_pixel_format_info(self.format).is_ok()
    }

    pub fn buffer_size(&self) -> Result<usize, RendererError> {
        pixel::get_buffer_size(self.format, self.width, self.height)
    }
}
