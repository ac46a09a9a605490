use parking_lot::Mutex;
use pollster::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::{
    ChannelLayout, FramebufferId, GraphicsContext, PixelFormat, PixelFormatInfo, RendererError,
    TextureHandle, TextureId,
};

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Textures the renderer hands to the download thread by id.
///
/// Textures must be created with `TextureUsages::COPY_SRC`.
#[derive(Clone, Default)]
pub struct TextureRegistry {
    inner: Arc<Mutex<HashMap<TextureId, wgpu::Texture>>>,
    next_id: Arc<AtomicU64>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `texture` whose contents are in `format`.
    pub fn register(
        &self,
        texture: wgpu::Texture,
        format: PixelFormat,
    ) -> Result<TextureHandle, RendererError> {
        let info = crate::pixel::get_pixel_format_info(format)?;
        if texture.format() != info.internal_format {
            return Err(RendererError::UnsupportedFormat(format!(
                "{:?} texture registered as {format}",
                texture.format()
            )));
        }
        let id = TextureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TextureHandle {
            id,
            width: texture.width(),
            height: texture.height(),
            format,
        };
        self.inner.lock().insert(id, texture);
        Ok(handle)
    }

    pub fn release(&self, id: TextureId) -> Option<wgpu::Texture> {
        self.inner.lock().remove(&id)
    }
}

struct ReadFramebuffer {
    staging: wgpu::Buffer,
    capacity: u64,
    attachment: Option<TextureHandle>,
}

impl ReadFramebuffer {
    fn new(device: &wgpu::Device, size: u64) -> Self {
        let capacity = align_to_u64(size.max(4), 4);
        Self {
            staging: create_staging(device, capacity),
            capacity,
            attachment: None,
        }
    }

    fn ensure_capacity(&mut self, device: &wgpu::Device, size: u64) {
        if self.capacity >= size {
            return;
        }
        self.capacity = align_to_u64(size.max(4), 4);
        self.staging = create_staging(device, self.capacity);
    }
}

fn create_staging(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("framecache-download-staging"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

/// [`GraphicsContext`] backed by a wgpu device.
///
/// A "read framebuffer" is a staging buffer that grows to the largest
/// transfer seen; reads copy the attached texture into it and block until the
/// map completes.
pub struct WgpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    textures: TextureRegistry,
    framebuffers: HashMap<FramebufferId, ReadFramebuffer>,
    bound: Option<FramebufferId>,
    next_framebuffer: u32,
}

impl WgpuContext {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, textures: TextureRegistry) -> Self {
        Self {
            device,
            queue,
            textures,
            framebuffers: HashMap::new(),
            bound: None,
            next_framebuffer: 1,
        }
    }

    /// Opens the default adapter without a surface.
    pub fn headless(textures: TextureRegistry) -> Result<Self, RendererError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .block_on()
            .ok_or(RendererError::NoAdapter)?;
        info!(adapter = ?adapter.get_info().name, "opened headless adapter");

        let features = adapter.features() & wgpu::Features::TEXTURE_FORMAT_16BIT_NORM;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("framecache-device"),
                    required_features: features,
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .block_on()?;
        Ok(Self::new(Arc::new(device), Arc::new(queue), textures))
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

impl GraphicsContext for WgpuContext {
    fn create_read_framebuffer(&mut self, capacity: usize) -> Result<FramebufferId, RendererError> {
        let id = FramebufferId(self.next_framebuffer);
        self.next_framebuffer += 1;
        self.framebuffers
            .insert(id, ReadFramebuffer::new(&self.device, capacity as u64));
        debug!(framebuffer = id.0, capacity, "created read framebuffer");
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
            if !self.textures.inner.lock().contains_key(&handle.id) {
                return Err(RendererError::UnknownTexture(handle.id));
            }
        }
        if let Some(framebuffer) = self.framebuffers.get_mut(&bound) {
            framebuffer.attachment = texture.copied();
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, info, out), fields(format = info.name))]
    fn read_pixels(
        &mut self,
        width: u32,
        height: u32,
        info: &PixelFormatInfo,
        out: &mut [u8],
    ) -> Result<(), RendererError> {
        let expected = info.buffer_size(width, height);
        if out.len() != expected {
            return Err(RendererError::BufferSizeMismatch {
                expected,
                actual: out.len(),
            });
        }
        let Self {
            device,
            queue,
            textures,
            framebuffers,
            bound,
            ..
        } = self;
        let framebuffer = bound
            .and_then(|id| framebuffers.get_mut(&id))
            .ok_or_else(|| RendererError::Readback("no read framebuffer bound".into()))?;
        let handle = framebuffer
            .attachment
            .ok_or_else(|| RendererError::Readback("no texture attached".into()))?;

        let texel_size = info
            .internal_format
            .block_copy_size(None)
            .ok_or_else(|| RendererError::UnsupportedFormat(info.name.to_string()))?;
        let row_pitch = align_to(width * texel_size, COPY_ALIGNMENT);
        let size = row_pitch as u64 * height as u64;
        framebuffer.ensure_capacity(device, size);

        {
            let registry = textures.inner.lock();
            let texture = registry
                .get(&handle.id)
                .ok_or(RendererError::UnknownTexture(handle.id))?;
            if texture.format() != info.internal_format {
                return Err(RendererError::Readback(format!(
                    "texture is {:?}, transfer expects {:?}",
                    texture.format(),
                    info.internal_format
                )));
            }
            if width > texture.width() || height > texture.height() {
                return Err(RendererError::Readback(format!(
                    "read region {width}x{height} exceeds texture {}x{}",
                    texture.width(),
                    texture.height()
                )));
            }

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("framecache-download"),
            });
            encoder.copy_texture_to_buffer(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyBuffer {
                    buffer: &framebuffer.staging,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(row_pitch),
                        rows_per_image: Some(height),
                    },
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            queue.submit(Some(encoder.finish()));
        }

        let slice = framebuffer.staging.slice(..size);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(RendererError::BufferAsync),
        }

        let mapped = slice.get_mapped_range();
        let texel = texel_size as usize;
        let packed_pixel = info.bytes_per_pixel;
        let dst_row = width as usize * packed_pixel;
        for row in 0..height as usize {
            let src = &mapped[row * row_pitch as usize..][..width as usize * texel];
            let dst = &mut out[row * dst_row..(row + 1) * dst_row];
            match info.pixel_layout {
                ChannelLayout::Rgba => dst.copy_from_slice(src),
                // Storage is RGBA; drop the padding channel.
                ChannelLayout::Rgb => {
                    for (d, s) in dst.chunks_exact_mut(packed_pixel).zip(src.chunks_exact(texel)) {
                        d.copy_from_slice(&s[..packed_pixel]);
                    }
                }
            }
        }
        drop(mapped);
        framebuffer.staging.unmap();
        Ok(())
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer) {
            fb.staging.destroy();
        }
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    if value == 0 {
        return alignment;
    }
    value.div_ceil(alignment) * alignment
}

fn align_to_u64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
