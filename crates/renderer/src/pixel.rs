//! Pixel format metadata shared by the GPU transfer path and CPU code.
//!
//! Every buffer that crosses the GPU/host boundary is sized and interpreted
//! through [`PixelFormatInfo`], so the readback worker, the image writers and
//! the frame converters always agree on layout.

use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::RendererError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Rgb16U,
    Rgba16U,
    Rgb16F,
    Rgba16F,
    Rgb32F,
    Rgba32F,
    // Decoder-side formats; they never take the transfer path.
    Bgra8,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    P010,
}

impl PixelFormat {
    pub const TRANSFERABLE: [PixelFormat; 8] = [
        PixelFormat::Rgb8,
        PixelFormat::Rgba8,
        PixelFormat::Rgb16U,
        PixelFormat::Rgba16U,
        PixelFormat::Rgb16F,
        PixelFormat::Rgba16F,
        PixelFormat::Rgb32F,
        PixelFormat::Rgba32F,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Rgb16U => "rgb16u",
            PixelFormat::Rgba16U => "rgba16u",
            PixelFormat::Rgb16F => "rgb16f",
            PixelFormat::Rgba16F => "rgba16f",
            PixelFormat::Rgb32F => "rgb32f",
            PixelFormat::Rgba32F => "rgba32f",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::P010 => "p010",
        }
    }

    /// The 4-channel format with the same channel type.
    pub fn with_alpha(&self) -> Result<PixelFormat, RendererError> {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => Ok(PixelFormat::Rgba8),
            PixelFormat::Rgb16U | PixelFormat::Rgba16U => Ok(PixelFormat::Rgba16U),
            PixelFormat::Rgb16F | PixelFormat::Rgba16F => Ok(PixelFormat::Rgba16F),
            PixelFormat::Rgb32F | PixelFormat::Rgba32F => Ok(PixelFormat::Rgba32F),
            other => Err(RendererError::UnsupportedFormat(other.name().to_string())),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = RendererError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PixelFormat::TRANSFERABLE
            .iter()
            .chain(&[
                PixelFormat::Bgra8,
                PixelFormat::Yuv420p,
                PixelFormat::Yuv422p,
                PixelFormat::Yuv444p,
                PixelFormat::Nv12,
                PixelFormat::P010,
            ])
            .find(|format| format.name() == wanted)
            .copied()
            .ok_or_else(|| RendererError::UnsupportedFormat(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub fn channel_count(&self) -> usize {
        match self {
            ChannelLayout::Rgb => 3,
            ChannelLayout::Rgba => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    U8,
    U16,
    F16,
    F32,
}

impl ChannelType {
    pub fn size(&self) -> usize {
        match self {
            ChannelType::U8 => 1,
            ChannelType::U16 | ChannelType::F16 => 2,
            ChannelType::F32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ChannelType::F16 | ChannelType::F32)
    }

    /// Reads one native-endian sample normalized to `0.0..=1.0` for integers.
    fn decode(&self, bytes: &[u8]) -> f32 {
        match self {
            ChannelType::U8 => bytes[0] as f32 / 255.0,
            ChannelType::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 65535.0,
            ChannelType::F16 => f16::from_ne_bytes([bytes[0], bytes[1]]).to_f32(),
            ChannelType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    fn encode(&self, value: f32, out: &mut Vec<u8>) {
        match self {
            ChannelType::U8 => out.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
            ChannelType::U16 => out.extend_from_slice(
                &((value.clamp(0.0, 1.0) * 65535.0).round() as u16).to_ne_bytes(),
            ),
            ChannelType::F16 => out.extend_from_slice(&f16::from_f32(value).to_ne_bytes()),
            ChannelType::F32 => out.extend_from_slice(&value.to_ne_bytes()),
        }
    }

    /// Encoded sample for full opacity.
    pub fn opaque(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.encode(1.0, &mut out);
        out
    }
}

/// Transfer metadata for a [`PixelFormat`].
#[derive(Debug, Clone, PartialEq)]
pub struct PixelFormatInfo {
    pub format: PixelFormat,
    pub name: &'static str,
    /// Storage format of GPU textures holding this format. RGB formats are
    /// stored padded to RGBA on the GPU and repacked during transfer.
    pub internal_format: wgpu::TextureFormat,
    pub pixel_layout: ChannelLayout,
    pub pixel_type: ChannelType,
    pub bytes_per_pixel: usize,
    /// Sample type handed to image writers.
    pub disk_type: ChannelType,
}

impl PixelFormatInfo {
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel
    }

    pub fn bytes_per_channel(&self) -> usize {
        self.pixel_type.size()
    }
}

pub fn get_pixel_format_info(format: PixelFormat) -> Result<PixelFormatInfo, RendererError> {
    let (internal_format, pixel_layout, pixel_type) = match format {
        PixelFormat::Rgb8 => (wgpu::TextureFormat::Rgba8Unorm, ChannelLayout::Rgb, ChannelType::U8),
        PixelFormat::Rgba8 => (wgpu::TextureFormat::Rgba8Unorm, ChannelLayout::Rgba, ChannelType::U8),
        PixelFormat::Rgb16U => (wgpu::TextureFormat::Rgba16Unorm, ChannelLayout::Rgb, ChannelType::U16),
        PixelFormat::Rgba16U => (wgpu::TextureFormat::Rgba16Unorm, ChannelLayout::Rgba, ChannelType::U16),
        PixelFormat::Rgb16F => (wgpu::TextureFormat::Rgba16Float, ChannelLayout::Rgb, ChannelType::F16),
        PixelFormat::Rgba16F => (wgpu::TextureFormat::Rgba16Float, ChannelLayout::Rgba, ChannelType::F16),
        PixelFormat::Rgb32F => (wgpu::TextureFormat::Rgba32Float, ChannelLayout::Rgb, ChannelType::F32),
        PixelFormat::Rgba32F => (wgpu::TextureFormat::Rgba32Float, ChannelLayout::Rgba, ChannelType::F32),
        other => return Err(RendererError::UnsupportedFormat(other.name().to_string())),
    };
    Ok(PixelFormatInfo {
        format,
        name: format.name(),
        internal_format,
        pixel_layout,
        pixel_type,
        bytes_per_pixel: pixel_layout.channel_count() * pixel_type.size(),
        disk_type: pixel_type,
    })
}

pub fn bytes_per_pixel(format: PixelFormat) -> Result<usize, RendererError> {
    Ok(get_pixel_format_info(format)?.bytes_per_pixel)
}

pub fn bytes_per_channel(format: PixelFormat) -> Result<usize, RendererError> {
    Ok(get_pixel_format_info(format)?.bytes_per_channel())
}

/// Minimum buffer size for a `width` x `height` image, always
/// `width * height * bytes_per_pixel(format)`.
pub fn get_buffer_size(format: PixelFormat, width: u32, height: u32) -> Result<usize, RendererError> {
    Ok(get_pixel_format_info(format)?.buffer_size(width, height))
}

/// Tightly packed host-side image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

pub type FramePtr = Arc<Frame>;

impl Frame {
    /// Zero-filled frame.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, RendererError> {
        let size = get_buffer_size(format, width, height)?;
        Ok(Self {
            width,
            height,
            format,
            data: vec![0; size],
        })
    }

    pub fn from_data(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, RendererError> {
        let expected = get_buffer_size(format, width, height)?;
        if data.len() != expected {
            return Err(RendererError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn bytes_per_row(&self) -> Result<usize, RendererError> {
        Ok(self.width as usize * bytes_per_pixel(self.format)?)
    }
}

/// Converts `frame` to `dest_format`.
///
/// Returns the very same `Arc` when the frame is already in `dest_format`.
/// Alpha added by the conversion is fully opaque; alpha removed is dropped.
pub fn convert_pixel_format(
    frame: FramePtr,
    dest_format: PixelFormat,
) -> Result<FramePtr, RendererError> {
    if frame.format == dest_format {
        return Ok(frame);
    }
    let src = get_pixel_format_info(frame.format)?;
    let dst = get_pixel_format_info(dest_format)?;
    let expected = src.buffer_size(frame.width, frame.height);
    if frame.data.len() != expected {
        return Err(RendererError::BufferSizeMismatch {
            expected,
            actual: frame.data.len(),
        });
    }

    let src_channels = src.pixel_layout.channel_count();
    let dst_channels = dst.pixel_layout.channel_count();
    let src_size = src.pixel_type.size();
    let opaque = dst.pixel_type.opaque();
    let mut data = Vec::with_capacity(dst.buffer_size(frame.width, frame.height));

    for pixel in frame.data.chunks_exact(src.bytes_per_pixel) {
        for channel in 0..dst_channels {
            if channel >= src_channels {
                data.extend_from_slice(&opaque);
                continue;
            }
            let sample = &pixel[channel * src_size..(channel + 1) * src_size];
            if src.pixel_type == dst.pixel_type {
                data.extend_from_slice(sample);
            } else {
                dst.pixel_type.encode(src.pixel_type.decode(sample), &mut data);
            }
        }
    }

    Ok(Arc::new(Frame {
        width: frame.width,
        height: frame.height,
        format: dest_format,
        data,
    }))
}

/// Expands a 3-channel frame to 4 channels in place with opaque alpha.
///
/// RGB samples are copied byte for byte. Frames that already carry alpha are
/// left untouched.
pub fn convert_rgb_to_rgba(frame: &mut Frame) -> Result<(), RendererError> {
    let info = get_pixel_format_info(frame.format)?;
    if info.pixel_layout == ChannelLayout::Rgba {
        return Ok(());
    }
    let expected = info.buffer_size(frame.width, frame.height);
    if frame.data.len() != expected {
        return Err(RendererError::BufferSizeMismatch {
            expected,
            actual: frame.data.len(),
        });
    }

    let dest_format = frame.format.with_alpha()?;
    let opaque = info.pixel_type.opaque();
    let mut data = Vec::with_capacity(get_buffer_size(dest_format, frame.width, frame.height)?);
    for pixel in frame.data.chunks_exact(info.bytes_per_pixel) {
        data.extend_from_slice(pixel);
        data.extend_from_slice(&opaque);
    }
    frame.data = data;
    frame.format = dest_format;
    Ok(())
}
