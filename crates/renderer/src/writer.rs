//! Disk image writers selected by file extension.

use half::f16;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::openexr::OpenExrEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::{ChannelLayout, ChannelType, PixelFormatInfo, RendererError};

/// Compression used for cache files. Cache frames are rewritten often and
/// read back soon after, so speed wins over size.
pub const DISK_CACHE_COMPRESSION: &str = "fast";

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub channel_type: ChannelType,
    /// `"fast"`, `"best"` or `"default"`; JPEG also takes `"quality:N"`.
    pub compression: String,
}

impl ImageSpec {
    pub fn new(width: u32, height: u32, info: &PixelFormatInfo) -> Self {
        Self {
            width,
            height,
            layout: info.pixel_layout,
            channel_type: info.disk_type,
            compression: DISK_CACHE_COMPRESSION.to_string(),
        }
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = compression.into();
        self
    }

    pub fn image_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.layout.channel_count()
            * self.channel_type.size()
    }
}

/// Writer for a single image file: `open`, one `write_image`, then `close`.
///
/// Nothing appears at the destination path until `close` succeeds.
pub trait ImageOutput: Send {
    fn format_name(&self) -> &'static str;

    fn open(&mut self, path: &Path, spec: &ImageSpec) -> Result<(), RendererError>;

    /// `data` is tightly packed, top row first, laid out as the `ImageSpec` describes.
    fn write_image(&mut self, data: &[u8]) -> Result<(), RendererError>;

    fn close(&mut self) -> Result<(), RendererError>;
}

/// Picks a writer from `path`'s extension; `None` when no writer handles it.
pub fn create_image_output(path: &Path) -> Option<Box<dyn ImageOutput>> {
    match ImageFormat::from_path(path).ok()? {
        format @ (ImageFormat::OpenExr | ImageFormat::Png | ImageFormat::Tiff | ImageFormat::Jpeg) => {
            Some(Box::new(EncodedImageOutput::new(format)))
        }
        _ => None,
    }
}

/// Writes `data` to `path` with the writer chosen by extension.
pub fn write_image(path: &Path, spec: &ImageSpec, data: &[u8]) -> Result<(), RendererError> {
    let mut output = create_image_output(path).ok_or_else(|| RendererError::OutputOpenFailure {
        path: path.to_path_buf(),
        reason: "no image writer for this extension".into(),
    })?;
    output.open(path, spec)?;
    output.write_image(data)?;
    output.close()
}

/// Encodes into a hidden sibling temp file that `close` renames over the
/// destination; dropping it unclosed deletes the temp file.
struct EncodedImageOutput {
    format: ImageFormat,
    target: Option<(PathBuf, ImageSpec, BufWriter<NamedTempFile>)>,
}

impl EncodedImageOutput {
    fn new(format: ImageFormat) -> Self {
        Self {
            format,
            target: None,
        }
    }
}

impl ImageOutput for EncodedImageOutput {
    fn format_name(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("image")
    }

    fn open(&mut self, path: &Path, spec: &ImageSpec) -> Result<(), RendererError> {
        let open_failure = |reason: String| RendererError::OutputOpenFailure {
            path: path.to_path_buf(),
            reason,
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let name = path
            .file_name()
            .ok_or_else(|| open_failure("path has no file name".into()))?;
        let file = tempfile::Builder::new()
            .prefix(&format!(".{}.", name.to_string_lossy()))
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| open_failure(e.to_string()))?;
        self.target = Some((path.to_path_buf(), spec.clone(), BufWriter::new(file)));
        Ok(())
    }

    fn write_image(&mut self, data: &[u8]) -> Result<(), RendererError> {
        let (_, spec, writer) = self
            .target
            .as_mut()
            .ok_or_else(|| RendererError::Write("image output is not open".into()))?;
        if data.len() != spec.image_size() {
            return Err(RendererError::BufferSizeMismatch {
                expected: spec.image_size(),
                actual: data.len(),
            });
        }
        let image = to_dynamic_image(spec, data)?;
        let (width, height) = (spec.width, spec.height);
        match self.format {
            ImageFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    writer,
                    png_compression(&spec.compression),
                    FilterType::Adaptive,
                );
                to_integer(image).write_with_encoder(encoder)?;
            }
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(writer, jpeg_quality(&spec.compression));
                DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
            }
            ImageFormat::Tiff => {
                to_integer(image).write_with_encoder(TiffEncoder::new(writer))?;
            }
            ImageFormat::OpenExr => {
                let float = match spec.layout {
                    ChannelLayout::Rgb => DynamicImage::ImageRgb32F(image.to_rgb32f()),
                    ChannelLayout::Rgba => DynamicImage::ImageRgba32F(image.to_rgba32f()),
                };
                float.write_with_encoder(OpenExrEncoder::new(writer))?;
            }
            other => {
                return Err(RendererError::Write(format!("no encoder for {other:?}")));
            }
        }
        tracing::trace!(width, height, format = self.format_name(), "encoded image");
        Ok(())
    }

    fn close(&mut self) -> Result<(), RendererError> {
        if let Some((path, _, writer)) = self.target.take() {
            let file = writer
                .into_inner()
                .map_err(|e| RendererError::Write(format!("{}: {}", path.display(), e.error())))?;
            file.persist(&path)
                .map_err(|e| RendererError::Write(format!("{}: {}", path.display(), e.error)))?;
        }
        Ok(())
    }
}

fn png_compression(directive: &str) -> CompressionType {
    match directive {
        "fast" => CompressionType::Fast,
        "best" => CompressionType::Best,
        _ => CompressionType::Default,
    }
}

fn jpeg_quality(directive: &str) -> u8 {
    directive
        .strip_prefix("quality:")
        .and_then(|q| q.parse::<u8>().ok())
        .map(|q| q.clamp(1, 100))
        .unwrap_or(JPEG_QUALITY)
}

/// PNG and TIFF take 8/16-bit integers only.
fn to_integer(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
        DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
        other => other,
    }
}

fn to_dynamic_image(spec: &ImageSpec, data: &[u8]) -> Result<DynamicImage, RendererError> {
    let (w, h) = (spec.width, spec.height);
    let mismatch = || RendererError::Write(format!("buffer does not describe a {w}x{h} image"));
    let image = match (spec.layout, spec.channel_type) {
        (ChannelLayout::Rgb, ChannelType::U8) => {
            DynamicImage::ImageRgb8(ImageBuffer::from_raw(w, h, data.to_vec()).ok_or_else(mismatch)?)
        }
        (ChannelLayout::Rgba, ChannelType::U8) => {
            DynamicImage::ImageRgba8(ImageBuffer::from_raw(w, h, data.to_vec()).ok_or_else(mismatch)?)
        }
        (ChannelLayout::Rgb, ChannelType::U16) => DynamicImage::ImageRgb16(
            ImageBuffer::from_raw(w, h, bytemuck::pod_collect_to_vec::<u8, u16>(data))
                .ok_or_else(mismatch)?,
        ),
        (ChannelLayout::Rgba, ChannelType::U16) => DynamicImage::ImageRgba16(
            ImageBuffer::from_raw(w, h, bytemuck::pod_collect_to_vec::<u8, u16>(data))
                .ok_or_else(mismatch)?,
        ),
        (layout, ChannelType::F16) => {
            let samples: Vec<f32> = bytemuck::pod_collect_to_vec::<u8, f16>(data)
                .into_iter()
                .map(f16::to_f32)
                .collect();
            float_image(layout, w, h, samples).ok_or_else(mismatch)?
        }
        (layout, ChannelType::F32) => {
            float_image(layout, w, h, bytemuck::pod_collect_to_vec::<u8, f32>(data))
                .ok_or_else(mismatch)?
        }
    };
    Ok(image)
}

fn float_image(layout: ChannelLayout, w: u32, h: u32, samples: Vec<f32>) -> Option<DynamicImage> {
    Some(match layout {
        ChannelLayout::Rgb => DynamicImage::ImageRgb32F(ImageBuffer::from_raw(w, h, samples)?),
        ChannelLayout::Rgba => DynamicImage::ImageRgba32F(ImageBuffer::from_raw(w, h, samples)?),
    })
}
