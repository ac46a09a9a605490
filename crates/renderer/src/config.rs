//! Renderer configuration: output size, transfer format and disk cache
//! location.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{create_image_output, FrameHash, PixelFormat, RendererError, VideoRenderingParams};

pub const ENV_CACHE_DIR: &str = "FRAMECACHE_CACHE_DIR";
pub const ENV_CACHE_EXT: &str = "FRAMECACHE_CACHE_EXT";
pub const ENV_FORMAT: &str = "FRAMECACHE_FORMAT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Directory cache files are written to.
    pub cache_dir: PathBuf,
    /// Extension of cache files; selects the image writer.
    pub cache_extension: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: PixelFormat::Rgba16F,
            cache_dir: std::env::temp_dir().join("framecache"),
            cache_extension: "exr".to_string(),
        }
    }
}

impl RendererConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, RendererError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| RendererError::Config(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), RendererError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RendererError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Applies `FRAMECACHE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), RendererError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), RendererError> {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(ext) = lookup(ENV_CACHE_EXT) {
            self.cache_extension = ext.trim_start_matches('.').to_string();
        }
        if let Some(format) = lookup(ENV_FORMAT) {
            self.format = format
                .parse()
                .map_err(|e| RendererError::Config(format!("{ENV_FORMAT}: {e}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RendererError> {
        if self.width == 0 || self.height == 0 {
            return Err(RendererError::Config(format!(
                "output size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        crate::pixel::get_pixel_format_info(self.format)?;
        let sample = Path::new("frame").with_extension(&self.cache_extension);
        if create_image_output(&sample).is_none() {
            return Err(RendererError::Config(format!(
                "no image writer for extension {:?}",
                self.cache_extension
            )));
        }
        Ok(())
    }

    pub fn params(&self) -> VideoRenderingParams {
        VideoRenderingParams::new(self.width, self.height, self.format)
    }

    /// File a frame with `hash` is cached at.
    pub fn cache_path(&self, hash: &FrameHash) -> PathBuf {
        self.cache_dir
            .join(hash.to_hex())
            .with_extension(&self.cache_extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RendererConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("renderer.json");
        let config = RendererConfig {
            width: 640,
            height: 360,
            format: PixelFormat::Rgb8,
            cache_dir: dir.path().join("cache"),
            cache_extension: "png".into(),
        };
        config.save(&path).unwrap();
        assert_eq!(RendererConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renderer.json");
        std::fs::write(&path, r#"{"width": 320, "format": "rgba8"}"#).unwrap();
        let config = RendererConfig::load(&path).unwrap();
        assert_eq!(config.width, 320);
        assert_eq!(config.height, 1080);
        assert_eq!(config.format, PixelFormat::Rgba8);
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_CACHE_DIR, "/var/cache/frames"),
            (ENV_CACHE_EXT, ".tiff"),
            (ENV_FORMAT, "rgb16u"),
        ]
        .into_iter()
        .collect();
        let mut config = RendererConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/frames"));
        assert_eq!(config.cache_extension, "tiff");
        assert_eq!(config.format, PixelFormat::Rgb16U);

        let err = config
            .apply_overrides(|k| (k == ENV_FORMAT).then(|| "nv12x".to_string()))
            .unwrap_err();
        assert!(matches!(err, RendererError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut config = RendererConfig::default();
        assert!(config.validate().is_ok());
        config.cache_extension = "xyz".into();
        assert!(config.validate().is_err());
        config.cache_extension = "png".into();
        config.format = PixelFormat::Nv12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cache_path_uses_hash_and_extension() {
        let config = RendererConfig {
            cache_dir: PathBuf::from("/cache"),
            cache_extension: "exr".into(),
            ..RendererConfig::default()
        };
        let hash = FrameHash::from_bytes([0xab; 32]);
        assert_eq!(
            config.cache_path(&hash),
            PathBuf::from(format!("/cache/{}.exr", "ab".repeat(32)))
        );
    }
}
