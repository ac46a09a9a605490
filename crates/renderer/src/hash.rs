//! Frame identity used to name cache files and report completed downloads.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{RendererError, VideoRenderingParams};

/// SHA-256 digest identifying one rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FrameHash([u8; 32]);

impl FrameHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest of the output parameters plus a caller-supplied description
    /// of what the frame shows. Equal inputs always map to the same file.
    pub fn compute(params: &VideoRenderingParams, description: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(params.width.to_le_bytes());
        hasher.update(params.height.to_le_bytes());
        hasher.update(params.format.name().as_bytes());
        hasher.update((description.len() as u64).to_le_bytes());
        hasher.update(description);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for FrameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for FrameHash {
    type Err = RendererError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| RendererError::Config(format!("invalid frame hash {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl From<FrameHash> for String {
    fn from(hash: FrameHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for FrameHash {
    type Error = RendererError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    #[test]
    fn deterministic_and_parameter_sensitive() {
        let hd = VideoRenderingParams::new(1920, 1080, PixelFormat::Rgba16F);
        let sd = VideoRenderingParams::new(720, 480, PixelFormat::Rgba16F);
        assert_eq!(FrameHash::compute(&hd, b"clip a @ 1/2"), FrameHash::compute(&hd, b"clip a @ 1/2"));
        assert_ne!(FrameHash::compute(&hd, b"clip a @ 1/2"), FrameHash::compute(&sd, b"clip a @ 1/2"));
        assert_ne!(FrameHash::compute(&hd, b"clip a @ 1/2"), FrameHash::compute(&hd, b"clip a @ 1"));
    }

    #[test]
    fn hex_round_trip() {
        let hash = FrameHash::compute(&VideoRenderingParams::new(4, 4, PixelFormat::Rgba8), b"x");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<FrameHash>().unwrap(), hash);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{text}\""));
        assert!("zz".parse::<FrameHash>().is_err());
    }
}
