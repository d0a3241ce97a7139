//! Frame inspection seam. The header inspector validates without decoding
//! pixels; a decoder-backed implementation can replace it behind the trait.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::error::ValidationReason;
use crate::snap::config::LookoutConfig;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_file_bytes: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl ImageLimits {
    pub fn from_config(cfg: &LookoutConfig) -> Self {
        Self {
            max_file_bytes: cfg.max_file_size_bytes(),
            min_width: cfg.images.min_width,
            min_height: cfg.images.min_height,
            max_width: cfg.images.max_width,
            max_height: cfg.images.max_height,
        }
    }
}

pub trait FrameInspector: Send + Sync {
    fn validate_image(&self, path: &Path, limits: &ImageLimits) -> Result<(), ValidationReason>;
    fn is_dark_frame(&self, path: &Path) -> bool;
    /// Share of changed pixels between two frames, 0 to 100.
    fn diff_percent(&self, a: &Path, b: &Path) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&PNG_MAGIC) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(&JPEG_MAGIC) {
        Some(ImageFormat::Jpeg)
    } else {
        None
    }
}

fn be16(bytes: &[u8], at: usize) -> Option<u32> {
    let hi = *bytes.get(at)?;
    let lo = *bytes.get(at + 1)?;
    Some(u32::from(u16::from_be_bytes([hi, lo])))
}

fn be32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((be32(bytes, 16)?, be32(bytes, 20)?))
}

fn is_sof_marker(marker: u8) -> bool {
    (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let mut marker_at = pos + 1;
        while bytes.get(marker_at) == Some(&0xFF) {
            marker_at += 1;
        }
        let marker = *bytes.get(marker_at)?;
        match marker {
            0x01 | 0xD0..=0xD7 => {
                pos = marker_at + 1;
                continue;
            }
            0xD9 | 0xDA => return None,
            _ => {}
        }
        let len = be16(bytes, marker_at + 1)? as usize;
        if len < 2 {
            return None;
        }
        if is_sof_marker(marker) {
            let height = be16(bytes, marker_at + 4)?;
            let width = be16(bytes, marker_at + 6)?;
            return Some((width, height));
        }
        pos = marker_at + 1 + len;
    }
    None
}

/// Validates from file metadata and the image header only.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderInspector;

impl FrameInspector for HeaderInspector {
    fn validate_image(&self, path: &Path, limits: &ImageLimits) -> Result<(), ValidationReason> {
        let meta = fs::metadata(path).map_err(|_| ValidationReason::FileMissing)?;
        if !meta.is_file() {
            return Err(ValidationReason::FileMissing);
        }
        if meta.len() > limits.max_file_bytes {
            return Err(ValidationReason::FileTooLarge);
        }

        let bytes = fs::read(path).map_err(|_| ValidationReason::DecodeError)?;
        let format = sniff_format(&bytes).ok_or(ValidationReason::UnsupportedFormat)?;
        let (width, height) = match format {
            ImageFormat::Png => png_dimensions(&bytes),
            ImageFormat::Jpeg => jpeg_dimensions(&bytes),
        }
        .filter(|(w, h)| *w > 0 && *h > 0)
        .ok_or(ValidationReason::DecodeError)?;

        if width < limits.min_width || height < limits.min_height {
            return Err(ValidationReason::ImageTooSmall);
        }
        if width > limits.max_width || height > limits.max_height {
            return Err(ValidationReason::ImageTooLarge);
        }
        Ok(())
    }

    fn is_dark_frame(&self, _path: &Path) -> bool {
        false
    }

    fn diff_percent(&self, a: &Path, b: &Path) -> Result<f64> {
        let left = fs::read(a).with_context(|| format!("failed to read {}", a.display()))?;
        let right = fs::read(b).with_context(|| format!("failed to read {}", b.display()))?;
        Ok(if left == right { 0.0 } else { 100.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = PNG_MAGIC.to_vec();
        out.extend_from_slice(&13u32.to_be_bytes());
        out.extend_from_slice(b"IHDR");
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&[8, 2, 0, 0, 0]);
        out
    }

    fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        // APP0 segment ahead of the frame header
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    fn limits() -> ImageLimits {
        ImageLimits {
            max_file_bytes: 1024,
            min_width: 320,
            min_height: 240,
            max_width: 4096,
            max_height: 4096,
        }
    }

    #[test]
    fn reads_dimensions_from_headers() {
        assert_eq!(png_dimensions(&png(640, 480)), Some((640, 480)));
        assert_eq!(jpeg_dimensions(&jpeg(1920, 1080)), Some((1920, 1080)));
        assert_eq!(sniff_format(b"GIF89a"), None);
    }

    #[test]
    fn validation_reports_each_reason() {
        let tmp = tempdir().expect("tempdir");
        let inspector = HeaderInspector;
        let check = |name: &str, bytes: &[u8]| {
            let path = tmp.path().join(name);
            fs::write(&path, bytes).expect("write");
            inspector.validate_image(&path, &limits())
        };

        assert_eq!(check("ok.png", &png(640, 480)), Ok(()));
        assert_eq!(check("ok.jpg", &jpeg(640, 480)), Ok(()));
        assert_eq!(check("small.png", &png(100, 100)), Err(ValidationReason::ImageTooSmall));
        assert_eq!(check("huge.png", &png(8000, 480)), Err(ValidationReason::ImageTooLarge));
        assert_eq!(check("gif.jpg", b"GIF89a...."), Err(ValidationReason::UnsupportedFormat));
        assert_eq!(check("trunc.jpg", &[0xFF, 0xD8, 0xFF]), Err(ValidationReason::DecodeError));
        assert_eq!(check("big.png", &vec![0u8; 2048]), Err(ValidationReason::FileTooLarge));
        assert_eq!(
            inspector.validate_image(&tmp.path().join("absent.jpg"), &limits()),
            Err(ValidationReason::FileMissing)
        );
    }

    #[test]
    fn diff_is_zero_only_for_identical_bytes() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("a.png");
        let b = tmp.path().join("b.png");
        let c = tmp.path().join("c.png");
        fs::write(&a, png(640, 480)).expect("a");
        fs::write(&b, png(640, 480)).expect("b");
        fs::write(&c, png(641, 480)).expect("c");
        let inspector = HeaderInspector;
        assert_eq!(inspector.diff_percent(&a, &b).expect("diff"), 0.0);
        assert_eq!(inspector.diff_percent(&a, &c).expect("diff"), 100.0);
        assert!(!inspector.is_dark_frame(&a));
    }
}
