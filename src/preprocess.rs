use std::path::Path;

use image::{ImageBuffer, Rgb, RgbImage};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{Result, WasteSegError};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Raw upload: original filename plus file content.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| WasteSegError::FileSystem {
            path: path.to_path_buf(),
            operation: "read upload".to_string(),
            source: e,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self { name, bytes })
    }

    pub fn size_mb(&self) -> f64 {
        self.bytes.len() as f64 / BYTES_PER_MB
    }
}

/// Decoded, bounded image plus the identity of the upload it came from.
#[derive(Debug, Clone)]
pub struct PreparedImage<'a> {
    pub image: RgbImage,
    pub raw: &'a [u8],
    pub safe_name: String,
    pub hash: String,
}

/// Decode, sanitize, hash and bound one upload.
pub fn prepare_image<'a>(
    bytes: &'a [u8],
    filename: &str,
    max_width: u32,
    max_height: u32,
) -> Result<PreparedImage<'a>> {
    let image = decode_image(bytes, filename)?;
    let safe_name = sanitize_filename(filename);
    let hash = compute_image_hash(bytes);
    let image = resize_keep_ratio(image, max_width, max_height);

    debug!(
        image = %safe_name,
        width = image.width(),
        height = image.height(),
        "image prepared"
    );

    Ok(PreparedImage {
        image,
        raw: bytes,
        safe_name,
        hash,
    })
}

/// Raw bytes to a 3-channel RGB raster.
pub fn decode_image(bytes: &[u8], filename: &str) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(WasteSegError::InvalidImage {
            image: filename.to_string(),
            reason: "empty file".to_string(),
        });
    }

    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| WasteSegError::InvalidImage {
            image: filename.to_string(),
            reason: e.to_string(),
        })
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Hex SHA-256 of the raw upload bytes.
pub fn compute_image_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fit within `max_width` x `max_height`, same factor on both axes. Never
/// upscales; images already within bounds are returned untouched.
pub fn resize_keep_ratio(image: RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image;
    }

    let scale = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);
    if scale >= 1.0 {
        return image;
    }

    let new_width = ((width as f64 * scale) as u32).max(1);
    let new_height = ((height as f64 * scale) as u32).max(1);
    resize_area(&image, new_width, new_height)
}

/// Area-averaging downscale: every output pixel is the coverage-weighted mean
/// of the source pixels under its footprint.
pub fn resize_area(image: &RgbImage, new_width: u32, new_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let x_taps = area_taps(width, new_width);
    let y_taps = area_taps(height, new_height);

    // horizontal pass
    let mut rows: ImageBuffer<Rgb<f32>, Vec<f32>> = ImageBuffer::new(new_width, height);
    for y in 0..height {
        for (dx, taps) in x_taps.iter().enumerate() {
            let mut acc = [0.0f32; 3];
            for &(sx, weight) in taps {
                let Rgb(px) = image.get_pixel(sx, y);
                for c in 0..3 {
                    acc[c] += px[c] as f32 * weight;
                }
            }
            rows.put_pixel(dx as u32, y, Rgb(acc));
        }
    }

    // vertical pass
    let mut out = RgbImage::new(new_width, new_height);
    for (dy, taps) in y_taps.iter().enumerate() {
        for x in 0..new_width {
            let mut acc = [0.0f32; 3];
            for &(sy, weight) in taps {
                let Rgb(px) = rows.get_pixel(x, sy);
                for c in 0..3 {
                    acc[c] += px[c] * weight;
                }
            }
            let px = acc.map(|v| v.round().clamp(0.0, 255.0) as u8);
            out.put_pixel(x, dy as u32, Rgb(px));
        }
    }
    out
}

/// For each destination index, the source indices it covers and their
/// normalized coverage.
fn area_taps(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = (start + scale).min(src as f64);
            let span = end - start;
            let mut taps = Vec::new();
            let mut s = start.floor() as u32;
            while (s as f64) < end && s < src {
                let covered = end.min(s as f64 + 1.0) - start.max(s as f64);
                if covered > 0.0 {
                    taps.push((s, (covered / span) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Reject the whole upload if any file exceeds `max_size_mb`.
pub fn validate_upload_sizes(files: &[UploadedFile], max_size_mb: u64) -> Result<()> {
    for file in files {
        let size_mb = file.size_mb();
        if size_mb > max_size_mb as f64 {
            return Err(WasteSegError::Validation {
                field: file.name.clone(),
                reason: format!("exceeds {} MB limit ({:.1} MB)", max_size_mb, size_mb),
            });
        }
    }
    Ok(())
}
