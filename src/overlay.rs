use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::map::map_colors;

use crate::classes::ClassTable;
use crate::errors::{Result, WasteSegError};
use crate::prediction::InstancePredictions;

/// Default blend factor: `pixel = 0.6 * original + 0.4 * class color`.
pub const DEFAULT_OVERLAY_ALPHA: f32 = 0.4;

/// Tint every visible instance's mask region with its class color.
///
/// Instances of classes outside `visible_classes` are skipped; background and
/// hidden regions keep their original pixels. Overlapping visible instances
/// blend in prediction order. The input is never modified.
pub fn render_overlay<S: AsRef<str>>(
    image: &RgbImage,
    predictions: &InstancePredictions,
    visible_classes: &[S],
    table: &ClassTable,
    alpha: f32,
) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let mut canvas: ImageBuffer<Rgb<f32>, Vec<f32>> =
        map_colors(image, |Rgb(px)| Rgb(px.map(f32::from)));

    for (mask, class_index) in predictions.iter() {
        let class = table.get(class_index).ok_or_else(|| {
            WasteSegError::shape_mismatch(format!(
                "class index {} outside class table of {}",
                class_index,
                table.len()
            ))
        })?;

        if !visible_classes.iter().any(|v| v.as_ref() == class.name) {
            continue;
        }

        if mask.dimensions() != (width, height) {
            return Err(WasteSegError::shape_mismatch(format!(
                "mask {}x{} does not cover image {}x{}",
                mask.width(),
                mask.height(),
                width,
                height
            )));
        }

        let color = class.color.0.map(f32::from);
        for (Luma([m]), Rgb(px)) in mask.pixels().zip(canvas.pixels_mut()) {
            if *m == 0.0 {
                continue;
            }
            for c in 0..3 {
                px[c] = (1.0 - alpha) * px[c] + alpha * color[c];
            }
        }
    }

    Ok(map_colors(&canvas, |Rgb(px)| {
        Rgb(px.map(|v| v.clamp(0.0, 255.0) as u8))
    }))
}

/// Lossless PNG bytes of a raster, for download and storage.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| WasteSegError::Encoding {
            operation: "overlay PNG encoding".to_string(),
            source: e,
        })?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::InstanceMask;

    fn full_mask(width: u32, height: u32) -> InstanceMask {
        InstanceMask::from_pixel(width, height, Luma([1.0]))
    }

    #[test]
    fn test_overlay_blends_visible_class() -> Result<()> {
        let table = ClassTable::waste_default();
        let image = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let mut mask = InstanceMask::new(2, 1);
        mask.put_pixel(0, 0, Luma([0.8]));
        let predictions = InstancePredictions::new(vec![mask], vec![1]);

        let overlay = render_overlay(&image, &predictions, &["Mixed waste"], &table, 0.4)?;

        // 0.6 * 100 + 0.4 * (0xE9, 0x55, 0x00)
        assert_eq!(overlay.get_pixel(0, 0), &Rgb([153, 94, 60]));
        assert_eq!(overlay.get_pixel(1, 0), &Rgb([100, 100, 100]));
        assert_eq!(image.get_pixel(0, 0), &Rgb([100, 100, 100]));
        Ok(())
    }

    #[test]
    fn test_overlay_skips_hidden_classes() -> Result<()> {
        let table = ClassTable::waste_default();
        let image = RgbImage::from_pixel(3, 3, Rgb([7, 8, 9]));
        let predictions =
            InstancePredictions::new(vec![full_mask(3, 3), full_mask(3, 3)], vec![0, 4]);

        let none: [&str; 0] = [];
        assert_eq!(render_overlay(&image, &predictions, &none, &table, 0.4)?, image);

        let wood_only = render_overlay(&image, &predictions, &["Wood"], &table, 0.4)?;
        let metal_only = render_overlay(&image, &predictions, &["Metal"], &table, 0.4)?;
        assert_ne!(wood_only, metal_only);
        Ok(())
    }

    #[test]
    fn test_overlay_full_alpha_is_class_color() -> Result<()> {
        let table = ClassTable::waste_default();
        let image = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        let predictions = InstancePredictions::new(vec![full_mask(1, 1)], vec![2]);
        let overlay = render_overlay(&image, &predictions, &["Plastic"], &table, 1.0)?;
        assert_eq!(overlay.get_pixel(0, 0), &Rgb([0x34, 0x98, 0xDB]));
        Ok(())
    }

    #[test]
    fn test_overlay_rejects_mismatched_mask() {
        let table = ClassTable::waste_default();
        let image = RgbImage::new(4, 4);
        let predictions = InstancePredictions::new(vec![full_mask(2, 2)], vec![0]);
        let err = render_overlay(&image, &predictions, &["Metal"], &table, 0.4).unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn test_encode_png_decodes_back() -> Result<()> {
        let raster = RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]));
        let bytes = encode_png(&raster)?;
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| WasteSegError::Encoding {
                operation: "decode".to_string(),
                source: e,
            })?
            .to_rgb8();
        assert_eq!(decoded, raster);
        Ok(())
    }
}
