use image::{Luma, Rgb, RgbImage};
use std::fs;
use tempfile::TempDir;

use waste_seg_rs::overlay::encode_png;
use waste_seg_rs::{
    run_single_image, AnalysisSettings, ClassTable, InstanceMask, InstancePredictions,
    InstanceSegmentationModel, WasteAnalyzer, WasteSegError,
};

// 左右に二つのインスタンスを返すテスト用モデル
#[derive(Debug, Clone, Copy)]
struct SplitModel {
    left_class: usize,
    right_class: usize,
    /// 左側インスタンスの列数
    split: u32,
}

impl InstanceSegmentationModel for SplitModel {
    fn predict(
        &self,
        image: &RgbImage,
        _confidence: f32,
    ) -> waste_seg_rs::Result<InstancePredictions> {
        let (width, height) = image.dimensions();
        let split = self.split;
        let left = InstanceMask::from_fn(width, height, |x, _| Luma([if x < split { 1.0 } else { 0.0 }]));
        let right = InstanceMask::from_fn(width, height, |x, _| Luma([if x >= split { 1.0 } else { 0.0 }]));
        Ok(InstancePredictions::new(
            vec![left, right],
            vec![self.left_class, self.right_class],
        ))
    }
}

fn test_png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(width, height, Rgb([100, 100, 100]))).unwrap()
}

#[test]
fn test_composition_through_pipeline() {
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table);
    let model = SplitModel {
        left_class: 0,
        right_class: 2,
        split: 2,
    };

    let result = run_single_image(&test_png(8, 4), "yard.png", &model, &settings, &table).unwrap();

    assert_eq!(result.percentages.get("Metal"), Some(25.0));
    assert_eq!(result.percentages.get("Plastic"), Some(75.0));
    assert_eq!(result.percentages.get("Wood"), Some(0.0));
    assert_eq!(result.dominant, "Plastic");
    let total: f64 = result.percentages.values().sum();
    assert!((total - 100.0).abs() < 1e-9);
}

#[test]
fn test_equal_split_dominant_follows_class_order() {
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table);
    let model = SplitModel {
        left_class: 4,
        right_class: 1,
        split: 4,
    };

    let result = run_single_image(&test_png(8, 2), "tie.png", &model, &settings, &table).unwrap();
    assert_eq!(result.percentages.get("Wood"), Some(50.0));
    assert_eq!(result.percentages.get("Mixed waste"), Some(50.0));
    assert_eq!(result.dominant, "Mixed waste");
}

#[test]
fn test_hidden_classes_leave_pixels_untouched() {
    let table = ClassTable::waste_default();
    let settings =
        AnalysisSettings::new(0.25, &table).with_visible_classes(vec!["Metal".to_string()]);
    let model = SplitModel {
        left_class: 0,
        right_class: 2,
        split: 2,
    };

    let result = run_single_image(&test_png(8, 4), "vis.png", &model, &settings, &table).unwrap();

    // 非表示でも組成には含まれる
    assert_eq!(result.percentages.get("Plastic"), Some(75.0));
    assert_ne!(result.overlay.get_pixel(0, 0), result.image.get_pixel(0, 0));
    assert_eq!(result.overlay.get_pixel(7, 3), result.image.get_pixel(7, 3));
}

#[test]
fn test_large_image_is_bounded() {
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table).with_max_dimensions(64, 64);
    let model = SplitModel {
        left_class: 3,
        right_class: 3,
        split: 10,
    };

    let result =
        run_single_image(&test_png(256, 128), "big.png", &model, &settings, &table).unwrap();
    assert_eq!(result.image.dimensions(), (64, 32));
    assert_eq!(result.overlay.dimensions(), (64, 32));
    assert_eq!(result.percentages.get("Paper&Cardboard"), Some(100.0));
}

#[test]
fn test_out_of_range_class_is_shape_mismatch() {
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table);
    let model = SplitModel {
        left_class: 0,
        right_class: 5,
        split: 1,
    };

    let err = run_single_image(&test_png(4, 4), "bad.png", &model, &settings, &table).unwrap_err();
    assert!(err.is_shape_mismatch());
}

#[test]
fn test_analyzer_directory_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(input_dir.join("sub"))?;
    fs::write(input_dir.join("a.png"), test_png(6, 6))?;
    fs::write(input_dir.join("sub").join("b.png"), test_png(6, 6))?;
    fs::write(input_dir.join("readme.md"), b"skip")?;

    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table);
    let analyzer = WasteAnalyzer::new(
        SplitModel {
            left_class: 1,
            right_class: 4,
            split: 3,
        },
        table,
        settings,
    );

    let paths = analyzer.collect_image_files(&[input_dir])?;
    assert_eq!(paths.len(), 2);

    let result = analyzer.analyze_file(&paths[0])?;
    assert_eq!(result.image_name, "a.png");
    assert_eq!(result.dominant, "Mixed waste");

    let written = analyzer.export_single(&result, &temp_dir.path().join("out"))?;
    assert!(written.iter().all(|p| p.exists()));
    Ok(())
}

#[test]
fn test_unreadable_file_is_filesystem_error() {
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.25, &table);
    let analyzer = WasteAnalyzer::new(
        SplitModel {
            left_class: 0,
            right_class: 0,
            split: 0,
        },
        table,
        settings,
    );

    let err = analyzer
        .analyze_file(std::path::Path::new("/nonexistent/file.png"))
        .unwrap_err();
    assert!(matches!(err, WasteSegError::FileSystem { .. }));
}
