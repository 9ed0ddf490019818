use chrono::Local;
use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classes::ClassTable;
use crate::composition::PercentageMap;
use crate::config::AnalysisSettings;
use crate::errors::{Result, WasteSegError};
use crate::pipeline::{analyze, Analysis};
use crate::preprocess::UploadedFile;
use crate::traits::{HistoryStore, InstanceSegmentationModel};

/// Per-file outcome. On failure every data field is `None` and `error` holds
/// the message.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub image: String,
    pub image_hash: Option<String>,
    pub image_rgb: Option<RgbImage>,
    pub overlay: Option<RgbImage>,
    pub percentages: Option<PercentageMap>,
    pub dominant: Option<String>,
    pub error: Option<String>,
    pub saved: bool,
}

impl BatchItemResult {
    fn success(analysis: Analysis) -> Self {
        Self {
            image: analysis.image_name,
            image_hash: Some(analysis.image_hash),
            image_rgb: Some(analysis.image),
            overlay: Some(analysis.overlay),
            percentages: Some(analysis.percentages),
            dominant: Some(analysis.dominant),
            error: None,
            saved: false,
        }
    }

    fn failure(image: &str, error: &WasteSegError) -> Self {
        Self {
            image: image.to_string(),
            image_hash: None,
            image_rgb: None,
            overlay: None,
            percentages: None,
            dominant: None,
            error: Some(error.report()),
            saved: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Batch outcome in submission order.
///
/// Counters are computed from the items when the result is built, so
/// `success + failed == total_images == results.len()` always holds.
#[derive(Debug, Clone)]
pub struct BatchResult {
    total_images: usize,
    success: usize,
    failed: usize,
    results: Vec<BatchItemResult>,
}

impl BatchResult {
    pub fn from_items(results: Vec<BatchItemResult>) -> Self {
        let success = results.iter().filter(|r| r.is_success()).count();
        Self {
            total_images: results.len(),
            success,
            failed: results.len() - success,
            results,
        }
    }

    pub fn total_images(&self) -> usize {
        self.total_images
    }

    pub fn success(&self) -> usize {
        self.success
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn results(&self) -> &[BatchItemResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<BatchItemResult> {
        self.results
    }

    /// Persist every successful item not saved yet. Returns how many were
    /// written. Stops at the first store failure; items already written stay
    /// flagged.
    pub fn save_batch<H: HistoryStore + ?Sized>(
        &mut self,
        store: &H,
        confidence: f32,
    ) -> Result<usize> {
        let mut saved = 0;
        for item in self.results.iter_mut() {
            if item.saved {
                continue;
            }
            let (Some(percentages), None) = (&item.percentages, &item.error) else {
                continue;
            };
            store.save(&item.image, item.image_hash.as_deref(), confidence, percentages)?;
            item.saved = true;
            saved += 1;
        }
        info!(saved, "batch results saved to history");
        Ok(saved)
    }

    pub fn summary<'a>(&'a self, confidence: f32, model_version: &'a str) -> BatchSummary<'a> {
        BatchSummary {
            batch_timestamp: Local::now().to_rfc3339(),
            total_images: self.total_images,
            success: self.success,
            failed: self.failed,
            confidence_threshold: confidence,
            model_version,
            results: self
                .results
                .iter()
                .map(|item| match (&item.error, &item.percentages, &item.dominant) {
                    (None, Some(percentages), Some(dominant)) => BatchSummaryItem::Success {
                        image: &item.image,
                        dominant_class: dominant,
                        percentages,
                    },
                    (error, _, _) => BatchSummaryItem::Failure {
                        image: &item.image,
                        error: error.as_deref().unwrap_or("incomplete result"),
                    },
                })
                .collect(),
        }
    }
}

/// JSON export of a batch run.
#[derive(Debug, Serialize)]
pub struct BatchSummary<'a> {
    pub batch_timestamp: String,
    pub total_images: usize,
    pub success: usize,
    pub failed: usize,
    pub confidence_threshold: f32,
    pub model_version: &'a str,
    pub results: Vec<BatchSummaryItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchSummaryItem<'a> {
    Success {
        image: &'a str,
        dominant_class: &'a str,
        percentages: &'a PercentageMap,
    },
    Failure {
        image: &'a str,
        error: &'a str,
    },
}

/// Process files one at a time, in order. A failing file becomes an error
/// item; it never stops the batch.
pub fn run_batch<M: InstanceSegmentationModel + ?Sized>(
    files: &[UploadedFile],
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
) -> BatchResult {
    run_batch_with(files, model, settings, table, |_, _| {})
}

/// `run_batch` with a callback after each item (progress reporting).
pub fn run_batch_with<M, F>(
    files: &[UploadedFile],
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
    on_item: F,
) -> BatchResult
where
    M: InstanceSegmentationModel + ?Sized,
    F: Fn(usize, &BatchItemResult),
{
    let total = files.len();
    info!(total_files = total, confidence = settings.confidence, "start batch processing");

    let results = files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let item = process_item(index, total, file, model, settings, table);
            on_item(index, &item);
            item
        })
        .collect();

    finish(results)
}

/// Items fan out over the rayon pool; results still come back in submission
/// order and each item is isolated exactly as in `run_batch`.
pub fn run_batch_parallel<M, F>(
    files: &[UploadedFile],
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
    on_item: F,
) -> BatchResult
where
    M: InstanceSegmentationModel + ?Sized,
    F: Fn(usize, &BatchItemResult) + Sync,
{
    let total = files.len();
    info!(
        total_files = total,
        confidence = settings.confidence,
        threads = rayon::current_num_threads(),
        "start parallel batch processing"
    );

    let results = files
        .par_iter()
        .enumerate()
        .map(|(index, file)| {
            let item = process_item(index, total, file, model, settings, table);
            on_item(index, &item);
            item
        })
        .collect();

    finish(results)
}

fn process_item<M: InstanceSegmentationModel + ?Sized>(
    index: usize,
    total: usize,
    file: &UploadedFile,
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
) -> BatchItemResult {
    let position = index + 1;
    info!(index = position, total, image = %file.name, "processing image");

    match analyze(&file.bytes, &file.name, model, settings, table) {
        Ok(analysis) => {
            info!(index = position, dominant = %analysis.dominant, "detection success");
            BatchItemResult::success(analysis)
        }
        Err(e) if e.is_shape_mismatch() => {
            error!(
                index = position,
                image = %file.name,
                error = ?e,
                "mask/label contract violated; continuing batch"
            );
            BatchItemResult::failure(&file.name, &e)
        }
        Err(e @ (WasteSegError::InvalidImage { .. } | WasteSegError::NoDetection { .. })) => {
            warn!(index = position, image = %file.name, error = %e, "image skipped");
            BatchItemResult::failure(&file.name, &e)
        }
        Err(e) => {
            error!(index = position, image = %file.name, error = %e, "processing failed");
            BatchItemResult::failure(&file.name, &e)
        }
    }
}

fn finish(results: Vec<BatchItemResult>) -> BatchResult {
    let result = BatchResult::from_items(results);
    info!(
        total = result.total_images(),
        success = result.success(),
        failed = result.failed(),
        "batch finished"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{SqliteHistoryStore, StoreMetadata};
    use crate::mocks::{FlakySegmentationModel, MockInstance, MockSegmentationModel};
    use crate::overlay::encode_png;
    use image::Rgb;

    fn png_file(name: &str) -> UploadedFile {
        let bytes = encode_png(&RgbImage::from_pixel(6, 4, Rgb([20, 40, 60]))).unwrap();
        UploadedFile::new(name, bytes)
    }

    fn three_files_middle_broken() -> Vec<UploadedFile> {
        vec![
            png_file("a.png"),
            UploadedFile::new("b.jpg", b"corrupted".to_vec()),
            png_file("c.png"),
        ]
    }

    #[test]
    fn test_run_batch_empty() {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::new(vec![MockInstance::full(0)]);
        let result = run_batch(&[], &model, &AnalysisSettings::new(0.25, &table), &table);

        assert_eq!(result.total_images(), 0);
        assert_eq!(result.success(), 0);
        assert_eq!(result.failed(), 0);
        assert!(result.results().is_empty());
    }

    #[test]
    fn test_run_batch_isolates_failures() {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::new(vec![MockInstance::columns(4, 0.0, 0.5)]);
        let files = three_files_middle_broken();

        let result = run_batch(&files, &model, &AnalysisSettings::new(0.25, &table), &table);

        assert_eq!(result.total_images(), 3);
        assert_eq!(result.success(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(model.calls(), 2);

        let items = result.results();
        assert!(items[0].error.is_none());
        assert!(items[1].error.is_some());
        assert!(items[2].error.is_none());
        assert_eq!(items[1].image, "b.jpg");
        assert!(items[1].percentages.is_none() && items[1].overlay.is_none());
        assert_eq!(items[2].dominant.as_deref(), Some("Wood"));
    }

    #[test]
    fn test_failure_message_keeps_cause() {
        let table = ClassTable::waste_default();
        let settings = AnalysisSettings::new(0.25, &table);
        let files = vec![png_file("a.png"), png_file("b.png")];

        let mismatch = run_batch(
            &files[..1],
            &MockSegmentationModel::new(vec![MockInstance::full(7)]),
            &settings,
            &table,
        );
        let message = mismatch.results()[0].error.clone().unwrap_or_default();
        assert!(message.starts_with("Pipeline error: aggregate failed for a.png: Shape mismatch"));
        assert!(message.contains("class index 7"));

        let flaky = FlakySegmentationModel::new(vec![MockInstance::full(0)], vec![0]);
        let failed = run_batch(&files, &flaky, &settings, &table);
        let message = failed.results()[0].error.clone().unwrap_or_default();
        assert!(message.starts_with("Inference error: model failed on a.png: Model error: mock inference failed"));
        assert!(failed.results()[1].error.is_none());
    }

    #[test]
    fn test_run_batch_no_detection_is_item_error() {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::empty();
        let files = vec![png_file("a.png"), png_file("b.png")];

        let result = run_batch(&files, &model, &AnalysisSettings::new(0.25, &table), &table);
        assert_eq!(result.failed(), 2);
        assert!(result.results().iter().all(|r| r
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("No detection"))));
    }

    #[test]
    fn test_parallel_matches_sequential_order() {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::new(vec![MockInstance::full(1)]);
        let settings = AnalysisSettings::new(0.25, &table);
        let mut files = Vec::new();
        for i in 0..12 {
            if i % 4 == 3 {
                files.push(UploadedFile::new(format!("broken_{}.png", i), vec![0; 8]));
            } else {
                files.push(png_file(&format!("img_{}.png", i)));
            }
        }

        let sequential = run_batch(&files, &model, &settings, &table);
        let parallel = run_batch_parallel(&files, &model, &settings, &table, |_, _| {});

        assert_eq!(parallel.total_images(), files.len());
        assert_eq!(parallel.success(), sequential.success());
        let names = |r: &BatchResult| r.results().iter().map(|i| i.image.clone()).collect::<Vec<_>>();
        assert_eq!(names(&parallel), names(&sequential));
    }

    #[test]
    fn test_save_batch_skips_failed_and_saved() -> Result<()> {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::new(vec![MockInstance::full(0)]);
        let files = three_files_middle_broken();
        let mut result = run_batch(&files, &model, &AnalysisSettings::new(0.25, &table), &table);

        let store = SqliteHistoryStore::open_in_memory(table.clone(), StoreMetadata::default())?;
        assert_eq!(result.save_batch(&store, 0.25)?, 2);
        assert_eq!(result.save_batch(&store, 0.25)?, 0);
        assert!(result.results()[0].saved);
        assert!(!result.results()[1].saved);

        let records = store.load_all()?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.image_hash.is_some()));
        Ok(())
    }

    #[test]
    fn test_batch_summary_json() -> std::result::Result<(), serde_json::Error> {
        let table = ClassTable::waste_default();
        let model = MockSegmentationModel::new(vec![MockInstance::full(3)]);
        let files = three_files_middle_broken();
        let result = run_batch(&files, &model, &AnalysisSettings::new(0.3, &table), &table);

        let json = serde_json::to_value(result.summary(0.3, "v1"))?;
        assert_eq!(json["total_images"], 3);
        assert_eq!(json["success"], 2);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["model_version"], "v1");
        assert_eq!(json["results"][0]["dominant_class"], "Paper&Cardboard");
        assert!(json["results"][1]["error"].is_string());
        assert!(json["results"][1].get("percentages").is_none());
        Ok(())
    }
}
