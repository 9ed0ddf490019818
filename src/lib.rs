pub mod batch;
pub mod classes;
pub mod composition;
pub mod config;
pub mod errors;
pub mod history;
pub mod model;
pub mod overlay;
pub mod pipeline;
pub mod prediction;
pub mod preprocess;
pub mod traits;
pub mod trend;

pub mod mocks;

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub use batch::{run_batch, run_batch_parallel, BatchItemResult, BatchResult, BatchSummary};
pub use classes::{ClassTable, WasteClass};
pub use composition::{dominant, percentage, pixel_area, ClassAreaMap, ClassMap, PercentageMap};
pub use config::{AnalysisSettings, Config};
pub use errors::{Result, WasteSegError};
pub use history::{HistoryRecord, SqliteHistoryStore, StoreMetadata};
pub use model::OnnxSegmentationModel;
pub use pipeline::{run_single_image, AnalysisResult, AnalysisSummary};
pub use prediction::{InstanceMask, InstancePredictions};
pub use preprocess::UploadedFile;
pub use traits::*;

#[cfg(test)]
pub use mocks::*;

/// Model + class table + settings, with file discovery and export on top of
/// the pipelines.
pub struct WasteAnalyzer<M: InstanceSegmentationModel> {
    model: M,
    table: ClassTable,
    settings: AnalysisSettings,
}

impl<M: InstanceSegmentationModel> WasteAnalyzer<M> {
    pub fn new(model: M, table: ClassTable, settings: AnalysisSettings) -> Self {
        if let Some(names) = model.class_names() {
            let expected: Vec<&str> = table.names().collect();
            if names.iter().map(String::as_str).ne(expected.iter().copied()) {
                warn!(model = ?names, table = ?expected, "model class names differ from class table");
            }
        }
        Self {
            model,
            table,
            settings,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn table(&self) -> &ClassTable {
        &self.table
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub fn analyze_upload(&self, file: &UploadedFile) -> Result<AnalysisResult> {
        run_single_image(&file.bytes, &file.name, &self.model, &self.settings, &self.table)
    }

    pub fn analyze_file(&self, path: &Path) -> Result<AnalysisResult> {
        self.analyze_upload(&UploadedFile::from_path(path)?)
    }

    /// Run a batch with a progress bar. `parallel` fans items out over the
    /// rayon pool; results keep submission order either way.
    pub fn analyze_batch(&self, files: &[UploadedFile], parallel: bool) -> BatchResult {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let on_item = |_: usize, _: &BatchItemResult| pb.inc(1);
        let result = if parallel {
            run_batch_parallel(files, &self.model, &self.settings, &self.table, on_item)
        } else {
            batch::run_batch_with(files, &self.model, &self.settings, &self.table, on_item)
        };

        pb.finish_and_clear();
        result
    }

    /// Expand files and directories into the supported image files they
    /// contain, sorted by path.
    pub fn collect_image_files(&self, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut image_files = Vec::new();

        for input in inputs {
            if !input.exists() {
                return Err(WasteSegError::FileSystem {
                    path: input.clone(),
                    operation: "input lookup".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "input does not exist"),
                });
            }
            if input.is_file() {
                image_files.push(input.clone());
                continue;
            }
            for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_file() && Self::is_supported_image_format(path) {
                    image_files.push(path.to_path_buf());
                }
            }
        }

        image_files.sort();
        image_files.dedup();
        Ok(image_files)
    }

    pub fn is_supported_image_format(path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(extension.to_lowercase().as_str(), "jpg" | "jpeg" | "png")
        } else {
            false
        }
    }

    /// Write `<name>_overlay.png` and `<name>_summary.json`.
    pub fn export_single(&self, result: &AnalysisResult, output_dir: &Path) -> Result<Vec<PathBuf>> {
        create_dir(output_dir)?;
        let stem = file_stem(&result.image_name);

        let overlay_path = output_dir.join(format!("{}_overlay.png", stem));
        match &result.overlay_png {
            Some(png) => write_file(&overlay_path, png)?,
            None => write_file(&overlay_path, &overlay::encode_png(&result.overlay)?)?,
        }

        let summary_path = output_dir.join(format!("{}_summary.json", stem));
        write_json(&summary_path, &result.summary(self.settings.confidence))?;

        info!(overlay = %overlay_path.display(), summary = %summary_path.display(), "result exported");
        Ok(vec![overlay_path, summary_path])
    }

    /// Write an overlay per successful item plus `batch_summary_<timestamp>.json`.
    pub fn export_batch(
        &self,
        result: &BatchResult,
        output_dir: &Path,
        model_version: &str,
    ) -> Result<Vec<PathBuf>> {
        create_dir(output_dir)?;
        let mut written = Vec::new();

        for item in result.results() {
            let Some(rendered) = &item.overlay else {
                continue;
            };
            let path = output_dir.join(format!("{}_overlay.png", file_stem(&item.image)));
            write_file(&path, &overlay::encode_png(rendered)?)?;
            written.push(path);
        }

        let summary_path = output_dir.join(format!(
            "batch_summary_{}.json",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        write_json(
            &summary_path,
            &result.summary(self.settings.confidence, model_version),
        )?;
        written.push(summary_path);

        info!(files = written.len(), dir = %output_dir.display(), "batch exported");
        Ok(written)
    }
}

impl WasteAnalyzer<OnnxSegmentationModel> {
    pub fn with_onnx_model(
        model_path: &Path,
        device_id: i32,
        table: ClassTable,
        settings: AnalysisSettings,
    ) -> Result<Self> {
        let model = OnnxSegmentationModel::new(model_path, device_id)?;
        Ok(Self::new(model, table, settings))
    }
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| WasteSegError::FileSystem {
        path: dir.to_path_buf(),
        operation: "create output directory".to_string(),
        source: e,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| WasteSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "write output".to_string(),
        source: e,
    })
}

/// Write the records inside `range`, restricted to `classes` (all when
/// empty), as JSON. Returns the number of records written.
pub fn export_history<S: AsRef<str>>(
    records: &[HistoryRecord],
    range: trend::DateRange,
    classes: &[S],
    path: &Path,
) -> Result<usize> {
    let filtered = trend::filter_records(records, range, classes);
    write_json(path, &filtered)?;
    info!(records = filtered.len(), path = %path.display(), "history exported");
    Ok(filtered.len())
}

/// Write the long-form trend series for `mode` as JSON. Returns the number of
/// rows written.
pub fn export_trend(
    records: &[HistoryRecord],
    mode: config::TrendMode,
    path: &Path,
) -> Result<usize> {
    let rows = trend::long_form(&trend::aggregate(records, mode));
    write_json(path, &rows)?;
    info!(rows = rows.len(), path = %path.display(), "trend series exported");
    Ok(rows.len())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| WasteSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "serialize json".to_string(),
        source: e.into(),
    })?;
    write_file(path, &json)
}
