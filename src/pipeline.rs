use chrono::{DateTime, Local};
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classes::ClassTable;
use crate::composition::{dominant, percentage, pixel_area, PercentageMap};
use crate::config::AnalysisSettings;
use crate::errors::{Result, WasteSegError};
use crate::overlay::{encode_png, render_overlay};
use crate::preprocess::prepare_image;
use crate::traits::{HistoryStore, InstanceSegmentationModel};

/// Outcome of one image taken end to end.
///
/// Only `saved` changes after construction, and only through `save_to`.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub image_name: String,
    pub image_hash: String,
    pub image: RgbImage,
    pub overlay: RgbImage,
    pub percentages: PercentageMap,
    pub dominant: String,
    pub overlay_png: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Local>>,
    pub saved: bool,
}

/// JSON export of a single analysis.
#[derive(Debug, Serialize)]
pub struct AnalysisSummary<'a> {
    pub image: &'a str,
    pub image_hash: &'a str,
    pub timestamp: Option<String>,
    pub confidence_threshold: f32,
    pub dominant_class: &'a str,
    pub percentages: &'a PercentageMap,
}

impl AnalysisResult {
    pub fn summary(&self, confidence: f32) -> AnalysisSummary<'_> {
        AnalysisSummary {
            image: &self.image_name,
            image_hash: &self.image_hash,
            timestamp: self.timestamp.map(|t| t.to_rfc3339()),
            confidence_threshold: confidence,
            dominant_class: &self.dominant,
            percentages: &self.percentages,
        }
    }

    /// Persist once; later calls are no-ops returning `None`.
    pub fn save_to<H: HistoryStore + ?Sized>(
        &mut self,
        store: &H,
        confidence: f32,
    ) -> Result<Option<i64>> {
        if self.saved {
            return Ok(None);
        }
        let id = store.save(
            &self.image_name,
            Some(&self.image_hash),
            confidence,
            &self.percentages,
        )?;
        self.saved = true;
        Ok(Some(id))
    }
}

/// Everything up to and including the overlay; shared with the batch pipeline.
#[derive(Debug, Clone)]
pub(crate) struct Analysis {
    pub image_name: String,
    pub image_hash: String,
    pub image: RgbImage,
    pub overlay: RgbImage,
    pub percentages: PercentageMap,
    pub dominant: String,
}

/// Prepare → infer → validate → aggregate → render. One inference call.
pub(crate) fn analyze<M: InstanceSegmentationModel + ?Sized>(
    bytes: &[u8],
    filename: &str,
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
) -> Result<Analysis> {
    let prepared = prepare_image(bytes, filename, settings.max_width, settings.max_height)?;
    let name = prepared.safe_name.clone();
    info!(image = %name, hash = %prepared.hash, "image prepared");

    let predictions = model
        .predict(&prepared.image, settings.confidence)
        .map_err(|e| WasteSegError::Inference {
            image: name.clone(),
            source: Box::new(e),
        })?;

    if predictions.is_empty() {
        warn!(image = %name, "no detection");
        return Err(WasteSegError::NoDetection { image: name });
    }
    debug!(image = %name, instances = predictions.len(), "inference finished");

    let area = pixel_area(&predictions, table).map_err(|e| e.in_stage(&name, "aggregate"))?;
    let percentages = percentage(&area);
    let dominant = dominant(&percentages)
        .map(str::to_string)
        .ok_or_else(|| WasteSegError::shape_mismatch("empty class table").in_stage(&name, "aggregate"))?;
    info!(image = %name, dominant = %dominant, "composition computed");

    let overlay = render_overlay(
        &prepared.image,
        &predictions,
        &settings.visible_classes,
        table,
        settings.overlay_alpha,
    )
    .map_err(|e| e.in_stage(&name, "render"))?;

    Ok(Analysis {
        image_name: name,
        image_hash: prepared.hash,
        image: prepared.image,
        overlay,
        percentages,
        dominant,
    })
}

/// Analyze one upload end to end.
///
/// Stops at the first failing stage: `InvalidImage` for undecodable bytes,
/// `NoDetection` when the model finds nothing, `Inference` when the model
/// fails, and `Pipeline` (wrapping the cause) for anything else.
pub fn run_single_image<M: InstanceSegmentationModel + ?Sized>(
    bytes: &[u8],
    filename: &str,
    model: &M,
    settings: &AnalysisSettings,
    table: &ClassTable,
) -> Result<AnalysisResult> {
    info!(file = %filename, confidence = settings.confidence, "start processing");

    let outcome = analyze(bytes, filename, model, settings, table).and_then(|analysis| {
        let overlay_png =
            encode_png(&analysis.overlay).map_err(|e| e.in_stage(&analysis.image_name, "serialize"))?;
        Ok((analysis, overlay_png))
    });

    match outcome {
        Ok((analysis, overlay_png)) => {
            info!(image = %analysis.image_name, "finished processing");
            Ok(AnalysisResult {
                image_name: analysis.image_name,
                image_hash: analysis.image_hash,
                image: analysis.image,
                overlay: analysis.overlay,
                percentages: analysis.percentages,
                dominant: analysis.dominant,
                overlay_png: Some(overlay_png),
                timestamp: Some(Local::now()),
                saved: false,
            })
        }
        Err(e) => {
            error!(file = %filename, error = %e, "pipeline failed");
            Err(e)
        }
    }
}
