use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::classes::ClassTable;
use crate::errors::{Result, WasteSegError};
use crate::overlay::DEFAULT_OVERLAY_ALPHA;

pub const DEFAULT_MAX_IMAGE_WIDTH: u32 = 1280;
pub const DEFAULT_MAX_IMAGE_HEIGHT: u32 = 1280;
pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_MODEL_VERSION: &str = "yolov8-finetuned-v1";
pub const DEFAULT_IMAGE_SOURCE: &str = "upload";

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// SQLite history database
    #[arg(long, global = true, default_value = "results/analysis_history.db")]
    pub db_path: PathBuf,

    /// tracing filter, overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Analyze one image or a batch of images
    Analyze(AnalyzeArgs),

    /// Inspect or edit the analysis history
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(Args, Clone, Debug)]
pub struct AnalyzeArgs {
    /// Image files or directories
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value_t = DEFAULT_CONFIDENCE, value_parser = check_confidence)]
    pub confidence: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_IMAGE_WIDTH)]
    pub max_width: u32,

    #[arg(long, default_value_t = DEFAULT_MAX_IMAGE_HEIGHT)]
    pub max_height: u32,

    /// Classes drawn on the overlay (repeatable); all when omitted
    #[arg(long = "show", value_name = "CLASS")]
    pub visible_classes: Vec<String>,

    /// Where overlay PNGs and JSON summaries are written
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Persist successful results to the history database
    #[arg(long)]
    pub save: bool,

    /// Process batch items on the rayon pool (result order is unchanged)
    #[arg(long)]
    pub parallel: bool,

    #[arg(long, default_value_t = 20)]
    pub max_file_size_mb: u64,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value = DEFAULT_MODEL_VERSION)]
    pub model_version: String,

    #[arg(long, default_value = DEFAULT_IMAGE_SOURCE)]
    pub source: String,
}

#[derive(Subcommand, Clone, Debug)]
pub enum HistoryCommand {
    /// List stored records
    List {
        #[arg(long)]
        from: Option<chrono::NaiveDate>,
        #[arg(long)]
        to: Option<chrono::NaiveDate>,
        /// Restrict percentage columns to these classes (repeatable)
        #[arg(long = "class", value_name = "CLASS")]
        classes: Vec<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Totals, latest analysis and most frequent class
    Summary,
    /// Class proportions over time
    Trend {
        #[arg(long, value_enum, default_value_t = TrendMode::Raw)]
        mode: TrendMode,
        /// Also write the `(period, class, percentage)` series as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete the most recent record
    Undo,
    /// Delete every record
    Clear,
    /// Dump the (filtered) history as JSON
    Export {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        from: Option<chrono::NaiveDate>,
        #[arg(long)]
        to: Option<chrono::NaiveDate>,
        /// Restrict percentage columns to these classes (repeatable)
        #[arg(long = "class", value_name = "CLASS")]
        classes: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrendMode {
    Raw,
    Daily,
    Weekly,
}

/// Per-run settings the pipelines consume.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub confidence: f32,
    pub visible_classes: Vec<String>,
    pub max_width: u32,
    pub max_height: u32,
    pub overlay_alpha: f32,
}

impl AnalysisSettings {
    /// All classes visible, default bounds and blend.
    pub fn new(confidence: f32, table: &ClassTable) -> Self {
        Self {
            confidence,
            visible_classes: table.names().map(str::to_string).collect(),
            max_width: DEFAULT_MAX_IMAGE_WIDTH,
            max_height: DEFAULT_MAX_IMAGE_HEIGHT,
            overlay_alpha: DEFAULT_OVERLAY_ALPHA,
        }
    }

    pub fn with_visible_classes(mut self, classes: Vec<String>) -> Self {
        self.visible_classes = classes;
        self
    }

    pub const fn with_max_dimensions(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn from_args(args: &AnalyzeArgs, table: &ClassTable) -> Result<Self> {
        if args.max_width == 0 || args.max_height == 0 {
            return Err(WasteSegError::Validation {
                field: "max_width/max_height".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let visible = if args.visible_classes.is_empty() {
            table.names().map(str::to_string).collect()
        } else {
            table.resolve_names(&args.visible_classes)?
        };

        Ok(Self::new(args.confidence, table)
            .with_visible_classes(visible)
            .with_max_dimensions(args.max_width, args.max_height))
    }
}

/// Human label for a confidence threshold.
pub fn threshold_label(confidence: f32) -> &'static str {
    if confidence >= 0.5 {
        "Strict"
    } else if confidence >= 0.25 {
        "Balanced"
    } else {
        "Loose"
    }
}

fn check_confidence(s: &str) -> std::result::Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("`{}` is not a number", s))?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("confidence must be in (0, 1], got {}", value))
    }
}
