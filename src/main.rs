use std::path::Path;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waste_seg_rs::config::{threshold_label, AnalyzeArgs, Command, HistoryCommand};
use waste_seg_rs::preprocess::validate_upload_sizes;
use waste_seg_rs::trend::{self, DateRange, DEFAULT_PAGE_SIZE};
use waste_seg_rs::{
    AnalysisSettings, ClassTable, Config, HistoryStore, PercentageMap, SqliteHistoryStore,
    StoreMetadata, UploadedFile, WasteAnalyzer,
};

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = match &config.log_filter {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let table = ClassTable::waste_default();
    match &config.command {
        Command::Analyze(args) => analyze(&config, args, table),
        Command::History(command) => history(&config, command, table),
    }
}

fn open_store(db_path: &Path, table: ClassTable, metadata: StoreMetadata) -> Result<SqliteHistoryStore> {
    SqliteHistoryStore::open(db_path, table, metadata)
        .with_context(|| format!("Failed to open history database: {}", db_path.display()))
}

fn print_composition(percentages: &PercentageMap) {
    for (name, value) in percentages.iter() {
        println!("  {:<18} {:>6.2}%", name, value);
    }
}

fn analyze(config: &Config, args: &AnalyzeArgs, table: ClassTable) -> Result<()> {
    ensure!(args.model_path.exists(), "Model path does not exist");

    let settings = AnalysisSettings::from_args(args, &table)?;
    info!(
        confidence = settings.confidence,
        mode = threshold_label(settings.confidence),
        "analysis settings"
    );

    let metadata = StoreMetadata {
        source: args.source.clone(),
        model_version: args.model_version.clone(),
    };
    let store = if args.save {
        Some(open_store(&config.db_path, table.clone(), metadata)?)
    } else {
        None
    };

    let analyzer =
        WasteAnalyzer::with_onnx_model(&args.model_path, args.device_id, table, settings)?;

    let paths = analyzer.collect_image_files(&args.inputs)?;
    if paths.is_empty() {
        warn!("no supported image files found");
        return Ok(());
    }

    let files = paths
        .iter()
        .map(|p| UploadedFile::from_path(p))
        .collect::<waste_seg_rs::Result<Vec<_>>>()?;
    validate_upload_sizes(&files, args.max_file_size_mb)?;

    let confidence = analyzer.settings().confidence;

    if let [file] = files.as_slice() {
        let mut result = analyzer.analyze_upload(file)?;
        println!("{}: dominant class {}", result.image_name, result.dominant);
        print_composition(&result.percentages);

        if let Some(dir) = &args.output_dir {
            analyzer.export_single(&result, dir)?;
        }
        if let Some(store) = &store {
            if let Some(id) = result.save_to(store, confidence)? {
                println!("saved as record {}", id);
            }
        }
        return Ok(());
    }

    let mut result = analyzer.analyze_batch(&files, args.parallel);
    for item in result.results() {
        match (&item.dominant, &item.error) {
            (Some(dominant), None) => println!("{}: {}", item.image, dominant),
            (_, Some(error)) => println!("{}: ERROR {}", item.image, error),
            _ => {}
        }
    }
    println!(
        "{} images: {} succeeded, {} failed",
        result.total_images(),
        result.success(),
        result.failed()
    );

    if let Some(dir) = &args.output_dir {
        analyzer.export_batch(&result, dir, &args.model_version)?;
    }
    if let Some(store) = &store {
        let saved = result.save_batch(store, confidence)?;
        println!("saved {} records", saved);
    }
    Ok(())
}

fn history(config: &Config, command: &HistoryCommand, table: ClassTable) -> Result<()> {
    let store = open_store(&config.db_path, table, StoreMetadata::default())?;

    match command {
        HistoryCommand::List {
            from,
            to,
            classes,
            page,
        } => {
            let classes = store.class_table().resolve_names(classes)?;
            let records = store.load_all()?;
            let filtered = trend::filter_records(&records, DateRange::new(*from, *to), &classes);
            let page = trend::paginate(&filtered, *page, DEFAULT_PAGE_SIZE);

            for record in page.items {
                let composition = record
                    .percentages
                    .iter()
                    .map(|(name, value)| format!("{}={:.1}%", name, value))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "#{} {} {} (conf {:.2}) {}",
                    record.id, record.timestamp, record.image, record.confidence, composition
                );
            }
            println!("page {}/{} ({} records)", page.page, page.total_pages, filtered.len());
        }
        HistoryCommand::Summary => match trend::summarize(&store.load_all()?) {
            Some(summary) => {
                println!("total images: {}", summary.total_images);
                println!(
                    "latest: {} at {}",
                    summary.latest.image, summary.latest.timestamp
                );
                println!("most frequent class: {}", summary.most_frequent_class);
            }
            None => println!("no analysis history"),
        },
        HistoryCommand::Trend { mode, output } => {
            let records = store.load_all()?;
            for point in trend::aggregate(&records, *mode) {
                println!("{} (n={})", point.period, point.samples);
                print_composition(&point.percentages);
            }
            if let Some(output) = output {
                let rows = waste_seg_rs::export_trend(&records, *mode, output)?;
                println!("exported {} rows to {}", rows, output.display());
            }
        }
        HistoryCommand::Undo => match store.delete_latest()? {
            Some(id) => println!("deleted record {}", id),
            None => println!("no analysis history"),
        },
        HistoryCommand::Clear => {
            let deleted = store.delete_all()?;
            println!("deleted {} records", deleted);
        }
        HistoryCommand::Export {
            output,
            from,
            to,
            classes,
        } => {
            let classes = store.class_table().resolve_names(classes)?;
            let exported = waste_seg_rs::export_history(
                &store.load_all()?,
                DateRange::new(*from, *to),
                &classes,
                output,
            )?;
            println!("exported {} records to {}", exported, output.display());
        }
    }
    Ok(())
}
