use image::{Rgb, RgbImage};
use tempfile::TempDir;

use waste_seg_rs::config::TrendMode;
use waste_seg_rs::mocks::{MockInstance, MockSegmentationModel};
use waste_seg_rs::overlay::encode_png;
use waste_seg_rs::trend::{aggregate, filter_records, paginate, summarize, DateRange};
use waste_seg_rs::{
    run_single_image, AnalysisSettings, ClassTable, HistoryStore, SqliteHistoryStore,
    StoreMetadata,
};

fn metadata() -> StoreMetadata {
    StoreMetadata {
        source: "camera".to_string(),
        model_version: "test-v2".to_string(),
    }
}

#[test]
fn test_history_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("results").join("history.db");
    let table = ClassTable::waste_default();
    let settings = AnalysisSettings::new(0.3, &table);
    let model = MockSegmentationModel::new(vec![
        MockInstance::columns(0, 0.0, 0.5),
        MockInstance::columns(4, 0.5, 1.0),
    ]);
    let png = encode_png(&RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])))?;

    {
        let store = SqliteHistoryStore::open(&db_path, table.clone(), metadata())?;
        let mut result = run_single_image(&png, "bin.png", &model, &settings, &table)?;
        assert!(result.save_to(&store, settings.confidence)?.is_some());
        assert!(result.save_to(&store, settings.confidence)?.is_none());
        assert!(result.saved);
    }

    let store = SqliteHistoryStore::open(&db_path, table.clone(), StoreMetadata::default())?;
    let records = store.load_all()?;
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.image, "bin.png");
    assert_eq!(record.source.as_deref(), Some("camera"));
    assert_eq!(record.model_version.as_deref(), Some("test-v2"));
    assert!(record.image_hash.as_deref().is_some_and(|h| h.len() == 64));
    assert_eq!(record.percentages.get("Metal"), Some(50.0));
    assert_eq!(record.percentages.get("Wood"), Some(50.0));
    Ok(())
}

#[test]
fn test_undo_and_clear() -> waste_seg_rs::Result<()> {
    let table = ClassTable::waste_default();
    let store = SqliteHistoryStore::open_in_memory(table.clone(), metadata())?;
    let shares = waste_seg_rs::PercentageMap::from_entries(
        table.names().map(|n| (n.to_string(), 20.0)).collect(),
    );

    assert_eq!(store.delete_latest()?, None);
    let first = store.save("a.png", None, 0.25, &shares)?;
    let second = store.save("b.png", None, 0.25, &shares)?;
    assert!(second > first);

    assert_eq!(store.delete_latest()?, Some(second));
    assert_eq!(store.load_all()?.len(), 1);

    store.save("c.png", None, 0.25, &shares)?;
    assert_eq!(store.delete_all()?, 2);
    assert!(store.load_all()?.is_empty());
    Ok(())
}

#[test]
fn test_trend_over_stored_records() -> waste_seg_rs::Result<()> {
    let table = ClassTable::waste_default();
    let store = SqliteHistoryStore::open_in_memory(table.clone(), metadata())?;
    for metal in [10.0, 30.0, 50.0] {
        let shares = waste_seg_rs::PercentageMap::from_entries(
            table
                .names()
                .map(|n| (n.to_string(), if n == "Metal" { metal } else { (100.0 - metal) / 4.0 }))
                .collect(),
        );
        store.save("x.png", None, 0.25, &shares)?;
    }

    let records = store.load_all()?;
    let summary = summarize(&records).expect("three records");
    assert_eq!(summary.total_images, 3);
    assert_eq!(summary.most_frequent_class, "Metal");

    // 同一日に保存されるので日次集計は 1 件（日付を跨いだ場合は 2 件）
    let daily = aggregate(&records, TrendMode::Daily);
    assert!(!daily.is_empty() && daily.len() <= 2);
    assert_eq!(daily.iter().map(|p| p.samples).sum::<usize>(), 3);

    let filtered = filter_records(&records, DateRange::default(), &["Metal"]);
    assert!(filtered.iter().all(|r| r.percentages.len() == 1));

    let page = paginate(&filtered, 2, 2);
    assert_eq!((page.page, page.total_pages, page.items.len()), (2, 2, 1));
    Ok(())
}
