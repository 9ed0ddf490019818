use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::composition::PercentageMap;
use crate::config::TrendMode;
use crate::history::HistoryRecord;

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Headline numbers for the history view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total_images: usize,
    pub latest: HistoryRecord,
    /// Class with the largest summed percentage over all records.
    pub most_frequent_class: String,
}

pub fn summarize(records: &[HistoryRecord]) -> Option<HistorySummary> {
    let latest = records.iter().max_by_key(|r| (r.timestamp, r.id))?;

    let mut totals: Vec<(&str, f64)> = Vec::new();
    for record in records {
        for (name, value) in record.percentages.iter() {
            match totals.iter_mut().find(|(n, _)| *n == name) {
                Some((_, total)) => *total += value,
                None => totals.push((name, value)),
            }
        }
    }

    let mut best: Option<(&str, f64)> = None;
    for (name, total) in totals {
        if best.map_or(true, |(_, b)| total > b) {
            best = Some((name, total));
        }
    }

    Some(HistorySummary {
        total_images: records.len(),
        latest: latest.clone(),
        most_frequent_class: best.map(|(name, _)| name.to_string())?,
    })
}

/// Inclusive date bounds; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    /// Bounds given in reverse order are swapped.
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        match (from, to) {
            (Some(a), Some(b)) if a > b => Self {
                from: Some(b),
                to: Some(a),
            },
            _ => Self { from, to },
        }
    }

    pub fn contains(&self, timestamp: &NaiveDateTime) -> bool {
        let date = timestamp.date();
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Keep records inside `range`, and keep only the named classes in each
/// record's percentages. An empty class list keeps every class.
pub fn filter_records<S: AsRef<str>>(
    records: &[HistoryRecord],
    range: DateRange,
    classes: &[S],
) -> Vec<HistoryRecord> {
    let range = DateRange::new(range.from, range.to);
    records
        .iter()
        .filter(|r| range.contains(&r.timestamp))
        .map(|r| {
            if classes.is_empty() {
                return r.clone();
            }
            let percentages = r
                .percentages
                .iter()
                .filter(|(name, _)| classes.iter().any(|c| c.as_ref() == *name))
                .map(|(name, value)| (name.to_string(), value))
                .collect();
            HistoryRecord {
                percentages: PercentageMap::from_entries(percentages),
                ..r.clone()
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<'a, T> {
    pub items: &'a [T],
    /// 1-based, after clamping.
    pub page: usize,
    pub total_pages: usize,
}

/// Slice out one page. Out-of-range page numbers clamp to the first or last
/// page; an empty input is a single empty page.
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> Page<'_, T> {
    let page_size = page_size.max(1);
    let total_pages = items.len().div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(items.len());
    Page {
        items: &items[start.min(end)..end],
        page,
        total_pages,
    }
}

/// Mean composition over one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    /// Record time for raw mode, start of the day or week otherwise.
    pub period: NaiveDateTime,
    pub samples: usize,
    pub percentages: PercentageMap,
}

/// One `(period, class, percentage)` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSample {
    pub period: NaiveDateTime,
    pub class: String,
    pub percentage: f64,
}

fn period_start(timestamp: &NaiveDateTime, mode: TrendMode) -> NaiveDateTime {
    match mode {
        TrendMode::Raw => *timestamp,
        TrendMode::Daily => timestamp.date().and_time(chrono::NaiveTime::MIN),
        // Weeks end on Monday and are keyed by the Tuesday that opens them.
        TrendMode::Weekly => {
            let date = timestamp.date();
            let back = i64::from((date.weekday().num_days_from_monday() + 6) % 7);
            (date - Duration::days(back)).and_time(chrono::NaiveTime::MIN)
        }
    }
}

fn mean(records: &[&HistoryRecord]) -> PercentageMap {
    let Some(first) = records.first() else {
        return PercentageMap::from_entries(Vec::new());
    };
    let count = records.len() as f64;
    let entries = first
        .percentages
        .iter()
        .map(|(name, _)| {
            let sum: f64 = records
                .iter()
                .map(|r| r.percentages.get(name).unwrap_or(0.0))
                .sum();
            (name.to_string(), sum / count)
        })
        .collect();
    PercentageMap::from_entries(entries)
}

/// Group records by period in chronological order.
pub fn aggregate(records: &[HistoryRecord], mode: TrendMode) -> Vec<TrendPoint> {
    if mode == TrendMode::Raw {
        let mut points: Vec<TrendPoint> = records
            .iter()
            .map(|r| TrendPoint {
                period: r.timestamp,
                samples: 1,
                percentages: r.percentages.clone(),
            })
            .collect();
        points.sort_by_key(|p| p.period);
        return points;
    }

    let mut groups: BTreeMap<NaiveDateTime, Vec<&HistoryRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(period_start(&record.timestamp, mode))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|(period, members)| TrendPoint {
            period,
            samples: members.len(),
            percentages: mean(&members),
        })
        .collect()
}

pub fn long_form(points: &[TrendPoint]) -> Vec<TrendSample> {
    points
        .iter()
        .flat_map(|p| {
            p.percentages.iter().map(move |(class, percentage)| TrendSample {
                period: p.period,
                class: class.to_string(),
                percentage,
            })
        })
        .collect()
}
