use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};

use crate::models::{ActivityRecord, Aggregate, ChartKind, DatasetSummary, LoadedDataset};

pub const TOP_VOLUNTEERS: usize = 20;

fn sum_by<K: Ord, F>(records: &[ActivityRecord], key: F) -> BTreeMap<K, f64>
where
    F: Fn(&ActivityRecord) -> Option<K>,
{
    let mut totals = BTreeMap::new();
    for record in records {
        if let Some(k) = key(record) {
            *totals.entry(k).or_insert(0.0) += record.hours;
        }
    }
    totals
}

// Highest total first; equal totals keep key order so output is stable.
fn by_total_desc<K: Ord>(a: &(K, f64), b: &(K, f64)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

pub fn hours_by_category(records: &[ActivityRecord]) -> Aggregate {
    let mut totals: Vec<(String, f64)> =
        sum_by(records, |r| r.category.clone()).into_iter().collect();
    totals.sort_by(by_total_desc);

    Aggregate {
        kind: ChartKind::HoursByCategory,
        points: totals,
    }
}

/// Labels drop the year unless the dates span more than one, where
/// month-day labels would collide.
pub fn hours_by_date(records: &[ActivityRecord]) -> Aggregate {
    let mut totals: Vec<(NaiveDate, f64)> =
        sum_by(records, |r| r.submission_date).into_iter().collect();
    let spans_years = match (totals.first(), totals.last()) {
        (Some((first, _)), Some((last, _))) => first.year() != last.year(),
        _ => false,
    };
    let label_format = if spans_years { "%Y-%m-%d" } else { "%m-%d" };
    totals.sort_by(by_total_desc);

    Aggregate {
        kind: ChartKind::HoursByDate,
        points: totals
            .into_iter()
            .map(|(date, hours)| (date.format(label_format).to_string(), hours))
            .collect(),
    }
}

pub fn cumulative_hours(records: &[ActivityRecord]) -> Aggregate {
    let mut running = 0.0;
    let points = sum_by(records, |r| r.submission_date)
        .into_iter()
        .map(|(date, hours)| {
            running += hours;
            (date.format("%Y-%m-%d").to_string(), running)
        })
        .collect();

    Aggregate {
        kind: ChartKind::CumulativeHours,
        points,
    }
}

pub fn hours_by_volunteer(records: &[ActivityRecord]) -> Aggregate {
    let mut totals: Vec<(String, f64)> =
        sum_by(records, |r| r.volunteer.clone()).into_iter().collect();
    totals.sort_by(by_total_desc);
    totals.truncate(TOP_VOLUNTEERS);

    Aggregate {
        kind: ChartKind::HoursByVolunteer,
        points: totals,
    }
}

pub fn aggregate(kind: ChartKind, records: &[ActivityRecord]) -> Aggregate {
    match kind {
        ChartKind::CumulativeHours => cumulative_hours(records),
        ChartKind::HoursByDate => hours_by_date(records),
        ChartKind::HoursByCategory => hours_by_category(records),
        ChartKind::HoursByVolunteer => hours_by_volunteer(records),
    }
}

pub fn summarize(dataset: &LoadedDataset) -> DatasetSummary {
    let records = &dataset.records;
    let total_hours: f64 = records.iter().map(|r| r.hours).sum();
    let volunteers: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.volunteer.as_deref())
        .collect();
    let dates = records.iter().filter_map(|r| r.submission_date);

    DatasetSummary {
        record_count: records.len(),
        dropped_count: dataset.dropped.len(),
        total_hours,
        mean_hours: if records.is_empty() {
            0.0
        } else {
            total_hours / records.len() as f64
        },
        volunteer_count: volunteers.len(),
        first_date: dates.clone().min(),
        last_date: dates.max(),
    }
}
