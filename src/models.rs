use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub id: String,
    pub volunteer: Option<String>,
    pub category: Option<String>,
    pub hours: f64,
    pub submission_date: Option<NaiveDate>,
}

/// A row as it came off the sheet, before any typing or validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawActivityRow {
    pub id: Option<String>,
    pub volunteer: Option<String>,
    pub category: Option<String>,
    pub hours: Option<String>,
    pub submission_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordIssue {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedDataset {
    pub records: Vec<ActivityRecord>,
    pub dropped: Vec<RecordIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    #[value(name = "cumulative_hours")]
    CumulativeHours,
    #[value(name = "hours_by_date")]
    HoursByDate,
    #[value(name = "hours_by_category")]
    HoursByCategory,
    #[value(name = "hours_by_volunteer")]
    HoursByVolunteer,
}

impl ChartKind {
    pub fn name(self) -> &'static str {
        match self {
            ChartKind::CumulativeHours => "cumulative_hours",
            ChartKind::HoursByDate => "hours_by_date",
            ChartKind::HoursByCategory => "hours_by_category",
            ChartKind::HoursByVolunteer => "hours_by_volunteer",
        }
    }

    pub fn file_stem(self) -> &'static str {
        match self {
            ChartKind::CumulativeHours => "cumulative_hours_plot",
            ChartKind::HoursByDate => "total_hours_plot",
            ChartKind::HoursByCategory => "hours_by_category_plot",
            ChartKind::HoursByVolunteer => "hours_by_volunteer_plot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub kind: ChartKind,
    pub points: Vec<(String, f64)>,
}

impl Aggregate {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub record_count: usize,
    pub dropped_count: usize,
    pub total_hours: f64,
    pub mean_hours: f64,
    pub volunteer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartArtifact {
    pub name: String,
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
    pub series: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartFailure {
    pub chart: String,
    pub kind: &'static str,
    pub message: String,
}
