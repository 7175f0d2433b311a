use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::db;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{ActivityRecord, LoadedDataset, RawActivityRow, RecordIssue};
use crate::storage::TokenSource;

/// Where one invocation reads its activity records from.
#[derive(Debug, Clone)]
pub enum DataSource {
    Csv(PathBuf),
    Url { url: String, token: Option<TokenSource> },
    Postgres { database_url: String },
    Inline(Vec<Value>),
}

impl DataSource {
    pub fn describe(&self) -> String {
        match self {
            DataSource::Csv(path) => format!("csv file {}", path.display()),
            DataSource::Url { url, .. } => format!("sheet export {url}"),
            DataSource::Postgres { .. } => "postgres".to_string(),
            DataSource::Inline(values) => format!("{} inline records", values.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Volunteer,
    Category,
    Hours,
    SubmissionDate,
}

fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Maps a header onto a field and its rank. Rank 0 is the canonical name;
/// higher ranks are weaker aliases that a better column replaces.
fn field_for(header: &str) -> Option<(Field, u8)> {
    let mapped = match normalize_header(header).as_str() {
        "id" => (Field::Id, 0),
        "source_key" => (Field::Id, 1),
        "volunteer" => (Field::Volunteer, 0),
        "volunteer_name" => (Field::Volunteer, 1),
        "name" => (Field::Volunteer, 2),
        "email" | "email_address" => (Field::Volunteer, 3),
        "category" => (Field::Category, 0),
        "activity" => (Field::Category, 1),
        "type" => (Field::Category, 2),
        "hours" => (Field::Hours, 0),
        "submission_date" => (Field::SubmissionDate, 0),
        "date" => (Field::SubmissionDate, 1),
        "timestamp" => (Field::SubmissionDate, 2),
        _ => return None,
    };
    Some(mapped)
}

fn cell(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Best rank seen so far for each field of one row.
#[derive(Default)]
struct Ranks([Option<u8>; 5]);

impl Ranks {
    /// True when a column of `rank` should replace what `field` holds. Equal
    /// ranks keep the first column.
    fn claim(&mut self, field: Field, rank: u8) -> bool {
        let best = &mut self.0[field as usize];
        if matches!(*best, Some(held) if held <= rank) {
            return false;
        }
        *best = Some(rank);
        true
    }
}

fn assign(
    row: &mut RawActivityRow,
    ranks: &mut Ranks,
    (field, rank): (Field, u8),
    value: Option<String>,
) {
    if !ranks.claim(field, rank) {
        return;
    }
    let slot = match field {
        Field::Id => &mut row.id,
        Field::Volunteer => &mut row.volunteer,
        Field::Category => &mut row.category,
        Field::Hours => &mut row.hours,
        Field::SubmissionDate => &mut row.submission_date,
    };
    *slot = value;
}

/// Reads a sheet export. A header without an `hours` column means the
/// source is not a volunteer-hours sheet at all.
pub fn read_csv<R: Read>(reader: R) -> AnalyticsResult<Vec<RawActivityRow>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader
        .headers()
        .map_err(|e| AnalyticsError::DataUnavailable(format!("unreadable header: {e}")))?
        .clone();
    let fields: Vec<Option<(Field, u8)>> = headers.iter().map(field_for).collect();

    if !fields.iter().flatten().any(|(field, _)| *field == Field::Hours) {
        return Err(AnalyticsError::DataUnavailable(
            "source has no `hours` column".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result
            .map_err(|e| AnalyticsError::DataUnavailable(format!("unparseable row: {e}")))?;
        let mut row = RawActivityRow::default();
        let mut ranks = Ranks::default();
        for (value, field) in record.iter().zip(fields.iter()) {
            if let Some(field) = field {
                assign(&mut row, &mut ranks, *field, cell(value));
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

pub fn read_csv_file(path: &Path) -> AnalyticsResult<Vec<RawActivityRow>> {
    let file = std::fs::File::open(path).map_err(|e| {
        AnalyticsError::DataUnavailable(format!("cannot open {}: {e}", path.display()))
    })?;
    read_csv(file)
}

/// Turns one inline JSON record into a raw row. Numbers keep their textual
/// form so that they go through the same validation as sheet cells.
pub fn raw_row_from_json(value: &Value) -> RawActivityRow {
    let mut row = RawActivityRow::default();
    let mut ranks = Ranks::default();
    let Some(object) = value.as_object() else {
        return row;
    };

    for (key, value) in object {
        let Some(field) = field_for(key) else {
            continue;
        };
        let text = match value {
            Value::String(s) => cell(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        };
        assign(&mut row, &mut ranks, field, text);
    }

    row
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, format) {
            return Some(timestamp.date());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.date_naive())
}

pub fn check_hours(hours: f64) -> Result<f64, String> {
    if !hours.is_finite() {
        return Err(format!("hours must be a finite number, got {hours}"));
    }
    if hours < 0.0 {
        return Err(format!("hours must not be negative, got {hours}"));
    }
    Ok(hours)
}

/// `row` is the 1-based data row number, used for generated ids and issues.
pub fn validate_row(row: usize, raw: RawActivityRow) -> Result<ActivityRecord, RecordIssue> {
    let issue = |reason: String| RecordIssue { row, reason };

    let hours_text = raw
        .hours
        .ok_or_else(|| issue("missing hours".to_string()))?;
    let hours: f64 = hours_text
        .parse()
        .map_err(|_| issue(format!("hours `{hours_text}` is not a number")))?;
    let hours = check_hours(hours).map_err(issue)?;

    let submission_date = match raw.submission_date {
        Some(text) => Some(
            parse_date(&text).ok_or_else(|| issue(format!("unrecognised date `{text}`")))?,
        ),
        None => None,
    };

    Ok(ActivityRecord {
        id: raw.id.unwrap_or_else(|| format!("row-{row}")),
        volunteer: raw.volunteer,
        category: raw.category,
        hours,
        submission_date,
    })
}

/// Lenient mode drops bad rows and reports them; strict mode fails on the
/// first one.
pub fn validate_rows(rows: Vec<RawActivityRow>, strict: bool) -> AnalyticsResult<LoadedDataset> {
    let mut dataset = LoadedDataset::default();

    for (index, raw) in rows.into_iter().enumerate() {
        match validate_row(index + 1, raw) {
            Ok(record) => dataset.records.push(record),
            Err(issue) if strict => {
                return Err(AnalyticsError::Validation(format!(
                    "row {}: {}",
                    issue.row, issue.reason
                )));
            }
            Err(issue) => dataset.dropped.push(issue),
        }
    }

    Ok(dataset)
}

fn validate_records(records: Vec<ActivityRecord>, strict: bool) -> AnalyticsResult<LoadedDataset> {
    let mut dataset = LoadedDataset::default();

    for (index, record) in records.into_iter().enumerate() {
        match check_hours(record.hours) {
            Ok(_) => dataset.records.push(record),
            Err(reason) if strict => {
                return Err(AnalyticsError::Validation(format!("{}: {reason}", record.id)));
            }
            Err(reason) => dataset.dropped.push(RecordIssue {
                row: index + 1,
                reason,
            }),
        }
    }

    Ok(dataset)
}

async fn fetch_csv(url: &str, token: Option<&TokenSource>) -> AnalyticsResult<Vec<RawActivityRow>> {
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if let Some(token) = token {
        let bearer = token
            .bearer(&client)
            .await
            .map_err(|e| AnalyticsError::DataUnavailable(format!("cannot authorize {url}: {e}")))?;
        request = request.bearer_auth(bearer);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AnalyticsError::DataUnavailable(format!("cannot reach {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AnalyticsError::DataUnavailable(format!(
            "{url} answered with {status}"
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| AnalyticsError::DataUnavailable(format!("cannot read {url}: {e}")))?;
    read_csv(body.as_bytes())
}

async fn fetch_from_postgres(database_url: &str) -> AnalyticsResult<Vec<ActivityRecord>> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .map_err(|e| AnalyticsError::DataUnavailable(format!("failed to connect to Postgres: {e}")))?;

    let records = db::fetch_activity_records(&pool)
        .await
        .map_err(|e| AnalyticsError::DataUnavailable(format!("{e:#}")));
    pool.close().await;
    records
}

pub async fn load(source: &DataSource, strict: bool) -> AnalyticsResult<LoadedDataset> {
    let dataset = match source {
        DataSource::Csv(path) => validate_rows(read_csv_file(path)?, strict)?,
        DataSource::Url { url, token } => validate_rows(fetch_csv(url, token.as_ref()).await?, strict)?,
        DataSource::Postgres { database_url } => {
            validate_records(fetch_from_postgres(database_url).await?, strict)?
        }
        DataSource::Inline(values) => {
            validate_rows(values.iter().map(raw_row_from_json).collect(), strict)?
        }
    };

    if !dataset.dropped.is_empty() {
        warn!(
            dropped = dataset.dropped.len(),
            "dropped invalid records from {}",
            source.describe()
        );
    }
    info!(
        records = dataset.records.len(),
        "loaded activity records from {}",
        source.describe()
    );

    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use serde_json::json;

    const SHEET: &str = "\
Timestamp,Volunteer Name,Activity,Hours
2025-09-05,Avery Lee,Library,2
09/06/2025,Jules Moreno,Carnival,1.5
2025-09-07,Kiara Patel,Library,not-a-number
";

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[test]
    fn headers_are_mapped_through_aliases() {
        let rows = read_csv(SHEET.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].volunteer.as_deref(), Some("Avery Lee"));
        assert_eq!(rows[0].category.as_deref(), Some("Library"));
        assert_eq!(rows[0].hours.as_deref(), Some("2"));
        assert_eq!(rows[1].submission_date.as_deref(), Some("09/06/2025"));
    }

    #[test]
    fn canonical_header_beats_earlier_alias() {
        let rows = read_csv(
            "Timestamp,Email Address,Name,submission_date,hours\n\
             2025-10-01 09:00:00,avery@example.org,Avery,2025-09-05,2\n"
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(rows[0].submission_date.as_deref(), Some("2025-09-05"));
        assert_eq!(rows[0].volunteer.as_deref(), Some("Avery"));
    }

    #[test]
    fn equal_aliases_keep_the_first_column() {
        let rows = read_csv("date,hours,date\n2025-09-05,2,2025-09-06\n".as_bytes()).unwrap();
        assert_eq!(rows[0].submission_date.as_deref(), Some("2025-09-05"));

        let value = json!({"timestamp": "2025-10-01", "submission_date": "2025-09-05", "hours": 1});
        let row = raw_row_from_json(&value);
        assert_eq!(row.submission_date.as_deref(), Some("2025-09-05"));
    }

    #[test]
    fn missing_hours_column_is_unavailable() {
        let err = read_csv("name,date\nAvery,2025-09-05\n".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
    }

    #[test]
    fn lenient_validation_drops_and_counts() {
        let rows = read_csv(SHEET.as_bytes()).unwrap();
        let dataset = validate_rows(rows, false).unwrap();
        assert_eq!(dataset.records.len(), 2);
        assert_eq!(dataset.dropped.len(), 1);
        assert_eq!(dataset.dropped[0].row, 3);
        assert_eq!(dataset.records[0].id, "row-1");
        assert_eq!(
            dataset.records[1].submission_date,
            NaiveDate::from_ymd_opt(2025, 9, 6)
        );
    }

    #[test]
    fn strict_validation_fails_the_load() {
        let rows = read_csv(SHEET.as_bytes()).unwrap();
        let err = validate_rows(rows, true).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("row 3"));
    }

    #[test]
    fn negative_and_missing_hours_are_rejected() {
        let negative = RawActivityRow {
            hours: Some("-1".into()),
            ..Default::default()
        };
        assert!(validate_row(1, negative).is_err());
        assert!(validate_row(2, RawActivityRow::default()).is_err());
    }

    #[test]
    fn dates_accept_sheet_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 9, 5);
        assert_eq!(parse_date("2025-09-05"), expected);
        assert_eq!(parse_date("9/5/2025"), expected);
        assert_eq!(parse_date("2025-09-05 14:30:00"), expected);
        assert_eq!(parse_date("2025-09-05T14:30:00Z"), expected);
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn inline_json_records_share_validation() {
        let value = json!({"category": "A", "hours": 2, "volunteer": "Avery"});
        let record = validate_row(1, raw_row_from_json(&value)).unwrap();
        assert_eq!(record.category.as_deref(), Some("A"));
        assert_eq!(record.hours, 2.0);
        assert_eq!(record.submission_date, None);
    }

    #[tokio::test]
    async fn loads_inline_source() {
        let source = DataSource::Inline(vec![
            json!({"category": "A", "hours": 2}),
            json!({"category": "B", "hours": "abc"}),
        ]);
        let dataset = load(&source, false).await.unwrap();
        assert_eq!(dataset.records.len(), 1);
        assert_eq!(dataset.dropped.len(), 1);
    }

    #[tokio::test]
    async fn loads_csv_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hours.csv");
        std::fs::write(&path, SHEET).unwrap();
        let dataset = load(&DataSource::Csv(path), false).await.unwrap();
        assert_eq!(dataset.records.len(), 2);
    }

    #[tokio::test]
    async fn missing_csv_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&DataSource::Csv(dir.path().join("absent.csv")), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
    }

    #[tokio::test]
    async fn fetches_sheet_export_over_http() {
        let base = serve(Router::new().route("/export", get(|| async { SHEET }))).await;
        let source = DataSource::Url {
            url: format!("{base}/export"),
            token: Some(TokenSource::Static("secret".into())),
        };
        let dataset = load(&source, false).await.unwrap();
        assert_eq!(dataset.records.len(), 2);
    }

    async fn authorized_export(headers: HeaderMap) -> (StatusCode, &'static str) {
        let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
        if auth == Some("Bearer from-metadata") {
            (StatusCode::OK, SHEET)
        } else {
            (StatusCode::UNAUTHORIZED, "")
        }
    }

    #[tokio::test]
    async fn private_export_uses_metadata_server_token() {
        let base = serve(
            Router::new()
                .route("/export", get(authorized_export))
                .route(
                    "/token",
                    get(|| async { Json(json!({"access_token": "from-metadata", "expires_in": 3599})) }),
                ),
        )
        .await;
        let source = DataSource::Url {
            url: format!("{base}/export"),
            token: Some(TokenSource::MetadataServer(format!("{base}/token"))),
        };
        let dataset = load(&source, false).await.unwrap();
        assert_eq!(dataset.records.len(), 2);
    }

    #[tokio::test]
    async fn failed_token_fetch_is_unavailable() {
        let base = serve(Router::new().route("/export", get(authorized_export))).await;
        let source = DataSource::Url {
            url: format!("{base}/export"),
            token: Some(TokenSource::MetadataServer(format!("{base}/token"))),
        };
        let err = load(&source, false).await.unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
        assert!(err.to_string().contains("authorize"));
    }

    #[tokio::test]
    async fn upstream_error_status_is_unavailable() {
        let base = serve(Router::new().route(
            "/export",
            get(|| async { (StatusCode::FORBIDDEN, "denied") }),
        ))
        .await;
        let source = DataSource::Url {
            url: format!("{base}/export"),
            token: None,
        };
        let err = load(&source, false).await.unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn unreachable_source_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let source = DataSource::Url {
            url: format!("http://{addr}/export"),
            token: None,
        };
        let err = load(&source, false).await.unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
    }
}
