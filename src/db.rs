use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::loader;
use crate::models::ActivityRecord;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let activities = vec![
        (
            "seed-001",
            "Avery Lee",
            "Library",
            2.0,
            NaiveDate::from_ymd_opt(2025, 9, 5).context("invalid date")?,
        ),
        (
            "seed-002",
            "Jules Moreno",
            "Carnival",
            3.5,
            NaiveDate::from_ymd_opt(2025, 9, 5).context("invalid date")?,
        ),
        (
            "seed-003",
            "Kiara Patel",
            "Library",
            1.0,
            NaiveDate::from_ymd_opt(2025, 9, 12).context("invalid date")?,
        ),
        (
            "seed-004",
            "Avery Lee",
            "Book Fair",
            4.0,
            NaiveDate::from_ymd_opt(2025, 9, 19).context("invalid date")?,
        ),
    ];

    for (source_key, volunteer, category, hours, submission_date) in activities {
        insert_activity(
            pool,
            source_key,
            Some(volunteer),
            Some(category),
            hours,
            Some(submission_date),
        )
        .await?;
    }

    Ok(())
}

async fn insert_activity(
    pool: &PgPool,
    source_key: &str,
    volunteer: Option<&str>,
    category: Option<&str>,
    hours: f64,
    submission_date: Option<NaiveDate>,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO volunteer_analytics.activities
        (id, source_key, volunteer, category, hours, submission_date)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(source_key)
    .bind(volunteer)
    .bind(category)
    .bind(hours)
    .bind(submission_date)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_activity_records(pool: &PgPool) -> anyhow::Result<Vec<ActivityRecord>> {
    let rows = sqlx::query(
        "SELECT source_key, volunteer, category, hours, submission_date \
         FROM volunteer_analytics.activities \
         ORDER BY submission_date NULLS LAST, source_key",
    )
    .fetch_all(pool)
    .await
    .context("failed to read volunteer_analytics.activities")?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        records.push(ActivityRecord {
            id: row.get("source_key"),
            volunteer: row.get("volunteer"),
            category: row.get("category"),
            hours: row.get("hours"),
            submission_date: row.get("submission_date"),
        });
    }

    Ok(records)
}

/// Imports a sheet export. Rows without an id are keyed by a fresh uuid, so
/// re-importing the same file only deduplicates rows that carry one.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let rows = loader::read_csv_file(csv_path)?;
    let mut inserted = 0usize;

    for (index, raw) in rows.into_iter().enumerate() {
        let has_key = raw.id.is_some();
        let record = loader::validate_row(index + 1, raw)
            .map_err(|issue| anyhow::anyhow!("row {}: {}", issue.row, issue.reason))?;
        let source_key = if has_key {
            record.id.clone()
        } else {
            format!("import-{}", Uuid::new_v4())
        };

        if insert_activity(
            pool,
            &source_key,
            record.volunteer.as_deref(),
            record.category.as_deref(),
            record.hours,
            record.submission_date,
        )
        .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}
