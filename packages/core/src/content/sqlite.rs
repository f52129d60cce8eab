//! SQLite content repository.
//!
//! All SQL for content items lives here. Ranking pushes `ORDER BY` and
//! `LIMIT` down to the database; the untested-pages query streams the
//! unmeasured rows ordered by type and id and caps each type in Rust.
//! Timestamps are stored as RFC 3339 strings and resources as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{
    ContentId, ContentItem, ContentRepository, MeasuredTotals, MeasurementSnapshot, RankedPage,
    RepositoryError, ResourceBreakdown, UntestedPage, UntestedPages,
};
use crate::measurement::MeasurementReport;

/// Repository for reading and writing content items to SQLite.
#[derive(Clone)]
pub struct SqliteContentRepository {
    pool: SqlitePool,
}

impl SqliteContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_history(&self, id: ContentId) -> Result<Vec<MeasurementSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT emissions, page_size_bytes, measured_at
             FROM measurement_history
             WHERE content_id = ?
             ORDER BY id ASC",
        )
        .bind(sql_id(id))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MeasurementSnapshot, RepositoryError> {
                let measured_at: String = row.try_get("measured_at")?;
                Ok(MeasurementSnapshot {
                    emissions: row.try_get("emissions")?,
                    page_size_bytes: row.try_get::<i64, _>("page_size_bytes")?.max(0) as u64,
                    measured_at: parse_timestamp(id, &measured_at)?,
                })
            })
            .collect()
    }
}

/// Lossless: `ContentId` never exceeds `i64::MAX`.
fn sql_id(id: ContentId) -> i64 {
    id.get() as i64
}

fn content_id(row: &SqliteRow) -> Result<ContentId, RepositoryError> {
    let raw: i64 = row.try_get("id")?;
    u64::try_from(raw)
        .ok()
        .and_then(ContentId::new)
        .ok_or_else(|| RepositoryError::corrupt(raw.max(0) as u64, "id out of range"))
}

fn parse_timestamp(id: ContentId, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| RepositoryError::corrupt(id.get(), err.to_string()))
}

fn optional_size(row: &SqliteRow) -> Result<Option<u64>, RepositoryError> {
    let size: Option<i64> = row.try_get("page_size_bytes")?;
    Ok(size.map(|s| s.max(0) as u64))
}

#[async_trait]
impl ContentRepository for SqliteContentRepository {
    async fn insert_item(&self, item: &ContentItem) -> Result<(), RepositoryError> {
        let resources = if item.resources.is_empty() {
            None
        } else {
            serde_json::to_string(&item.resources).ok()
        };

        sqlx::query(
            "INSERT OR REPLACE INTO content_items
             (id, title, url, content_type, published, emissions, page_size_bytes,
              resources, last_measured_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sql_id(item.id))
        .bind(&item.title)
        .bind(&item.url)
        .bind(&item.content_type)
        .bind(if item.published { 1i64 } else { 0i64 })
        .bind(item.emissions)
        .bind(item.page_size_bytes.map(|s| s as i64))
        .bind(resources)
        .bind(item.last_measured_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_item(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, title, url, content_type, published, emissions, page_size_bytes,
                    resources, last_measured_at
             FROM content_items WHERE id = ?",
        )
        .bind(sql_id(id))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let resources: Option<String> = row.try_get("resources")?;
        let resources = match resources {
            Some(raw) => serde_json::from_str::<ResourceBreakdown>(&raw)
                .map_err(|err| RepositoryError::corrupt(id.get(), err.to_string()))?,
            None => ResourceBreakdown::new(),
        };

        let last_measured_at: Option<String> = row.try_get("last_measured_at")?;
        let last_measured_at = match last_measured_at {
            Some(raw) => Some(parse_timestamp(id, &raw)?),
            None => None,
        };

        Ok(Some(ContentItem {
            id,
            title: row.try_get("title")?,
            url: row.try_get("url")?,
            content_type: row.try_get("content_type")?,
            published: row.try_get::<i64, _>("published")? != 0,
            emissions: row.try_get("emissions")?,
            page_size_bytes: optional_size(&row)?,
            resources,
            last_measured_at,
            history: self.fetch_history(id).await?,
        }))
    }

    async fn get_emissions(&self, id: ContentId) -> Result<Option<f64>, RepositoryError> {
        let emissions: Option<Option<f64>> =
            sqlx::query_scalar("SELECT emissions FROM content_items WHERE id = ?")
                .bind(sql_id(id))
                .fetch_optional(&self.pool)
                .await?;
        Ok(emissions.flatten())
    }

    async fn measured_totals(&self) -> Result<MeasuredTotals, RepositoryError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS measured, COALESCE(SUM(emissions), 0.0) AS total
             FROM content_items
             WHERE published = 1 AND emissions IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("measured")?;
        Ok(MeasuredTotals {
            count: count.max(0) as u64,
            sum: row.try_get("total")?,
        })
    }

    async fn heaviest(&self, limit: usize) -> Result<Vec<RankedPage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, title, url, content_type, emissions, page_size_bytes
             FROM content_items
             WHERE published = 1 AND emissions IS NOT NULL
             ORDER BY emissions DESC, id ASC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RankedPage, RepositoryError> {
                Ok(RankedPage {
                    id: content_id(row)?,
                    title: row.try_get("title")?,
                    url: row.try_get("url")?,
                    content_type: row.try_get("content_type")?,
                    emissions: row.try_get("emissions")?,
                    page_size_bytes: optional_size(row)?,
                })
            })
            .collect()
    }

    async fn unmeasured(&self, per_type_limit: usize) -> Result<UntestedPages, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, title, url, content_type
             FROM content_items
             WHERE published = 1 AND emissions IS NULL
             ORDER BY content_type ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped = UntestedPages::new();
        for row in &rows {
            let content_type: String = row.try_get("content_type")?;
            let bucket = grouped.entry(content_type).or_default();
            if bucket.len() >= per_type_limit {
                continue;
            }
            bucket.push(UntestedPage {
                id: content_id(row)?,
                title: row.try_get("title")?,
                url: row.try_get("url")?,
            });
        }
        grouped.retain(|_, pages| !pages.is_empty());
        Ok(grouped)
    }

    async fn save_measurement(
        &self,
        id: ContentId,
        report: &MeasurementReport,
        measured_at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<bool, RepositoryError> {
        let raw_id = sql_id(id);
        let measured_at = measured_at.to_rfc3339();
        let resources = serde_json::to_string(&report.resources)
            .map_err(|err| RepositoryError::corrupt(id.get(), err.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE content_items
             SET emissions = ?, page_size_bytes = ?, resources = ?, last_measured_at = ?
             WHERE id = ?",
        )
        .bind(report.emissions_grams)
        .bind(report.page_size_bytes as i64)
        .bind(&resources)
        .bind(&measured_at)
        .bind(raw_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO measurement_history (content_id, emissions, page_size_bytes, measured_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(raw_id)
        .bind(report.emissions_grams)
        .bind(report.page_size_bytes as i64)
        .bind(&measured_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM measurement_history
             WHERE content_id = ?
               AND id NOT IN (
                   SELECT id FROM measurement_history
                   WHERE content_id = ?
                   ORDER BY id DESC
                   LIMIT ?
               )",
        )
        .bind(raw_id)
        .bind(raw_id)
        .bind(i64::try_from(history_limit).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
