//! Report persistence on SQLite.
//!
//! One `reports` row per analysis. Detection results are stored as JSON blobs next to a few
//! derived columns used for filtering and statistics. Writes go through a single writer
//! lock; reads run concurrently against WAL snapshots.

mod filter;
mod statistics;

pub use filter::ReportFilter;
pub use statistics::{MonthlyDetections, ReportStatistics};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::pipeline::domain::{MicroplasticResult, PlanktonResult, Report, ReportDraft, StageWarning};
use statistics::SpeciesTally;

const MAX_PAGE_SIZE: u32 = 1_000;
const MONTHS_REPORTED: u32 = 12;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slide_name TEXT NOT NULL CHECK (length(trim(slide_name)) > 0),
    created_at INTEGER NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    user TEXT NOT NULL DEFAULT '',
    microplastics_present INTEGER NOT NULL DEFAULT 0,
    particle_count INTEGER,
    confidence REAL,
    microplastic_json TEXT,
    plankton_json TEXT,
    image_path TEXT NOT NULL CHECK (length(image_path) > 0),
    annotated_image_path TEXT,
    roi_paths_json TEXT NOT NULL DEFAULT '[]',
    warnings_json TEXT NOT NULL DEFAULT '[]',
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_reports_created ON reports (created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_reports_location ON reports (location);
"#;

const COLUMNS: &str = "id, slide_name, created_at, location, user, microplastic_json, plankton_json, \
                       image_path, annotated_image_path, roi_paths_json, warnings_json";

#[derive(Clone)]
pub struct ReportStore {
    pool: SqlitePool,
    // Serializes writers and remembers the last assigned timestamp (unix micros).
    writer: Arc<Mutex<i64>>,
}

impl ReportStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM reports")
            .fetch_one(&pool)
            .await?;

        tracing::info!(path = %path.display(), "Report store opened");
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(last.unwrap_or(0))),
        })
    }

    /// Persists a draft in one transaction and returns it with id and timestamp assigned.
    pub async fn create(&self, draft: ReportDraft) -> Result<Report, StoreError> {
        if draft.slide_name.trim().is_empty() {
            return Err(StoreError::MissingField("slide_name"));
        }
        if draft.image_path.as_os_str().is_empty() {
            return Err(StoreError::MissingField("image_path"));
        }
        if draft.microplastic.is_none() && draft.plankton.is_none() {
            return Err(StoreError::MissingField("detection result"));
        }
        if let Some(result) = &draft.microplastic {
            result.validate().map_err(StoreError::InvalidPayload)?;
        }
        if let Some(result) = &draft.plankton {
            result.validate().map_err(StoreError::InvalidPayload)?;
        }

        let microplastic_json = draft.microplastic.as_ref().map(serde_json::to_string).transpose()?;
        let plankton_json = draft.plankton.as_ref().map(serde_json::to_string).transpose()?;
        let warnings_json = serde_json::to_string(&draft.warnings)?;
        let roi_paths_json = serde_json::to_string(&draft.roi_image_paths)?;
        let image_path = draft.image_path.to_string_lossy().into_owned();
        let annotated_path = draft
            .annotated_image_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let mut last_created = self.writer.lock().await;
        // Timestamps never go backwards, so id order and time order agree.
        let created_micros = Utc::now().timestamp_micros().max(*last_created);

        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            r#"
            INSERT INTO reports (
                slide_name, created_at, location, user, microplastics_present, particle_count,
                confidence, microplastic_json, plankton_json, image_path, annotated_image_path,
                roi_paths_json, warnings_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(draft.slide_name.trim())
        .bind(created_micros)
        .bind(&draft.location)
        .bind(&draft.user)
        .bind(draft.microplastic.as_ref().is_some_and(|m| m.present))
        .bind(draft.microplastic.as_ref().map(|m| m.count as i64))
        .bind(draft.microplastic.as_ref().map(|m| m.confidence))
        .bind(&microplastic_json)
        .bind(&plankton_json)
        .bind(&image_path)
        .bind(&annotated_path)
        .bind(&roi_paths_json)
        .bind(&warnings_json)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        *last_created = created_micros;
        drop(last_created);

        tracing::info!(report_id = id, slide = %draft.slide_name, "Report stored");
        Ok(Report {
            id,
            slide_name: draft.slide_name.trim().to_string(),
            created_at: from_micros(created_micros)?,
            location: draft.location,
            user: draft.user,
            microplastic: draft.microplastic,
            plankton: draft.plankton,
            image_path: draft.image_path,
            annotated_image_path: draft.annotated_image_path,
            roi_image_paths: draft.roi_image_paths,
            warnings: draft.warnings,
        })
    }

    pub async fn get(&self, id: i64) -> Result<Report, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM reports WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;
        row_to_report(&row)
    }

    /// Newest first; ties on timestamp are broken by id.
    pub async fn list(&self, filter: &ReportFilter, limit: u32, offset: u32) -> Result<Vec<Report>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COLUMNS} FROM reports WHERE deleted_at IS NULL"
        ));
        filter.push_conditions(&mut query);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit.min(MAX_PAGE_SIZE) as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_report).collect()
    }

    pub async fn count(&self, filter: &ReportFilter) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM reports WHERE deleted_at IS NULL");
        filter.push_conditions(&mut query);
        let count: i64 = query.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Hides a report from every read. Administrative use only.
    pub async fn soft_delete(&self, id: i64) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let affected = sqlx::query("UPDATE reports SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now().timestamp_micros())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::info!(report_id = id, "Report soft-deleted");
        Ok(())
    }

    pub async fn statistics(&self) -> Result<ReportStatistics, StoreError> {
        let week_ago = (Utc::now() - ChronoDuration::days(7)).timestamp_micros();
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(microplastics_present), 0) AS positive,
                AVG(confidence) FILTER (WHERE microplastics_present = 1) AS avg_confidence,
                MIN(confidence) FILTER (WHERE microplastics_present = 1) AS min_confidence,
                MAX(confidence) FILTER (WHERE microplastics_present = 1) AS max_confidence,
                COALESCE(SUM(created_at >= ?), 0) AS recent
            FROM reports
            WHERE deleted_at IS NULL
            "#,
        )
        .bind(week_ago)
        .fetch_one(&self.pool)
        .await?;

        let total = row.try_get::<i64, _>("total")? as u64;
        let positive = row.try_get::<i64, _>("positive")? as u64;

        let blobs: Vec<String> = sqlx::query_scalar(
            "SELECT plankton_json FROM reports WHERE deleted_at IS NULL AND plankton_json IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut tally = SpeciesTally::default();
        for blob in &blobs {
            tally.add(&serde_json::from_str::<PlanktonResult>(blob)?);
        }

        let months = sqlx::query(&format!(
            r#"
            SELECT
                strftime('%Y-%m', created_at / 1000000, 'unixepoch') AS month,
                COUNT(*) AS total,
                COALESCE(SUM(microplastics_present), 0) AS detections
            FROM reports
            WHERE deleted_at IS NULL
            GROUP BY month
            ORDER BY month DESC
            LIMIT {MONTHS_REPORTED}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        let monthly_data = months
            .iter()
            .map(|row| {
                Ok(MonthlyDetections {
                    month: row.try_get("month")?,
                    total: row.try_get::<i64, _>("total")? as u64,
                    detections: row.try_get::<i64, _>("detections")? as u64,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(ReportStatistics {
            total_reports: total,
            with_microplastics: positive,
            detection_rate: ReportStatistics::detection_rate(total, positive),
            average_confidence: row.try_get("avg_confidence")?,
            min_confidence: row.try_get("min_confidence")?,
            max_confidence: row.try_get("max_confidence")?,
            reports_last_7_days: row.try_get::<i64, _>("recent")? as u64,
            species_distribution: tally.finish(),
            monthly_data,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::InvalidPayload(format!("timestamp {micros} is out of range")))
}

fn row_to_report(row: &SqliteRow) -> Result<Report, StoreError> {
    let microplastic = row
        .try_get::<Option<String>, _>("microplastic_json")?
        .map(|json| serde_json::from_str::<MicroplasticResult>(&json))
        .transpose()?;
    let plankton = row
        .try_get::<Option<String>, _>("plankton_json")?
        .map(|json| serde_json::from_str::<PlanktonResult>(&json))
        .transpose()?;
    let warnings: Vec<StageWarning> = serde_json::from_str(&row.try_get::<String, _>("warnings_json")?)?;
    let roi_image_paths: Vec<PathBuf> = serde_json::from_str(&row.try_get::<String, _>("roi_paths_json")?)?;

    Ok(Report {
        id: row.try_get("id")?,
        slide_name: row.try_get("slide_name")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        location: row.try_get("location")?,
        user: row.try_get("user")?,
        microplastic,
        plankton,
        image_path: PathBuf::from(row.try_get::<String, _>("image_path")?),
        annotated_image_path: row
            .try_get::<Option<String>, _>("annotated_image_path")?
            .map(PathBuf::from),
        roi_image_paths,
        warnings,
    })
}
