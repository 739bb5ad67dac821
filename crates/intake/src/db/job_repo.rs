//! Job repository: reads and writes for the `jobs` table.
//!
//! Writes are compare-and-set on the stored status so that a worker and a
//! cancel request never silently overwrite each other.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Row};

use super::codec::{opt_ts, parse_enum, parse_opt_ts, parse_ts, to_i64, to_u64, ts};
use super::{Database, DatabaseError};
use crate::cost::{Amount, JobCost};
use crate::job::Job;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub manifest_id: i64,
    pub kind: String,
    pub field_name: Option<String>,
    pub status: String,
    pub progress: i64,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub assistant_response: Option<String>,
    pub attempt_count: i64,
    pub estimated_ocr_nanos: i64,
    pub estimated_llm_nanos: i64,
    pub estimated_ocr_currency: Option<String>,
    pub estimated_llm_currency: Option<String>,
    pub actual_ocr_nanos: i64,
    pub actual_llm_nanos: i64,
    pub actual_ocr_currency: Option<String>,
    pub actual_llm_currency: Option<String>,
    pub llm_input_tokens: i64,
    pub llm_output_tokens: i64,
    pub pages_processed: i64,
    pub cancel_requested_at: Option<String>,
    pub cancel_reason: Option<String>,
    pub canceled_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            manifest_id: row.get("manifest_id")?,
            kind: row.get("kind")?,
            field_name: row.get("field_name")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            model_id: row.get("model_id")?,
            system_prompt: row.get("system_prompt")?,
            user_prompt: row.get("user_prompt")?,
            assistant_response: row.get("assistant_response")?,
            attempt_count: row.get("attempt_count")?,
            estimated_ocr_nanos: row.get("estimated_ocr_nanos")?,
            estimated_llm_nanos: row.get("estimated_llm_nanos")?,
            estimated_ocr_currency: row.get("estimated_ocr_currency")?,
            estimated_llm_currency: row.get("estimated_llm_currency")?,
            actual_ocr_nanos: row.get("actual_ocr_nanos")?,
            actual_llm_nanos: row.get("actual_llm_nanos")?,
            actual_ocr_currency: row.get("actual_ocr_currency")?,
            actual_llm_currency: row.get("actual_llm_currency")?,
            llm_input_tokens: row.get("llm_input_tokens")?,
            llm_output_tokens: row.get("llm_output_tokens")?,
            pages_processed: row.get("pages_processed")?,
            cancel_requested_at: row.get("cancel_requested_at")?,
            cancel_reason: row.get("cancel_reason")?,
            canceled_at: row.get("canceled_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error: row.get("error")?,
            error_kind: row.get("error_kind")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            manifest_id: job.manifest_id,
            kind: job.kind.as_str().to_string(),
            field_name: job.field_name.clone(),
            status: job.status.as_str().to_string(),
            progress: i64::from(job.progress),
            model_id: job.model_id.clone(),
            system_prompt: job.system_prompt.clone(),
            user_prompt: job.user_prompt.clone(),
            assistant_response: job.assistant_response.clone(),
            attempt_count: i64::from(job.attempt_count),
            estimated_ocr_nanos: job.estimated_cost.ocr.nanos(),
            estimated_llm_nanos: job.estimated_cost.llm.nanos(),
            estimated_ocr_currency: job.estimated_cost.ocr_currency.clone(),
            estimated_llm_currency: job.estimated_cost.llm_currency.clone(),
            actual_ocr_nanos: job.actual_cost.ocr.nanos(),
            actual_llm_nanos: job.actual_cost.llm.nanos(),
            actual_ocr_currency: job.actual_cost.ocr_currency.clone(),
            actual_llm_currency: job.actual_cost.llm_currency.clone(),
            llm_input_tokens: to_i64(job.llm_input_tokens),
            llm_output_tokens: to_i64(job.llm_output_tokens),
            pages_processed: i64::from(job.pages_processed),
            cancel_requested_at: opt_ts(&job.cancel_requested_at),
            cancel_reason: job.cancel_reason.clone(),
            canceled_at: opt_ts(&job.canceled_at),
            started_at: opt_ts(&job.started_at),
            completed_at: opt_ts(&job.completed_at),
            error: job.error.clone(),
            error_kind: job.error_kind.map(|k| k.as_str().to_string()),
            created_at: ts(&job.created_at),
            updated_at: ts(&job.updated_at),
        }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let small = |column: &'static str, value: i64| -> Result<u32, DatabaseError> {
            u32::try_from(value).map_err(|_| DatabaseError::Decode {
                column,
                reason: format!("value {} out of range", value),
            })
        };

        Ok(Job {
            kind: parse_enum("kind", &row.kind)?,
            status: parse_enum("status", &row.status)?,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(100),
            attempt_count: small("attempt_count", row.attempt_count)?,
            estimated_cost: JobCost {
                ocr: Amount::from_nanos(row.estimated_ocr_nanos),
                llm: Amount::from_nanos(row.estimated_llm_nanos),
                ocr_currency: row.estimated_ocr_currency,
                llm_currency: row.estimated_llm_currency,
            },
            actual_cost: JobCost {
                ocr: Amount::from_nanos(row.actual_ocr_nanos),
                llm: Amount::from_nanos(row.actual_llm_nanos),
                ocr_currency: row.actual_ocr_currency,
                llm_currency: row.actual_llm_currency,
            },
            llm_input_tokens: to_u64("llm_input_tokens", row.llm_input_tokens)?,
            llm_output_tokens: to_u64("llm_output_tokens", row.llm_output_tokens)?,
            pages_processed: small("pages_processed", row.pages_processed)?,
            cancel_requested_at: parse_opt_ts("cancel_requested_at", row.cancel_requested_at)?,
            canceled_at: parse_opt_ts("canceled_at", row.canceled_at)?,
            started_at: parse_opt_ts("started_at", row.started_at)?,
            completed_at: parse_opt_ts("completed_at", row.completed_at)?,
            error_kind: row
                .error_kind
                .as_deref()
                .map(|k| parse_enum("error_kind", k))
                .transpose()?,
            created_at: parse_ts("created_at", &row.created_at)?,
            updated_at: parse_ts("updated_at", &row.updated_at)?,
            id: row.id,
            manifest_id: row.manifest_id,
            field_name: row.field_name,
            model_id: row.model_id,
            system_prompt: row.system_prompt,
            user_prompt: row.user_prompt,
            assistant_response: row.assistant_response,
            cancel_reason: row.cancel_reason,
            error: row.error,
        })
    }
}

const TERMINAL_SQL: &str = "('completed', 'failed', 'canceled')";

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, manifest_id, kind, field_name, status, progress, model_id,
             system_prompt, user_prompt, assistant_response, attempt_count,
             estimated_ocr_nanos, estimated_llm_nanos, estimated_ocr_currency, estimated_llm_currency,
             actual_ocr_nanos, actual_llm_nanos, actual_ocr_currency, actual_llm_currency,
             llm_input_tokens, llm_output_tokens, pages_processed,
             cancel_requested_at, cancel_reason, canceled_at, started_at, completed_at,
             error, error_kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31)",
            params![
                job.id,
                job.manifest_id,
                job.kind,
                job.field_name,
                job.status,
                job.progress,
                job.model_id,
                job.system_prompt,
                job.user_prompt,
                job.assistant_response,
                job.attempt_count,
                job.estimated_ocr_nanos,
                job.estimated_llm_nanos,
                job.estimated_ocr_currency,
                job.estimated_llm_currency,
                job.actual_ocr_nanos,
                job.actual_llm_nanos,
                job.actual_ocr_currency,
                job.actual_llm_currency,
                job.llm_input_tokens,
                job.llm_output_tokens,
                job.pages_processed,
                job.cancel_requested_at,
                job.cancel_reason,
                job.canceled_at,
                job.started_at,
                job.completed_at,
                job.error,
                job.error_kind,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Overwrites a job row only while its stored status equals `expected`.
///
/// Terminal rows are never rewritten. Cancel audit columns keep their stored
/// value when one exists. Returns whether a row was written.
pub fn update_if_status(db: &Database, job: &JobRow, expected: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE jobs SET status=?3, progress=?4, model_id=?5, system_prompt=?6,
                 user_prompt=?7, assistant_response=?8, attempt_count=?9,
                 estimated_ocr_nanos=?10, estimated_llm_nanos=?11,
                 estimated_ocr_currency=?12, estimated_llm_currency=?13,
                 actual_ocr_nanos=?14, actual_llm_nanos=?15,
                 actual_ocr_currency=?16, actual_llm_currency=?17,
                 llm_input_tokens=?18, llm_output_tokens=?19, pages_processed=?20,
                 cancel_requested_at=COALESCE(cancel_requested_at, ?21),
                 cancel_reason=COALESCE(cancel_reason, ?22),
                 canceled_at=?23, started_at=?24, completed_at=?25,
                 error=?26, error_kind=?27, updated_at=?28
                 WHERE id=?1 AND status=?2 AND status NOT IN {}",
                TERMINAL_SQL
            ),
            params![
                job.id,
                expected,
                job.status,
                job.progress,
                job.model_id,
                job.system_prompt,
                job.user_prompt,
                job.assistant_response,
                job.attempt_count,
                job.estimated_ocr_nanos,
                job.estimated_llm_nanos,
                job.estimated_ocr_currency,
                job.estimated_llm_currency,
                job.actual_ocr_nanos,
                job.actual_llm_nanos,
                job.actual_ocr_currency,
                job.actual_llm_currency,
                job.llm_input_tokens,
                job.llm_output_tokens,
                job.pages_processed,
                job.cancel_requested_at,
                job.cancel_reason,
                job.canceled_at,
                job.started_at,
                job.completed_at,
                job.error,
                job.error_kind,
                job.updated_at,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Stamps a cancellation request on a non-terminal job, keeping any
/// earlier request. Returns false for unknown or terminal jobs.
pub fn record_cancel_request(
    db: &Database,
    id: &str,
    reason: Option<&str>,
    at: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE jobs SET cancel_requested_at=COALESCE(cancel_requested_at, ?2),
                 cancel_reason=COALESCE(cancel_reason, ?3), updated_at=?2
                 WHERE id=?1 AND status NOT IN {}",
                TERMINAL_SQL
            ),
            params![id, ts(at), reason],
        )?;
        Ok(changed == 1)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Jobs newest first, optionally restricted to one manifest.
pub fn history(db: &Database, manifest_id: Option<i64>, limit: u64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE (?1 IS NULL OR manifest_id = ?1)
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![manifest_id, to_i64(limit)], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Jobs whose status is one of `statuses`, oldest first.
pub fn list_by_status(db: &Database, statuses: &[&str]) -> Result<Vec<JobRow>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| {
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM jobs WHERE status IN ({}) ORDER BY created_at ASC, rowid ASC",
            placeholders
        ))?;
        let rows = stmt
            .query_map(params_from_iter(statuses.iter()), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
