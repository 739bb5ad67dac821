//! Script repository: per-project validation and export scripts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::codec::{parse_ts, ts};
use super::{Database, DatabaseError};
use crate::script::{
    ExportScript, NewExportScript, NewValidationScript, Severity, ValidationScript,
};

/// A raw validation script row from the database.
#[derive(Debug, Clone)]
pub struct ValidationScriptRow {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub severity: String,
    pub enabled: bool,
    pub created_at: String,
}

impl ValidationScriptRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            script: row.get("script")?,
            severity: row.get("severity")?,
            enabled: row.get("enabled")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl TryFrom<ValidationScriptRow> for ValidationScript {
    type Error = DatabaseError;

    fn try_from(row: ValidationScriptRow) -> Result<Self, Self::Error> {
        let severity = Severity::parse(&row.severity).ok_or_else(|| DatabaseError::Decode {
            column: "severity",
            reason: format!("unknown severity '{}'", row.severity),
        })?;
        Ok(ValidationScript {
            created_at: parse_ts("created_at", &row.created_at)?,
            severity,
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            script: row.script,
            enabled: row.enabled,
        })
    }
}

/// A raw export script row from the database.
#[derive(Debug, Clone)]
pub struct ExportScriptRow {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub script: String,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: String,
}

impl ExportScriptRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            script: row.get("script")?,
            priority: row.get("priority")?,
            enabled: row.get("enabled")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl TryFrom<ExportScriptRow> for ExportScript {
    type Error = DatabaseError;

    fn try_from(row: ExportScriptRow) -> Result<Self, Self::Error> {
        Ok(ExportScript {
            created_at: parse_ts("created_at", &row.created_at)?,
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            script: row.script,
            priority: row.priority,
            enabled: row.enabled,
        })
    }
}

/// Inserts a validation script and returns its id.
pub fn insert_validation(
    db: &Database,
    script: &NewValidationScript,
    created_at: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO validation_scripts (project_id, name, script, severity, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                script.project_id,
                script.name,
                script.script,
                script.severity.as_str(),
                script.enabled,
                ts(created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Inserts an export script and returns its id.
pub fn insert_export(
    db: &Database,
    script: &NewExportScript,
    created_at: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO export_scripts (project_id, name, script, priority, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                script.project_id,
                script.name,
                script.script,
                script.priority,
                script.enabled,
                ts(created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Enabled validation scripts of a project in creation order.
pub fn enabled_validation(db: &Database, project_id: i64) -> Result<Vec<ValidationScriptRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM validation_scripts WHERE project_id = ?1 AND enabled = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id], ValidationScriptRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Enabled export scripts of a project by ascending priority; ties keep
/// creation order.
pub fn enabled_export(db: &Database, project_id: i64) -> Result<Vec<ExportScriptRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM export_scripts WHERE project_id = ?1 AND enabled = 1
             ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], ExportScriptRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
