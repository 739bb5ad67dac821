//! Manifest repository: uploaded documents and the results stored on them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::codec::{from_opt_json, parse_opt_ts, parse_ts, to_i64, to_json, to_u64, ts};
use super::{Database, DatabaseError};
use crate::cost::Amount;
use crate::manifest::{ExtractionRecord, Manifest, NewManifest, OcrResult};
use crate::script::{ExportReport, ValidationReport};

/// A raw manifest row from the database.
#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub id: i64,
    pub group_id: i64,
    pub project_id: i64,
    pub filename: String,
    pub storage_path: String,
    pub public_path: Option<String>,
    pub file_type: String,
    pub file_size: i64,
    pub content_sha256: Option<String>,
    pub page_count: Option<i64>,
    pub ocr_result: Option<String>,
    pub ocr_processed_at: Option<String>,
    pub ocr_quality_score: Option<f64>,
    pub text_extractor_id: Option<String>,
    pub extracted_data: Option<String>,
    pub extraction_cost_nanos: Option<i64>,
    pub extraction_cost_currency: Option<String>,
    pub validation_results: Option<String>,
    pub export_outputs: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl ManifestRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            group_id: row.get("group_id")?,
            project_id: row.get("project_id")?,
            filename: row.get("filename")?,
            storage_path: row.get("storage_path")?,
            public_path: row.get("public_path")?,
            file_type: row.get("file_type")?,
            file_size: row.get("file_size")?,
            content_sha256: row.get("content_sha256")?,
            page_count: row.get("page_count")?,
            ocr_result: row.get("ocr_result")?,
            ocr_processed_at: row.get("ocr_processed_at")?,
            ocr_quality_score: row.get("ocr_quality_score")?,
            text_extractor_id: row.get("text_extractor_id")?,
            extracted_data: row.get("extracted_data")?,
            extraction_cost_nanos: row.get("extraction_cost_nanos")?,
            extraction_cost_currency: row.get("extraction_cost_currency")?,
            validation_results: row.get("validation_results")?,
            export_outputs: row.get("export_outputs")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl TryFrom<ManifestRow> for Manifest {
    type Error = DatabaseError;

    fn try_from(row: ManifestRow) -> Result<Self, Self::Error> {
        let page_count = row
            .page_count
            .map(|p| {
                u32::try_from(p).map_err(|_| DatabaseError::Decode {
                    column: "page_count",
                    reason: format!("value {} out of range", p),
                })
            })
            .transpose()?;

        Ok(Manifest {
            file_size: to_u64("file_size", row.file_size)?,
            page_count,
            ocr_result: from_opt_json::<OcrResult>("ocr_result", row.ocr_result)?,
            ocr_processed_at: parse_opt_ts("ocr_processed_at", row.ocr_processed_at)?,
            extracted_data: from_opt_json("extracted_data", row.extracted_data)?,
            extraction_cost: row.extraction_cost_nanos.map(Amount::from_nanos),
            validation_results: from_opt_json::<ValidationReport>(
                "validation_results",
                row.validation_results,
            )?,
            export_outputs: from_opt_json::<ExportReport>("export_outputs", row.export_outputs)?,
            created_at: parse_ts("created_at", &row.created_at)?,
            updated_at: parse_opt_ts("updated_at", row.updated_at)?,
            id: row.id,
            group_id: row.group_id,
            project_id: row.project_id,
            filename: row.filename,
            storage_path: row.storage_path,
            public_path: row.public_path,
            file_type: row.file_type,
            content_sha256: row.content_sha256,
            ocr_quality_score: row.ocr_quality_score,
            text_extractor_id: row.text_extractor_id,
            extraction_cost_currency: row.extraction_cost_currency,
        })
    }
}

/// Inserts a manifest and returns its id.
///
/// A digest already present in the group yields `UniqueViolation`.
pub fn insert(db: &Database, manifest: &NewManifest, created_at: &DateTime<Utc>) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO manifests (group_id, project_id, filename, storage_path, public_path,
             file_type, file_size, content_sha256, page_count, text_extractor_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                manifest.group_id,
                manifest.project_id,
                manifest.filename,
                manifest.storage_path,
                manifest.public_path,
                manifest.file_type,
                to_i64(manifest.file_size),
                manifest.content_sha256,
                manifest.page_count,
                manifest.text_extractor_id,
                ts(created_at),
            ],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(conn.last_insert_rowid())
    })
}

/// Finds a manifest by its ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<ManifestRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM manifests WHERE id = ?1", params![id], ManifestRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Finds the manifest in `group_id` carrying `content_sha256`.
pub fn find_by_content_hash(
    db: &Database,
    group_id: i64,
    content_sha256: &str,
) -> Result<Option<ManifestRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM manifests WHERE group_id = ?1 AND content_sha256 = ?2",
                params![group_id, content_sha256],
                ManifestRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Stores the content digest. Same uniqueness rule as `insert`.
pub fn set_content_hash(db: &Database, id: i64, content_sha256: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE manifests SET content_sha256 = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, content_sha256, ts(&Utc::now())],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(())
    })
}

pub fn save_ocr_result(
    db: &Database,
    id: i64,
    result: &OcrResult,
    page_count: u32,
    processed_at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let json = to_json("ocr_result", result)?;
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE manifests SET ocr_result = ?2, page_count = ?3, ocr_processed_at = ?4,
             ocr_quality_score = ?5, text_extractor_id = COALESCE(text_extractor_id, ?6),
             updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                json,
                page_count,
                ts(processed_at),
                result.quality_score,
                result.extractor_id,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    })
}

pub fn save_extraction(db: &Database, id: i64, record: &ExtractionRecord) -> Result<(), DatabaseError> {
    let json = to_json("extracted_data", &record.data)?;
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE manifests SET extracted_data = ?2, extraction_cost_nanos = ?3,
             extraction_cost_currency = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, json, record.cost.nanos(), record.currency, ts(&Utc::now())],
        )?;
        Ok(())
    })
}

pub fn save_validation_results(
    db: &Database,
    id: i64,
    report: &ValidationReport,
) -> Result<(), DatabaseError> {
    let json = to_json("validation_results", report)?;
    save_json_column(db, id, "validation_results", json)
}

pub fn save_export_outputs(db: &Database, id: i64, report: &ExportReport) -> Result<(), DatabaseError> {
    let json = to_json("export_outputs", report)?;
    save_json_column(db, id, "export_outputs", json)
}

fn save_json_column(db: &Database, id: i64, column: &'static str, json: String) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            &format!("UPDATE manifests SET {} = ?2, updated_at = ?3 WHERE id = ?1", column),
            params![id, json, ts(&Utc::now())],
        )?;
        Ok(())
    })
}

/// Decodes a raw row.
pub fn decode(row: ManifestRow) -> Result<Manifest, DatabaseError> {
    Manifest::try_from(row)
}
