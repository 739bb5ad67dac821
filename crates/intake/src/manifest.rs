//! Uploaded documents and the results recorded against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cost::Amount;
use crate::script::{ExportReport, ValidationReport};

/// Text produced by the OCR stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    /// Full document text, pages separated by blank lines.
    pub text: String,
    pub pages: Vec<String>,
    pub extractor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl OcrResult {
    pub fn from_pages(extractor_id: &str, pages: Vec<String>, scores: &[f64]) -> Self {
        let quality_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };
        Self {
            text: pages.join("\n\n"),
            pages,
            extractor_id: extractor_id.to_string(),
            quality_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: i64,
    pub group_id: i64,
    pub project_id: i64,
    pub filename: String,
    pub storage_path: String,
    pub public_path: Option<String>,
    pub file_type: String,
    pub file_size: u64,
    pub content_sha256: Option<String>,
    pub page_count: Option<u32>,
    pub ocr_result: Option<OcrResult>,
    pub ocr_processed_at: Option<DateTime<Utc>>,
    pub ocr_quality_score: Option<f64>,
    pub text_extractor_id: Option<String>,
    pub extracted_data: Option<Value>,
    pub extraction_cost: Option<Amount>,
    pub extraction_cost_currency: Option<String>,
    pub validation_results: Option<ValidationReport>,
    pub export_outputs: Option<ExportReport>,
    pub created_at: DateTime<Utc>,
    /// Last time a result was recorded against the manifest.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewManifest {
    pub group_id: i64,
    pub project_id: i64,
    pub filename: String,
    pub storage_path: String,
    pub public_path: Option<String>,
    pub file_type: String,
    pub file_size: u64,
    pub content_sha256: Option<String>,
    pub page_count: Option<u32>,
    pub text_extractor_id: Option<String>,
}

/// Extraction outcome written to a manifest when a job succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRecord {
    pub data: Value,
    pub cost: Amount,
    pub currency: Option<String>,
}
