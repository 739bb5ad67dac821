//! Projects, extractors and LLM models that jobs are run against.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cost::{ModelPricing, PricingMode};
use crate::error::ConfigError;

const PADDLEOCR_SCHEMA: &str = include_str!("../../../schema/extractors/paddleocr.json");
const TESSERACT_SCHEMA: &str = include_str!("../../../schema/extractors/tesseract.json");
const VISION_LLM_SCHEMA: &str = include_str!("../../../schema/extractors/vision-llm.json");

/// Decides whether a stored OCR result may stand in for a fresh OCR pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Always OCR the document, then run LLM extraction over the text.
    OcrFirst,
    /// Reuse the manifest's stored OCR result when present.
    #[default]
    ReuseOcr,
}

/// Backend-specific extractor configuration, tagged by `extractorType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "extractorType")]
pub enum ExtractorConfig {
    #[serde(rename = "paddleocr", rename_all = "camelCase")]
    PaddleOcr {
        endpoint: String,
        #[serde(default)]
        languages: Vec<String>,
        #[serde(default)]
        use_angle_classifier: bool,
        #[serde(default)]
        pricing_mode: PricingMode,
    },
    #[serde(rename = "tesseract", rename_all = "camelCase")]
    Tesseract {
        #[serde(default = "default_languages")]
        languages: Vec<String>,
        #[serde(default = "default_dpi")]
        dpi: u32,
    },
    #[serde(rename = "vision-llm", rename_all = "camelCase")]
    VisionLlm {
        provider: String,
        model: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        max_output_tokens: Option<u32>,
        #[serde(default = "default_token_mode")]
        pricing_mode: PricingMode,
    },
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_dpi() -> u32 {
    300
}

fn default_token_mode() -> PricingMode {
    PricingMode::Token
}

impl ExtractorConfig {
    /// Validates a raw config against the schema for its `extractorType`
    /// and deserializes it.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let extractor_type = value
            .get("extractorType")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::InvalidExtractor {
                extractor_type: "<missing>".to_string(),
                reason: "extractorType is required".to_string(),
            })?;

        let schema_src = match extractor_type {
            "paddleocr" => PADDLEOCR_SCHEMA,
            "tesseract" => TESSERACT_SCHEMA,
            "vision-llm" => VISION_LLM_SCHEMA,
            other => {
                return Err(ConfigError::InvalidExtractor {
                    extractor_type: other.to_string(),
                    reason: "unknown extractor type".to_string(),
                })
            }
        };

        let invalid = |reason: String| ConfigError::InvalidExtractor {
            extractor_type: extractor_type.to_string(),
            reason,
        };

        let schema: Value = serde_json::from_str(schema_src)
            .map_err(|e| invalid(format!("invalid embedded schema: {}", e)))?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| invalid(format!("failed to compile schema: {}", e)))?;

        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(invalid(errors.join("; ")));
        }

        serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))
    }

    pub fn extractor_type(&self) -> &'static str {
        match self {
            ExtractorConfig::PaddleOcr { .. } => "paddleocr",
            ExtractorConfig::Tesseract { .. } => "tesseract",
            ExtractorConfig::VisionLlm { .. } => "vision-llm",
        }
    }

    pub fn pricing_mode(&self) -> PricingMode {
        match self {
            ExtractorConfig::PaddleOcr { pricing_mode, .. } => *pricing_mode,
            ExtractorConfig::Tesseract { .. } => PricingMode::Page,
            ExtractorConfig::VisionLlm { pricing_mode, .. } => *pricing_mode,
        }
    }
}

/// A configured OCR or vision-LLM backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extractor {
    pub id: String,
    pub name: String,
    pub config: ExtractorConfig,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_true() -> bool {
    true
}

impl Extractor {
    pub fn pricing_mode(&self) -> PricingMode {
        self.config.pricing_mode()
    }
}

/// An LLM used for structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window_tokens: u64,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Project-level extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub llm_model_id: Option<String>,
    #[serde(default)]
    pub text_extractor_id: Option<String>,
    /// JSON schema the extracted data must satisfy.
    pub json_schema: Value,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub extraction_strategy: Option<ExtractionStrategy>,
}
