//! Catalog repository: projects, extractors and LLM models.
//!
//! Extractor configs and pricing are stored as JSON documents. Pricing
//! history appends run inside a transaction so concurrent appends cannot
//! interleave.

use rusqlite::{params, OptionalExtension, Row};

use super::codec::{from_json, to_i64, to_json, to_u64};
use super::{Database, DatabaseError};
use crate::catalog::{ExtractionStrategy, Extractor, LlmModel, Project};
use crate::cost::{ModelPricing, PricingEntry};
use crate::error::RepositoryError;

/// A raw extractor row from the database.
#[derive(Debug, Clone)]
pub struct ExtractorRow {
    pub id: String,
    pub name: String,
    pub config: String,
    pub pricing: String,
    pub is_active: bool,
    pub is_default: bool,
}

impl ExtractorRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            config: row.get("config")?,
            pricing: row.get("pricing")?,
            is_active: row.get("is_active")?,
            is_default: row.get("is_default")?,
        })
    }
}

impl TryFrom<ExtractorRow> for Extractor {
    type Error = DatabaseError;

    fn try_from(row: ExtractorRow) -> Result<Self, Self::Error> {
        Ok(Extractor {
            config: from_json("config", &row.config)?,
            pricing: from_json("pricing", &row.pricing)?,
            id: row.id,
            name: row.name,
            is_active: row.is_active,
            is_default: row.is_default,
        })
    }
}

/// A raw model row from the database.
#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window_tokens: i64,
    pub pricing: String,
    pub is_active: bool,
}

impl ModelRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            provider: row.get("provider")?,
            context_window_tokens: row.get("context_window_tokens")?,
            pricing: row.get("pricing")?,
            is_active: row.get("is_active")?,
        })
    }
}

impl TryFrom<ModelRow> for LlmModel {
    type Error = DatabaseError;

    fn try_from(row: ModelRow) -> Result<Self, Self::Error> {
        Ok(LlmModel {
            context_window_tokens: to_u64(
                "context_window_tokens",
                row.context_window_tokens,
            )?,
            pricing: from_json("pricing", &row.pricing)?,
            id: row.id,
            name: row.name,
            provider: row.provider,
            is_active: row.is_active,
        })
    }
}

/// A raw project row from the database.
#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub llm_model_id: Option<String>,
    pub text_extractor_id: Option<String>,
    pub json_schema: String,
    pub system_prompt: Option<String>,
    pub extraction_strategy: Option<String>,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            llm_model_id: row.get("llm_model_id")?,
            text_extractor_id: row.get("text_extractor_id")?,
            json_schema: row.get("json_schema")?,
            system_prompt: row.get("system_prompt")?,
            extraction_strategy: row.get("extraction_strategy")?,
        })
    }
}

impl TryFrom<ProjectRow> for Project {
    type Error = DatabaseError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        let extraction_strategy = row
            .extraction_strategy
            .as_deref()
            .map(parse_strategy)
            .transpose()?;
        Ok(Project {
            json_schema: from_json("json_schema", &row.json_schema)?,
            extraction_strategy,
            id: row.id,
            name: row.name,
            llm_model_id: row.llm_model_id,
            text_extractor_id: row.text_extractor_id,
            system_prompt: row.system_prompt,
        })
    }
}

fn strategy_str(strategy: ExtractionStrategy) -> &'static str {
    match strategy {
        ExtractionStrategy::OcrFirst => "ocr_first",
        ExtractionStrategy::ReuseOcr => "reuse_ocr",
    }
}

fn parse_strategy(raw: &str) -> Result<ExtractionStrategy, DatabaseError> {
    match raw {
        "ocr_first" => Ok(ExtractionStrategy::OcrFirst),
        "reuse_ocr" => Ok(ExtractionStrategy::ReuseOcr),
        other => Err(DatabaseError::Decode {
            column: "extraction_strategy",
            reason: format!("unknown strategy '{}'", other),
        }),
    }
}

pub fn insert_project(db: &Database, project: &Project) -> Result<(), DatabaseError> {
    let schema = to_json("json_schema", &project.json_schema)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO projects (id, name, llm_model_id, text_extractor_id, json_schema,
             system_prompt, extraction_strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project.id,
                project.name,
                project.llm_model_id,
                project.text_extractor_id,
                schema,
                project.system_prompt,
                project.extraction_strategy.map(strategy_str),
            ],
        )?;
        Ok(())
    })
}

pub fn find_project(db: &Database, id: i64) -> Result<Option<ProjectRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM projects WHERE id = ?1", params![id], ProjectRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Inserts or replaces an extractor. Flagging it as default clears the flag
/// on every other extractor.
pub fn upsert_extractor(db: &Database, extractor: &Extractor) -> Result<(), DatabaseError> {
    let config = to_json("config", &extractor.config)?;
    let pricing = to_json("pricing", &extractor.pricing)?;
    db.with_transaction(|tx| {
        if extractor.is_default {
            tx.execute(
                "UPDATE extractors SET is_default = 0 WHERE id != ?1",
                params![extractor.id],
            )?;
        }
        tx.execute(
            "INSERT INTO extractors (id, name, config, pricing, is_active, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, config = excluded.config,
               pricing = excluded.pricing, is_active = excluded.is_active,
               is_default = excluded.is_default",
            params![
                extractor.id,
                extractor.name,
                config,
                pricing,
                extractor.is_active,
                extractor.is_default,
            ],
        )?;
        Ok(())
    })
}

pub fn find_extractor(db: &Database, id: &str) -> Result<Option<ExtractorRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM extractors WHERE id = ?1",
                params![id],
                ExtractorRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// The active extractor flagged as default.
pub fn default_extractor(db: &Database) -> Result<Option<ExtractorRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM extractors WHERE is_default = 1 AND is_active = 1
                 ORDER BY id LIMIT 1",
                [],
                ExtractorRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn upsert_model(db: &Database, model: &LlmModel) -> Result<(), DatabaseError> {
    let pricing = to_json("pricing", &model.pricing)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO llm_models (id, name, provider, context_window_tokens, pricing, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, provider = excluded.provider,
               context_window_tokens = excluded.context_window_tokens,
               pricing = excluded.pricing, is_active = excluded.is_active",
            params![
                model.id,
                model.name,
                model.provider,
                to_i64(model.context_window_tokens),
                pricing,
                model.is_active,
            ],
        )?;
        Ok(())
    })
}

pub fn find_model(db: &Database, id: &str) -> Result<Option<ModelRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM llm_models WHERE id = ?1", params![id], ModelRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Table holding a pricing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingOwner {
    Model,
    Extractor,
}

impl PricingOwner {
    fn table(self) -> &'static str {
        match self {
            PricingOwner::Model => "llm_models",
            PricingOwner::Extractor => "extractors",
        }
    }

    fn entity(self) -> &'static str {
        match self {
            PricingOwner::Model => "LLM model",
            PricingOwner::Extractor => "Extractor",
        }
    }
}

/// Appends a history entry to the owner's pricing document.
///
/// Entries dated before the latest one are rejected with
/// `PricingError::OutOfOrder` and nothing is written.
pub fn append_pricing(
    db: &Database,
    owner: PricingOwner,
    owner_id: &str,
    entry: PricingEntry,
) -> Result<(), RepositoryError> {
    let table = owner.table();
    let outcome = db.with_transaction(|tx| {
        let raw: Option<String> = tx
            .query_row(
                &format!("SELECT pricing FROM {} WHERE id = ?1", table),
                params![owner_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(Err(RepositoryError::NotFound {
                entity: owner.entity(),
                id: owner_id.to_string(),
            }));
        };

        let mut pricing: ModelPricing = from_json("pricing", &raw)?;
        if let Err(e) = pricing.push_history(owner_id, entry) {
            return Ok(Err(RepositoryError::Pricing(e)));
        }

        tx.execute(
            &format!("UPDATE {} SET pricing = ?2 WHERE id = ?1", table),
            params![owner_id, to_json("pricing", &pricing)?],
        )?;
        log::info!("Appended pricing entry for {} '{}'", owner.entity(), owner_id);
        Ok(Ok(()))
    })?;
    outcome
}
