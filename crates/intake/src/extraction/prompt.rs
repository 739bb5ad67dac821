//! Prompt construction for structured extraction.

use serde_json::Value;

use super::feedback::{lookup_path, ReExtractState};
use crate::sanitize::truncate;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You extract structured data from OCR text of business \
documents such as invoices and receipts. Answer with a single JSON object that conforms to the \
provided JSON schema. Use null for values that are not present in the document. Do not invent \
values and do not add commentary.";

/// Previous responses quoted back to the model are cut to this length.
const MAX_QUOTED_RESPONSE: usize = 4_000;

/// The prompts sent for one model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder<'a> {
    system_prompt: Option<&'a str>,
    schema: &'a Value,
    document_text: &'a str,
    quote_previous: bool,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(system_prompt: Option<&'a str>, schema: &'a Value, document_text: &'a str) -> Self {
        Self {
            system_prompt,
            schema,
            document_text,
            quote_previous: true,
        }
    }

    /// Same prompts, but retries list the problems without quoting the
    /// rejected answer back.
    pub fn without_previous_answer(self) -> Self {
        Self {
            quote_previous: false,
            ..self
        }
    }

    fn system(&self) -> String {
        match self.system_prompt {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    fn schema_text(&self) -> String {
        serde_json::to_string_pretty(self.schema).unwrap_or_else(|_| self.schema.to_string())
    }

    /// Prompt for a full-document extraction attempt.
    pub fn document(&self, state: &ReExtractState) -> Prompt {
        let mut user = format!(
            "Extract the data described by this JSON schema:\n\n{}\n\nDocument text:\n\n{}\n",
            self.schema_text(),
            self.document_text
        );
        append_feedback(&mut user, state, self.quote_previous);
        Prompt {
            system: self.system(),
            user,
        }
    }

    /// Prompt for re-extracting a single field. The answer is expected as
    /// `{ "<field>": <value> }`.
    pub fn field(&self, field: &str, previous_data: Option<&Value>, state: &ReExtractState) -> Prompt {
        let field_schema = field_schema(self.schema, field)
            .map(|s| serde_json::to_string_pretty(s).unwrap_or_else(|_| s.to_string()))
            .unwrap_or_else(|| "(not described by the schema)".to_string());

        let mut user = format!(
            "Re-extract only the field \"{field}\" from the document.\n\nField schema:\n\n{}\n\n\
             Full schema for context:\n\n{}\n",
            field_schema,
            self.schema_text(),
        );
        if let Some(current) = previous_data.and_then(|d| lookup_path(d, field)) {
            user.push_str(&format!("\nThe current value is {} and is believed to be wrong.\n", current));
        }
        user.push_str(&format!(
            "\nDocument text:\n\n{}\n\nAnswer with a JSON object of the form {{\"{}\": <value>}}.\n",
            self.document_text, field
        ));
        append_feedback(&mut user, state, self.quote_previous);
        Prompt {
            system: self.system(),
            user,
        }
    }
}

fn append_feedback(user: &mut String, state: &ReExtractState, quote_previous: bool) {
    if !state.is_retry() {
        return;
    }
    user.push_str(&format!(
        "\nAttempt {} of {}. Your previous answer was rejected.\n",
        state.attempt(),
        state.max_attempts()
    ));
    if let Some(previous) = state.previous_response().filter(|_| quote_previous) {
        user.push_str(&format!(
            "\nPrevious answer:\n{}\n",
            truncate(previous, MAX_QUOTED_RESPONSE)
        ));
    }
    if !state.feedback().is_empty() {
        user.push_str("\nProblems found:\n");
        for problem in state.feedback() {
            user.push_str(&format!("- {}\n", problem));
        }
    }
    user.push_str("\nReturn a corrected JSON object.\n");
}

/// Sub-schema for a dotted field path, following `properties`.
pub fn field_schema<'s>(schema: &'s Value, field: &str) -> Option<&'s Value> {
    field
        .split('.')
        .try_fold(schema, |node, segment| node.get("properties")?.get(segment))
}
