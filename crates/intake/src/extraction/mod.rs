//! LLM extraction helpers: prompt building, response parsing and the
//! bounded re-extraction loop.

pub mod feedback;
pub mod prompt;

pub use feedback::{
    lookup_path, merge_field, parse_response, strip_code_fences, OutputValidator, ReExtractState,
};
pub use prompt::{field_schema, Prompt, PromptBuilder, DEFAULT_SYSTEM_PROMPT};
