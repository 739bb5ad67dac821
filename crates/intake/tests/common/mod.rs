//! Shared test utilities for intake integration tests.
//!
//! This module provides:
//! - Scripted fakes for the storage, OCR and LLM ports
//! - `TestHarness`, an in-memory store seeded with a project, model and
//!   extractor, plus helpers to run jobs end to end

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::*;
