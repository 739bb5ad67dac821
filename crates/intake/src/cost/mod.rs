//! Pricing resolution and cost accounting.

pub mod accountant;
pub mod money;
pub mod pricing;

pub use accountant::{
    estimate_tokens, AppliedRates, CostAccountant, JobCost, Stage, StageCost, Usage,
};
pub use money::Amount;
pub use pricing::{
    LlmRate, ModelPricing, OcrRate, PricingEntry, PricingMode, PricingResolver, RateCard,
    ResolvedRate, UnitKind,
};
