//! Per-stage cost estimation and actualization.

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::money::Amount;
use super::pricing::{ModelPricing, PricingMode, PricingResolver, ResolvedRate, UnitKind};
use crate::error::PricingError;

/// Characters per token used when a provider reports no usage.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Rough token count for a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Units consumed (or planned) by one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn pages(pages: u32) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn tokens(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            pages: 0,
            input_tokens,
            output_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        self.pages = self.pages.saturating_add(rhs.pages);
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ocr,
    Llm,
}

/// Rates resolved once per stage and reused for every call in it.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedRates {
    Page(ResolvedRate),
    Token {
        input: ResolvedRate,
        output: ResolvedRate,
    },
}

impl AppliedRates {
    pub fn currency(&self) -> &str {
        match self {
            AppliedRates::Page(rate) => &rate.currency,
            AppliedRates::Token { input, .. } => &input.currency,
        }
    }

    fn minimum_charge(&self) -> Option<Amount> {
        match self {
            AppliedRates::Page(rate) => rate.minimum_charge,
            AppliedRates::Token { input, .. } => input.minimum_charge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCost {
    pub amount: Amount,
    pub currency: String,
}

/// OCR and LLM sub-totals of one job, each with its own currency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCost {
    pub ocr: Amount,
    pub llm: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_currency: Option<String>,
}

impl JobCost {
    pub fn total(&self) -> Amount {
        self.ocr + self.llm
    }

    /// The single currency of this cost, if the components agree.
    pub fn currency(&self) -> Option<&str> {
        match (self.ocr_currency.as_deref(), self.llm_currency.as_deref()) {
            (Some(a), Some(b)) if a == b => Some(a),
            (Some(_), Some(_)) => None,
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    pub fn has_currency_mismatch(&self) -> bool {
        matches!(
            (self.ocr_currency.as_deref(), self.llm_currency.as_deref()),
            (Some(a), Some(b)) if a != b
        )
    }

    pub fn stage(&self, stage: Stage) -> Amount {
        match stage {
            Stage::Ocr => self.ocr,
            Stage::Llm => self.llm,
        }
    }
}

/// Computes stage costs from usage and resolved rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostAccountant {
    resolver: PricingResolver,
}

impl CostAccountant {
    pub fn new() -> Self {
        Self {
            resolver: PricingResolver::new(),
        }
    }

    /// Resolves the rates a stage will be billed at.
    pub fn rates(
        &self,
        owner_id: &str,
        pricing: &ModelPricing,
        mode: PricingMode,
        as_of: DateTime<Utc>,
    ) -> Result<AppliedRates, PricingError> {
        match mode {
            PricingMode::Page => Ok(AppliedRates::Page(self.resolver.rate_for(
                owner_id,
                pricing,
                UnitKind::Page,
                as_of,
            )?)),
            PricingMode::Token => Ok(AppliedRates::Token {
                input: self
                    .resolver
                    .rate_for(owner_id, pricing, UnitKind::InputToken, as_of)?,
                output: self
                    .resolver
                    .rate_for(owner_id, pricing, UnitKind::OutputToken, as_of)?,
            }),
        }
    }

    /// Cost of planned usage at the rates in effect at `as_of`.
    pub fn estimate(
        &self,
        owner_id: &str,
        pricing: &ModelPricing,
        mode: PricingMode,
        planned: Usage,
        as_of: DateTime<Utc>,
    ) -> Result<StageCost, PricingError> {
        let rates = self.rates(owner_id, pricing, mode, as_of)?;
        Ok(self.actualize(planned, &rates))
    }

    /// Cost of consumed usage at the given rates. The stage minimum charge
    /// applies only once something was consumed.
    pub fn actualize(&self, consumed: Usage, rates: &AppliedRates) -> StageCost {
        let raw = match rates {
            AppliedRates::Page(rate) => rate.cost_of(u64::from(consumed.pages)),
            AppliedRates::Token { input, output } => {
                input.cost_of(consumed.input_tokens) + output.cost_of(consumed.output_tokens)
            }
        };

        let amount = match rates.minimum_charge() {
            Some(minimum) if !consumed.is_empty() && raw < minimum => minimum,
            _ => raw,
        };

        StageCost {
            amount,
            currency: rates.currency().to_string(),
        }
    }

    /// Writes a stage cost into a job cost, warning when the job now mixes
    /// currencies.
    pub fn apply(&self, job_cost: &mut JobCost, stage: Stage, cost: StageCost) {
        match stage {
            Stage::Ocr => {
                job_cost.ocr = cost.amount;
                job_cost.ocr_currency = Some(cost.currency);
            }
            Stage::Llm => {
                job_cost.llm = cost.amount;
                job_cost.llm_currency = Some(cost.currency);
            }
        }
        if job_cost.has_currency_mismatch() {
            warn!(
                ocr_currency = job_cost.ocr_currency.as_deref().unwrap_or_default(),
                llm_currency = job_cost.llm_currency.as_deref().unwrap_or_default(),
                "OCR and LLM costs are in different currencies; total is not converted"
            );
        }
    }
}
