//! Time-versioned pricing and the resolver that picks the rate in effect.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::money::Amount;
use crate::error::PricingError;

/// The billable unit a rate applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Page,
    InputToken,
    OutputToken,
}

impl UnitKind {
    /// Number of units the quoted price covers: pages are priced one by one,
    /// tokens per million.
    pub fn units_per_price(self) -> i64 {
        match self {
            UnitKind::Page => 1,
            UnitKind::InputToken | UnitKind::OutputToken => 1_000_000,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Page => write!(f, "page"),
            UnitKind::InputToken => write!(f, "input token"),
            UnitKind::OutputToken => write!(f, "output token"),
        }
    }
}

/// How an extractor bills its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    #[default]
    Page,
    Token,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRate {
    pub price_per_page: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_charge: Option<f64>,
}

/// Token prices, quoted per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRate {
    pub input_price: f64,
    pub output_price: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_charge: Option<f64>,
}

/// Page rates live under `ocr`, token rates under `llm`. A vision extractor
/// billed by tokens therefore carries an `llm` card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateCard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr: Option<OcrRate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmRate>,
}

impl RateCard {
    fn quote(&self, unit: UnitKind) -> Option<(f64, &str, Option<f64>)> {
        match unit {
            UnitKind::Page => self
                .ocr
                .as_ref()
                .map(|r| (r.price_per_page, r.currency.as_str(), r.minimum_charge)),
            UnitKind::InputToken => self
                .llm
                .as_ref()
                .map(|r| (r.input_price, r.currency.as_str(), r.minimum_charge)),
            UnitKind::OutputToken => self
                .llm
                .as_ref()
                .map(|r| (r.output_price, r.currency.as_str(), r.minimum_charge)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingEntry {
    pub effective_date: DateTime<Utc>,
    pub rates: RateCard,
}

/// Current pricing plus an append-only history ordered by effective date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "PricingDocument")]
pub struct ModelPricing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<RateCard>,
    #[serde(default)]
    history: Vec<PricingEntry>,
}

impl ModelPricing {
    pub fn new(current: Option<RateCard>) -> Self {
        Self {
            current,
            history: Vec::new(),
        }
    }

    /// Builds pricing from stored history. Entries are stably sorted so that
    /// equal effective dates keep their insertion order.
    pub fn with_history(current: Option<RateCard>, mut history: Vec<PricingEntry>) -> Self {
        history.sort_by_key(|e| e.effective_date);
        Self { current, history }
    }

    pub fn history(&self) -> &[PricingEntry] {
        &self.history
    }

    /// Appends a history entry. Entries dated before the latest one are
    /// rejected; an equal date is accepted and wins over earlier insertions.
    pub fn push_history(&mut self, owner_id: &str, entry: PricingEntry) -> Result<(), PricingError> {
        if let Some(last) = self.history.last() {
            if entry.effective_date < last.effective_date {
                return Err(PricingError::OutOfOrder {
                    owner_id: owner_id.to_string(),
                    reason: format!(
                        "{} is earlier than latest entry {}",
                        entry.effective_date.to_rfc3339(),
                        last.effective_date.to_rfc3339()
                    ),
                });
            }
        }
        self.history.push(entry);
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingDocument {
    #[serde(default)]
    current: Option<RateCard>,
    #[serde(default)]
    history: Vec<PricingEntry>,
}

impl From<PricingDocument> for ModelPricing {
    fn from(doc: PricingDocument) -> Self {
        ModelPricing::with_history(doc.current, doc.history)
    }
}

/// A rate resolved for one unit kind at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRate {
    pub unit: UnitKind,
    /// Price in nano-units per `unit.units_per_price()` units.
    pub price: Amount,
    pub currency: String,
    pub minimum_charge: Option<Amount>,
    /// `None` when the rate came from current pricing.
    pub effective_date: Option<DateTime<Utc>>,
}

impl ResolvedRate {
    /// Cost of `units` units at this rate.
    pub fn cost_of(&self, units: u64) -> Amount {
        let units = i64::try_from(units).unwrap_or(i64::MAX);
        self.price.scaled(units, self.unit.units_per_price())
    }
}

/// Stateless resolver over `ModelPricing`. Safe to share without locking.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingResolver;

impl PricingResolver {
    pub fn new() -> Self {
        Self
    }

    /// Returns the rate in effect for `unit` at `as_of`: the latest history
    /// entry with `effective_date <= as_of` that prices this unit, otherwise
    /// current pricing. Never falls back to a zero rate.
    pub fn rate_for(
        &self,
        owner_id: &str,
        pricing: &ModelPricing,
        unit: UnitKind,
        as_of: DateTime<Utc>,
    ) -> Result<ResolvedRate, PricingError> {
        let history = pricing.history();
        let upper = history.partition_point(|e| e.effective_date <= as_of);

        let from_history = history[..upper]
            .iter()
            .rev()
            .find_map(|e| e.rates.quote(unit).map(|q| (q, Some(e.effective_date))));

        let ((price, currency, minimum), effective_date) = match from_history {
            Some(found) => found,
            None => {
                let quote = pricing
                    .current
                    .as_ref()
                    .and_then(|card| card.quote(unit))
                    .ok_or_else(|| PricingError::NoPricingData {
                        owner_id: owner_id.to_string(),
                        unit,
                    })?;
                (quote, None)
            }
        };

        if !price.is_finite() || price < 0.0 {
            return Err(PricingError::InvalidRate {
                owner_id: owner_id.to_string(),
                unit,
                reason: format!("price {} is not a non-negative number", price),
            });
        }

        Ok(ResolvedRate {
            unit,
            price: Amount::from_decimal(price),
            currency: currency.to_string(),
            minimum_charge: minimum
                .filter(|m| m.is_finite() && *m > 0.0)
                .map(Amount::from_decimal),
            effective_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn page_card(price: f64) -> RateCard {
        RateCard {
            ocr: Some(OcrRate {
                price_per_page: price,
                currency: "USD".into(),
                minimum_charge: None,
            }),
            llm: None,
        }
    }

    fn entry(at: DateTime<Utc>, price: f64) -> PricingEntry {
        PricingEntry {
            effective_date: at,
            rates: page_card(price),
        }
    }

    #[test]
    fn test_latest_entry_before_instant_wins() {
        let mut pricing = ModelPricing::new(Some(page_card(0.5)));
        pricing.push_history("ocr", entry(date(2024, 1, 1), 0.001)).unwrap();
        pricing.push_history("ocr", entry(date(2024, 6, 1), 0.002)).unwrap();

        let rate = PricingResolver
            .rate_for("ocr", &pricing, UnitKind::Page, date(2024, 3, 1))
            .unwrap();
        assert_eq!(rate.price, Amount::from_decimal(0.001));
        assert_eq!(rate.effective_date, Some(date(2024, 1, 1)));

        let rate = PricingResolver
            .rate_for("ocr", &pricing, UnitKind::Page, date(2024, 6, 1))
            .unwrap();
        assert_eq!(rate.price, Amount::from_decimal(0.002));
    }

    #[test]
    fn test_falls_back_to_current_before_history() {
        let mut pricing = ModelPricing::new(Some(page_card(0.5)));
        pricing.push_history("ocr", entry(date(2024, 1, 1), 0.001)).unwrap();

        let rate = PricingResolver
            .rate_for("ocr", &pricing, UnitKind::Page, date(2023, 1, 1))
            .unwrap();
        assert_eq!(rate.price, Amount::from_decimal(0.5));
        assert_eq!(rate.effective_date, None);
    }

    #[test]
    fn test_no_pricing_is_an_error_not_zero() {
        let pricing = ModelPricing::default();
        let err = PricingResolver
            .rate_for("gpt", &pricing, UnitKind::InputToken, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            PricingError::NoPricingData {
                owner_id: "gpt".into(),
                unit: UnitKind::InputToken
            }
        );
    }

    #[test]
    fn test_equal_dates_resolve_to_later_insertion() {
        let mut pricing = ModelPricing::default();
        pricing.push_history("ocr", entry(date(2024, 1, 1), 0.001)).unwrap();
        pricing.push_history("ocr", entry(date(2024, 1, 1), 0.003)).unwrap();

        let rate = PricingResolver
            .rate_for("ocr", &pricing, UnitKind::Page, date(2024, 2, 1))
            .unwrap();
        assert_eq!(rate.price, Amount::from_decimal(0.003));
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let mut pricing = ModelPricing::default();
        pricing.push_history("ocr", entry(date(2024, 6, 1), 0.001)).unwrap();
        let err = pricing
            .push_history("ocr", entry(date(2024, 1, 1), 0.002))
            .unwrap_err();
        assert!(matches!(err, PricingError::OutOfOrder { .. }));
    }

    #[test]
    fn test_entries_without_unit_are_skipped() {
        let mut pricing = ModelPricing::default();
        pricing.push_history("m", entry(date(2024, 1, 1), 0.001)).unwrap();
        pricing
            .push_history(
                "m",
                PricingEntry {
                    effective_date: date(2024, 2, 1),
                    rates: RateCard {
                        ocr: None,
                        llm: Some(LlmRate {
                            input_price: 2.5,
                            output_price: 10.0,
                            currency: "USD".into(),
                            minimum_charge: None,
                        }),
                    },
                },
            )
            .unwrap();

        let page = PricingResolver
            .rate_for("m", &pricing, UnitKind::Page, date(2024, 3, 1))
            .unwrap();
        assert_eq!(page.effective_date, Some(date(2024, 1, 1)));
        let output = PricingResolver
            .rate_for("m", &pricing, UnitKind::OutputToken, date(2024, 3, 1))
            .unwrap();
        assert_eq!(output.price, Amount::from_decimal(10.0));
    }

    #[test]
    fn test_resolution_is_monotonic_in_time() {
        let mut pricing = ModelPricing::default();
        for (i, month) in [1u32, 3, 3, 5, 9].iter().enumerate() {
            pricing
                .push_history("m", entry(date(2024, *month, 1), 0.001 * (i + 1) as f64))
                .unwrap();
        }
        let mut previous: Option<DateTime<Utc>> = None;
        for day in 0..365 {
            let at = date(2024, 1, 1) + chrono::Duration::days(day);
            let rate = PricingResolver
                .rate_for("m", &pricing, UnitKind::Page, at)
                .unwrap();
            if let (Some(prev), Some(now)) = (previous, rate.effective_date) {
                assert!(now >= prev);
            }
            previous = rate.effective_date;
        }
    }

    #[test]
    fn test_with_history_sorts_stably() {
        let pricing = ModelPricing::with_history(
            None,
            vec![
                entry(date(2024, 5, 1), 0.004),
                entry(date(2024, 1, 1), 0.001),
                entry(date(2024, 5, 1), 0.005),
            ],
        );
        let rate = PricingResolver
            .rate_for("m", &pricing, UnitKind::Page, date(2024, 6, 1))
            .unwrap();
        assert_eq!(rate.price, Amount::from_decimal(0.005));
    }

    #[test]
    fn test_cost_of_tokens() {
        let rate = ResolvedRate {
            unit: UnitKind::InputToken,
            price: Amount::from_decimal(2.5),
            currency: "USD".into(),
            minimum_charge: None,
            effective_date: None,
        };
        assert_eq!(rate.cost_of(500).nanos(), 1_250_000);
    }
}
