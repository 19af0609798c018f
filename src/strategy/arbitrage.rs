//! Cross-provider arbitrage calculation

use crate::{config::ArbitrageSettings, providers::Quote};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// One leg of an arbitrage: back `outcome` at `provider_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageLeg {
    /// Provider offering the price
    pub provider_id: String,
    /// Outcome backed
    pub outcome: String,
    /// Decimal odds taken
    pub odds: f64,
    /// `1 / odds`
    pub implied_probability: f64,
    /// Recommended stake
    pub stake: f64,
    /// Stake rounded to two decimal places
    pub rounded_stake: Decimal,
    /// Return if this leg wins
    pub payout: f64,
}

/// A guaranteed-profit split across outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageResult {
    /// `(1 - S) * 100` where `S` is the implied probability sum
    pub profit_percentage: f64,
    /// Sum of implied probabilities, always < 1
    pub implied_probability_sum: f64,
    /// Per-outcome stakes
    pub legs: Vec<ArbitrageLeg>,
    /// Total stake split across the legs
    pub total_stake: f64,
    /// Worst-case payout minus total stake
    pub expected_profit: f64,
}

/// Pure arbitrage calculator
#[derive(Debug, Clone)]
pub struct ArbitrageCalculator {
    total_stake: f64,
    min_profit_percentage: f64,
}

impl ArbitrageCalculator {
    /// Create a calculator splitting `total_stake` across legs
    pub fn new(total_stake: f64) -> Self {
        Self {
            total_stake,
            min_profit_percentage: 0.0,
        }
    }

    /// Discard results below `min_profit_percentage`
    pub fn with_min_profit(mut self, min_profit_percentage: f64) -> Self {
        self.min_profit_percentage = min_profit_percentage;
        self
    }

    /// Build from configuration
    pub fn from_settings(settings: &ArbitrageSettings) -> Self {
        Self::new(settings.total_stake).with_min_profit(settings.min_profit_percentage)
    }

    /// Total stake used for sizing
    pub fn total_stake(&self) -> f64 {
        self.total_stake
    }

    /// Compute arbitrage over one quote per outcome
    ///
    /// Returns `None` unless there are at least two legs from at least two
    /// providers, every price is positive, and the implied probabilities sum
    /// to less than one.
    pub fn calculate(&self, legs: &[&Quote]) -> Option<ArbitrageResult> {
        if legs.len() < 2 || legs.iter().any(|q| !q.is_valid()) {
            return None;
        }

        let providers: HashSet<&str> = legs.iter().map(|q| q.provider_id.as_str()).collect();
        if providers.len() < 2 {
            return None;
        }

        let sum: f64 = legs.iter().map(|q| q.implied_probability()).sum();
        if sum >= 1.0 {
            return None;
        }

        let profit_percentage = (1.0 - sum) * 100.0;
        if profit_percentage < self.min_profit_percentage {
            debug!(
                "Arbitrage of {:.3}% below minimum {:.3}%",
                profit_percentage, self.min_profit_percentage
            );
            return None;
        }

        let legs: Vec<ArbitrageLeg> = legs
            .iter()
            .map(|quote| {
                let implied_probability = quote.implied_probability();
                let stake = self.total_stake * implied_probability / sum;
                ArbitrageLeg {
                    provider_id: quote.provider_id.clone(),
                    outcome: quote.outcome.clone(),
                    odds: quote.odds,
                    implied_probability,
                    stake,
                    rounded_stake: round_stake(stake),
                    payout: stake * quote.odds,
                }
            })
            .collect();

        let worst_payout = legs.iter().map(|l| l.payout).fold(f64::INFINITY, f64::min);

        Some(ArbitrageResult {
            profit_percentage,
            implied_probability_sum: sum,
            total_stake: self.total_stake,
            expected_profit: worst_payout - self.total_stake,
            legs,
        })
    }
}

impl Default for ArbitrageCalculator {
    fn default() -> Self {
        Self::from_settings(&ArbitrageSettings::default())
    }
}

fn round_stake(stake: f64) -> Decimal {
    Decimal::from_f64_retain(stake).unwrap_or_default().round_dp(2)
}
