//! Grouping quotes into markets and attaching arbitrage

use crate::{
    log_arbitrage,
    providers::{Quote, QuoteKey},
    strategy::{ArbitrageCalculator, ArbitrageResult},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// All quotes for one (event, market, outcome)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMarket {
    /// Event id
    pub event: String,
    /// Market key
    pub market: String,
    /// Outcome name
    pub outcome: String,
    /// Sport key of the first quote seen
    pub sport: String,
    /// Per-provider quotes in arrival order
    pub quotes: Vec<Quote>,
    /// Highest odds among `quotes`
    pub best_odds: f64,
    /// Provider quoting `best_odds`
    pub best_provider: String,
    /// Arbitrage across this market's outcomes, if any
    pub arbitrage: Option<ArbitrageResult>,
}

impl AggregatedMarket {
    fn new(quote: Quote) -> Self {
        Self {
            event: quote.event.clone(),
            market: quote.market.clone(),
            outcome: quote.outcome.clone(),
            sport: quote.sport.clone(),
            best_odds: quote.odds,
            best_provider: quote.provider_id.clone(),
            quotes: vec![quote],
            arbitrage: None,
        }
    }

    fn push(&mut self, quote: Quote) {
        if quote.odds > self.best_odds {
            self.best_odds = quote.odds;
            self.best_provider = quote.provider_id.clone();
        }
        self.quotes.push(quote);
    }

    /// The quote behind `best_odds`; ties go to the earliest
    pub fn best_quote(&self) -> Option<&Quote> {
        self.quotes
            .iter()
            .find(|q| q.provider_id == self.best_provider && q.odds == self.best_odds)
    }
}

/// Drop invalid quotes and collapse duplicates
///
/// For repeated (provider, event, market, outcome) keys the newest timestamp
/// wins but keeps the position of the first occurrence.
pub fn normalize(quotes: Vec<Quote>) -> Vec<Quote> {
    let mut unique: IndexMap<QuoteKey, Quote> = IndexMap::with_capacity(quotes.len());
    for quote in quotes.into_iter().filter(Quote::is_valid) {
        match unique.get_mut(&quote.key()) {
            Some(existing) if quote.timestamp > existing.timestamp => *existing = quote,
            Some(_) => {}
            None => {
                unique.insert(quote.key(), quote);
            }
        }
    }
    unique.into_values().collect()
}

/// Group quotes by (event, market, outcome) and attach arbitrage per (event, market)
pub fn aggregate(quotes: Vec<Quote>, calculator: &ArbitrageCalculator) -> Vec<AggregatedMarket> {
    let mut groups: IndexMap<(String, String, String), AggregatedMarket> = IndexMap::new();
    for quote in quotes {
        let key = (quote.event.clone(), quote.market.clone(), quote.outcome.clone());
        match groups.get_mut(&key) {
            Some(group) => group.push(quote),
            None => {
                groups.insert(key, AggregatedMarket::new(quote));
            }
        }
    }

    let mut markets: Vec<AggregatedMarket> = groups.into_values().collect();

    let mut by_market: IndexMap<(String, String), Vec<usize>> = IndexMap::new();
    for (index, group) in markets.iter().enumerate() {
        by_market
            .entry((group.event.clone(), group.market.clone()))
            .or_default()
            .push(index);
    }

    for ((event, market), indices) in by_market {
        let legs: Vec<&Quote> = indices.iter().filter_map(|i| markets[*i].best_quote()).collect();
        let Some(result) = calculator.calculate(&legs) else {
            continue;
        };

        log_arbitrage!(
            info,
            event,
            market,
            format!("{:.3}", result.profit_percentage),
            legs = result.legs.len(),
            expected_profit = result.expected_profit,
            "Arbitrage opportunity found"
        );

        for i in indices {
            markets[i].arbitrage = Some(result.clone());
        }
    }

    markets
}
