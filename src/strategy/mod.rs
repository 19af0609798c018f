//! Arbitrage strategy implementation

pub mod arbitrage;

pub use arbitrage::{ArbitrageCalculator, ArbitrageLeg, ArbitrageResult};
