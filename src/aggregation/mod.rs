//! Multi-provider odds aggregation

pub mod manager;
pub mod market;

pub use manager::ProviderManager;
pub use market::{aggregate, normalize, AggregatedMarket};
