//! Multi-strategy execution with priority fallthrough.

pub mod orchestrator;
pub mod strategy;

pub use orchestrator::{attempt_delay, FallbackOrchestrator, FallbackOutcome, FallbackStats};
pub use strategy::{
    default_strategy_profile, ProfiledStrategy, Strategy, StrategyInfo, StrategyTier,
    DEFAULT_STRATEGY_TIMEOUT,
};
