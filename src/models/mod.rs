pub mod account;
pub mod config;

pub use account::{Account, AccountStorage, CooldownReason, LastSwitchReason, QuotaKey};
pub use config::{
    AuthRateLimitConfig, BackoffConfig, CircuitBreakerConfig, HealthConfig, SelectionWeights,
    TokenBucketConfig,
};
