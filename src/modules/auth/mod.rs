pub mod attempt_limiter;
pub mod flow;

pub use attempt_limiter::AuthRateLimiter;
pub use flow::{AccountMetadata, OAuthFlow};
