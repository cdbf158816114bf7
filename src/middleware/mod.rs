pub mod auth;
pub mod rate_limit;

pub use auth::AuthUser;
pub use rate_limit::{
    rate_limit_middleware, spawn_rate_limit_cleanup, spawn_user_rate_limit_cleanup, RateLimiter,
    UserRateLimiter,
};
