//! HTTP and WebSocket surface of parley: authentication, per-user rate
//! limiting, session routes and event streaming.

pub mod auth;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod rpc;
pub mod server;

pub use auth::StaticTokenAuth;
pub use error::ApiError;
pub use rate_limit::{Admission, RateLimiter};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
