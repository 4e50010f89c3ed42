pub mod accounting;
pub mod app_state;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod handlers;
pub mod metrics;
pub mod principal;
pub mod queue;
pub mod quota;
pub mod rate_limiter;
pub mod sse;
pub mod upstream;

pub use app_state::AppState;
pub use config::GatewayConfig;
pub use metrics::GatewayMetrics;
