use std::sync::Arc;

use sqlx::PgPool;

use crate::accounting::AccountingSink;
use crate::config::GatewayConfig;
use crate::credential::CredentialStore;
use crate::metrics::GatewayMetrics;
use crate::queue::JobQueue;
use crate::quota::QuotaGuard;
use crate::rate_limiter::RateLimiter;

/// Shared state handed to every axum handler. Construction happens once at
/// startup in `main`; everything here is cheaply `Clone` (pools and `Arc`s),
/// so the struct itself derives `Clone` rather than wrapping itself in an
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<GatewayConfig>,
    pub credential_store: CredentialStore,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota_guard: QuotaGuard,
    pub accounting: AccountingSink,
    pub queue: JobQueue,
    pub metrics: Arc<GatewayMetrics>,
}
