use chrono::{Datelike, Utc};
use common_http_errors::ApiError;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Rejects requests from organizations that have exhausted their
/// `monthly_token_quota`. Evaluation is a plain indexed scan, not a lock —
/// strictly-over-quota is tolerated by at most the in-flight concurrency,
/// per the accepted looseness in the token accounting model.
#[derive(Clone)]
pub struct QuotaGuard {
    db: PgPool,
}

impl QuotaGuard {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn check(&self, organization_id: Uuid) -> Result<(), ApiError> {
        let quota = sqlx::query_scalar!(
            "SELECT monthly_token_quota FROM organizations WHERE id = $1",
            organization_id
        )
        .fetch_optional(&self.db)
        .await
        .map_err(|err| {
            warn!(error = %err, "quota lookup failed");
            ApiError::internal(err, None)
        })?
        .flatten();

        let Some(quota) = quota else {
            return Ok(());
        };

        let today = Utc::now().date_naive();
        let first_of_month = today.with_day(1).unwrap_or(today);

        let used: i64 = sqlx::query_scalar!(
            r#"
            SELECT COALESCE(SUM(total_tokens), 0)::BIGINT AS "used!"
            FROM api_usage
            WHERE organization_id = $1 AND day >= $2 AND day <= $3
            "#,
            organization_id,
            first_of_month,
            today
        )
        .fetch_one(&self.db)
        .await
        .map_err(|err| {
            warn!(error = %err, "quota usage scan failed");
            ApiError::internal(err, None)
        })?;

        if used >= quota {
            return Err(ApiError::TooManyRequests {
                code: "quota_exceeded",
                trace_id: None,
                message: Some("Monthly token quota exceeded".into()),
            });
        }
        Ok(())
    }
}
