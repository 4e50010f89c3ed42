use crate::principal::OwnerType;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

pub struct AccountingRecord {
    pub key_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub owner_type: Option<OwnerType>,
    pub owner_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub endpoint: String,
    pub model: Option<String>,
    pub request_body: Value,
    pub response_body: Option<Value>,
    pub status_code: i32,
    pub error_message: Option<String>,
    pub latency_ms: i64,
}

struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

fn extract_usage(response_body: Option<&Value>) -> Usage {
    let usage = response_body.and_then(|b| b.get("usage"));
    let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(|v| v.as_i64()).unwrap_or(0);
    Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    }
}

/// Persists one completed request plus its daily roll-ups, all within a
/// single transaction. Not idempotent across retries: callers must invoke
/// `record` exactly once per completed request. Failures are logged and
/// swallowed per the error-handling design — accounting never overturns a
/// response already sent to the client.
#[derive(Clone)]
pub struct AccountingSink {
    db: PgPool,
}

impl AccountingSink {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn record(&self, record: AccountingRecord) {
        if let Err(err) = self.try_record(record).await {
            error!(error = %err, "failed to record accounting row");
        }
    }

    async fn try_record(&self, record: AccountingRecord) -> Result<(), sqlx::Error> {
        let usage = extract_usage(record.response_body.as_ref());
        let today = Utc::now().date_naive();
        let owner_type_str = record.owner_type.map(|o| o.as_str().to_string());

        let mut tx = self.db.begin().await?;

        sqlx::query!(
            r#"
            INSERT INTO requests (
                key_id, user_id, organization_id, owner_type, owner_id,
                endpoint, model, request_body, response_body, status_code,
                error_message, prompt_tokens, completion_tokens, total_tokens,
                latency_ms, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now()
            )
            "#,
            record.key_id,
            record.user_id,
            record.organization_id,
            owner_type_str,
            record.owner_id,
            record.endpoint,
            record.model,
            record.request_body,
            record.response_body,
            record.status_code,
            record.error_message,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
            record.latency_ms,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query!(
            r#"
            INSERT INTO usage_rollups (key_id, user_id, day, request_count,
                prompt_tokens, completion_tokens, total_tokens)
            VALUES ($1, $2, $3, 1, $4, $5, $6)
            ON CONFLICT (key_id, day) DO UPDATE SET
                request_count = usage_rollups.request_count + 1,
                prompt_tokens = usage_rollups.prompt_tokens + EXCLUDED.prompt_tokens,
                completion_tokens = usage_rollups.completion_tokens + EXCLUDED.completion_tokens,
                total_tokens = usage_rollups.total_tokens + EXCLUDED.total_tokens
            "#,
            record.key_id,
            record.user_id,
            today,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
        )
        .execute(&mut *tx)
        .await?;

        if let (Some(organization_id), Some(owner_type), Some(owner_id)) =
            (record.organization_id, owner_type_str.clone(), record.owner_id)
        {
            sqlx::query!(
                r#"
                INSERT INTO api_usage (organization_id, owner_type, owner_id, key_id, day,
                    request_count, prompt_tokens, completion_tokens, total_tokens)
                VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8)
                ON CONFLICT (organization_id, owner_type, owner_id, key_id, day) DO UPDATE SET
                    request_count = api_usage.request_count + 1,
                    prompt_tokens = api_usage.prompt_tokens + EXCLUDED.prompt_tokens,
                    completion_tokens = api_usage.completion_tokens + EXCLUDED.completion_tokens,
                    total_tokens = api_usage.total_tokens + EXCLUDED.total_tokens
                "#,
                organization_id,
                owner_type,
                owner_id,
                record.key_id,
                today,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_usage_defaults_missing_fields_to_zero() {
        let usage = extract_usage(Some(&serde_json::json!({"choices": []})));
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
    }

    #[test]
    fn extract_usage_reads_present_fields() {
        let usage = extract_usage(Some(&serde_json::json!({
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        })));
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn extract_usage_handles_missing_response_body() {
        let usage = extract_usage(None);
        assert_eq!(usage.total_tokens, 0);
    }
}
