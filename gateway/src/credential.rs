use crate::principal::{OwnerType, Principal};
use chrono::Utc;
use common_http_errors::ApiError;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

struct KeyCandidate {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    user_id: Option<Uuid>,
    key_hash: String,
    role: String,
    status: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// Resolves a bearer token (the `x-api-key` header value) to a [`Principal`].
/// Mirrors the original gateway's `require_key` scan: bootstrap short-circuit,
/// `key_last4` narrowing, then a per-candidate status/expiry/hash check.
#[derive(Clone)]
pub struct CredentialStore {
    db: PgPool,
    bootstrap_key: Option<String>,
}

impl CredentialStore {
    pub fn new(db: PgPool, bootstrap_key: Option<String>) -> Self {
        Self { db, bootstrap_key }
    }

    pub async fn resolve(&self, token: &str) -> Result<Principal, ApiError> {
        if token.is_empty() {
            return Err(ApiError::Unauthorized { trace_id: None });
        }
        if let Some(bootstrap) = &self.bootstrap_key {
            if !bootstrap.is_empty() && token == bootstrap {
                return Ok(Principal::bootstrap_admin());
            }
        }

        let last4 = last_four(token);
        let candidates = sqlx::query_as!(
            KeyCandidate,
            r#"
            SELECT id, owner_type, owner_id, user_id, key_hash, role, status,
                   expires_at
            FROM api_keys
            WHERE key_last4 = $1
            "#,
            last4
        )
        .fetch_all(&self.db)
        .await
        .map_err(|err| {
            warn!(error = %err, "credential lookup failed");
            ApiError::Unauthorized { trace_id: None }
        })?;

        let now = Utc::now();
        for candidate in candidates {
            if candidate.status != "active" {
                continue;
            }
            if let Some(expires_at) = candidate.expires_at {
                if now > expires_at {
                    continue;
                }
            }
            let matches = bcrypt::verify(token, &candidate.key_hash).unwrap_or(false);
            if !matches {
                continue;
            }
            let owner_type = match candidate.owner_type.as_str() {
                "team" => OwnerType::Team,
                _ => OwnerType::User,
            };
            let organization_id = match self.resolve_organization(owner_type, candidate.owner_id).await {
                Ok(organization_id) => organization_id,
                Err(sqlx::Error::RowNotFound) => continue,
                Err(err) => {
                    warn!(error = %err, "organization lookup failed during credential resolution");
                    return Err(ApiError::Unauthorized { trace_id: None });
                }
            };
            return Ok(Principal {
                key_id: candidate.id,
                organization_id,
                owner_type,
                owner_id: candidate.owner_id,
                user_id: candidate.user_id,
                role: candidate.role,
            });
        }

        Err(ApiError::Unauthorized { trace_id: None })
    }

    async fn resolve_organization(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Uuid, sqlx::Error> {
        match owner_type {
            OwnerType::Team => {
                sqlx::query_scalar!("SELECT organization_id FROM teams WHERE id = $1", owner_id)
                    .fetch_one(&self.db)
                    .await
            }
            OwnerType::User => {
                sqlx::query_scalar!("SELECT organization_id FROM users WHERE id = $1", owner_id)
                    .fetch_one(&self.db)
                    .await
            }
        }
    }
}

/// Last 4 characters of the plaintext token, used purely as a narrowing
/// filter over the (salted, unindexable) `key_hash` column.
fn last_four(token: &str) -> String {
    let len = token.chars().count();
    if len <= 4 {
        token.to_string()
    } else {
        token.chars().skip(len - 4).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_four_takes_trailing_characters() {
        assert_eq!(last_four("sk-abcd1234"), "1234");
        assert_eq!(last_four("ab"), "ab");
    }
}
