use chrono::Utc;
use gateway::credential::CredentialStore;
use gateway::quota::QuotaGuard;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

/// Schema minimally compatible with `migrations/0004_orgs_teams_and_polymorphic_keys.sql`,
/// created ad hoc so this test doesn't depend on the full migration chain
/// having been run against whatever database `DATABASE_URL` points at.
async fn ensure_schema(pool: &PgPool) {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'active',
            monthly_token_quota BIGINT,
            settings JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .await
    .unwrap();
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            organization_id UUID NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            password_hash TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .await
    .unwrap();
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id UUID PRIMARY KEY,
            owner_type TEXT NOT NULL,
            owner_id UUID NOT NULL,
            user_id UUID,
            key_hash TEXT NOT NULL,
            key_last4 TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            status TEXT NOT NULL DEFAULT 'active',
            expires_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .await
    .unwrap();
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage (
            id BIGSERIAL PRIMARY KEY,
            organization_id UUID NOT NULL,
            owner_type TEXT NOT NULL,
            owner_id UUID NOT NULL,
            key_id UUID NOT NULL,
            day DATE NOT NULL,
            request_count BIGINT NOT NULL DEFAULT 0,
            prompt_tokens BIGINT NOT NULL DEFAULT 0,
            completion_tokens BIGINT NOT NULL DEFAULT 0,
            total_tokens BIGINT NOT NULL DEFAULT 0,
            UNIQUE (organization_id, owner_type, owner_id, key_id, day)
        );
        "#,
    )
    .await
    .unwrap();
}

#[tokio::test]
#[ignore]
async fn resolves_active_key_and_enforces_quota() {
    let dsn = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this ignored test");
    let pool = PgPool::connect(&dsn).await.unwrap();
    ensure_schema(&pool).await;

    let org_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let key_id = Uuid::new_v4();
    let token = "sk-test-db-credential-0001";
    let hash = bcrypt::hash(token, bcrypt::DEFAULT_COST).unwrap();

    sqlx::query("INSERT INTO organizations (id, name, monthly_token_quota) VALUES ($1, $2, $3)")
        .bind(org_id)
        .bind(format!("org-{org_id}"))
        .bind(100_i64)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO users (id, organization_id, name) VALUES ($1, $2, 'tester')")
        .bind(user_id)
        .bind(org_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO api_keys (id, owner_type, owner_id, user_id, key_hash, key_last4, role, status) \
         VALUES ($1, 'user', $2, $2, $3, $4, 'user', 'active')",
    )
    .bind(key_id)
    .bind(user_id)
    .bind(&hash)
    .bind(&token[token.len() - 4..])
    .execute(&pool)
    .await
    .unwrap();

    let store = CredentialStore::new(pool.clone(), None);
    let principal = store.resolve(token).await.expect("key resolves");
    assert_eq!(principal.organization_id, org_id);
    assert_eq!(principal.owner_id, user_id);

    let quota = QuotaGuard::new(pool.clone());
    quota.check(org_id).await.expect("under quota");

    sqlx::query(
        "INSERT INTO api_usage (organization_id, owner_type, owner_id, key_id, day, total_tokens) \
         VALUES ($1, 'user', $2, $3, $4, 500)",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(key_id)
    .bind(Utc::now().date_naive())
    .execute(&pool)
    .await
    .unwrap();

    let err = quota.check(org_id).await.expect_err("over quota now");
    assert!(matches!(err, common_http_errors::ApiError::TooManyRequests { .. }));
}

#[tokio::test]
#[ignore]
async fn unknown_token_is_rejected() {
    let dsn = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this ignored test");
    let pool = PgPool::connect(&dsn).await.unwrap();
    ensure_schema(&pool).await;

    let store = CredentialStore::new(pool, None);
    let err = store.resolve("sk-does-not-exist-0000").await.expect_err("no matching key");
    assert!(matches!(err, common_http_errors::ApiError::Unauthorized { .. }));
}
