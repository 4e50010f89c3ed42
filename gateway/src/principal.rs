use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum OwnerType {
    User,
    Team,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "user",
            OwnerType::Team => "team",
        }
    }
}

/// The authenticated identity derived from a bearer token. Immutable for
/// the lifetime of one request; carried unchanged into the Job and, on
/// completion, into the Accounting Sink.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub key_id: Uuid,
    pub organization_id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub user_id: Option<Uuid>,
    pub role: String,
}

impl Principal {
    /// Synthetic identity used when a caller presents the bootstrap admin
    /// key. All identifiers are the nil UUID; callers that need to
    /// distinguish the bootstrap principal from a stored key should check
    /// `role == "admin"` together with `key_id == Uuid::nil()`.
    pub fn bootstrap_admin() -> Self {
        Self {
            key_id: Uuid::nil(),
            organization_id: Uuid::nil(),
            owner_type: OwnerType::User,
            owner_id: Uuid::nil(),
            user_id: None,
            role: "admin".to_string(),
        }
    }
}
