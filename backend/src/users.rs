// User lookup for execution context and notifications

use relay_shared::UserInfo;
use sqlx::PgPool;
use uuid::Uuid;

/// Fetch the profile exposed to templates as `{{user.*}}`.
pub async fn get_user_info(pool: &PgPool, user_id: Uuid) -> Result<Option<UserInfo>, sqlx::Error> {
    sqlx::query_as::<_, UserInfo>(
        "SELECT id, email, timezone, name, phone FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}
