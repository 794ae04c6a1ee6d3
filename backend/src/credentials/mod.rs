// Credential store
//
// Service integrations hold OAuth tokens (encrypted at rest) and the
// external workspace/account ids used for multi-tenant webhook resolution.
// Token refresh is lazy: a fetch inside the expiry buffer refreshes first,
// serialized per (owner, service) so concurrent discoveries of an expired
// token do not race. A failed refresh returns the stale token; the
// downstream tool call surfaces the auth error.

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use relay_shared::Integration;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OAuthClientConfig;

pub mod encryption;
pub use encryption::{EncryptionError, EncryptionService};

/// Tokens expiring within this window are refreshed before use.
const REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

pub struct CredentialStore {
    db_pool: PgPool,
    encryption: EncryptionService,
    oauth: HashMap<String, OAuthClientConfig>,
    refresh_locks: Mutex<HashMap<(Uuid, String), Arc<Mutex<()>>>>,
}

/// True when the token should be refreshed before use.
pub(crate) fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(expires) => expires <= now + Duration::minutes(REFRESH_BUFFER_MINUTES),
        None => false,
    }
}

impl CredentialStore {
    pub fn new(
        db_pool: PgPool,
        oauth: HashMap<String, OAuthClientConfig>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            db_pool,
            encryption: EncryptionService::new()?,
            oauth,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Map an external workspace/account id to an internal owner. When a
    /// workspace is shared across owners the oldest integration wins,
    /// deterministically.
    pub async fn resolve_tenant(
        &self,
        service: &str,
        external_account_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT owner_id FROM integrations
            WHERE LOWER(service) = LOWER($1) AND external_account_id = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(service)
        .bind(external_account_id)
        .fetch_optional(&self.db_pool)
        .await
    }

    pub async fn get_integration(
        &self,
        owner_id: Uuid,
        service: &str,
    ) -> Result<Option<Integration>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(
            r#"
            SELECT * FROM integrations
            WHERE owner_id = $1 AND LOWER(service) = LOWER($2)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .bind(service)
        .fetch_optional(&self.db_pool)
        .await
    }

    /// Fetch a usable access token for (owner, service), refreshing lazily
    /// when the stored token is inside the expiry buffer.
    pub async fn access_token(
        &self,
        owner_id: Uuid,
        service: &str,
    ) -> Result<Option<String>, CredentialError> {
        let Some(integration) = self.get_integration(owner_id, service).await? else {
            return Ok(None);
        };
        let Some(stored) = integration.access_token.clone() else {
            return Ok(None);
        };

        if !needs_refresh(integration.token_expires_at, Utc::now()) {
            return Ok(Some(self.reveal(&stored)));
        }

        // Serialize refreshes per (owner, service); re-check expiry under
        // the lock since another task may have refreshed while we waited.
        let key = (owner_id, service.to_lowercase());
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        let Some(current) = self.get_integration(owner_id, service).await? else {
            return Ok(None);
        };
        let stored = current.access_token.clone().unwrap_or(stored);
        if !needs_refresh(current.token_expires_at, Utc::now()) {
            return Ok(Some(self.reveal(&stored)));
        }

        let stale = self.reveal(&stored);
        let (Some(refresh_token), Some(oauth_cfg)) = (
            current.refresh_token.as_deref().map(|t| self.reveal(t)),
            self.oauth.get(&service.to_lowercase()),
        ) else {
            debug!(%owner_id, service, "no refresh material, passing stored token through");
            return Ok(Some(stale));
        };

        match refresh_access_token(oauth_cfg, &refresh_token).await {
            Ok(refreshed) => {
                self.persist_refresh(current.id, &refreshed).await?;
                info!(%owner_id, service, "access token refreshed");
                Ok(Some(refreshed.access_token))
            }
            Err(e) => {
                // Do not block dispatch: the tool call will surface a clear
                // auth error with the stale token.
                warn!(%owner_id, service, "token refresh failed: {e}");
                Ok(Some(stale))
            }
        }
    }

    async fn persist_refresh(
        &self,
        integration_id: Uuid,
        refreshed: &RefreshedToken,
    ) -> Result<(), CredentialError> {
        let access = self.conceal(&refreshed.access_token);
        let refresh = refreshed.refresh_token.as_deref().map(|t| self.conceal(t));

        sqlx::query(
            r#"
            UPDATE integrations
            SET access_token = $2,
                refresh_token = COALESCE($3, refresh_token),
                token_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .bind(access)
        .bind(refresh)
        .bind(refreshed.expires_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    /// Service-specific sync position, e.g. the stored Gmail history id.
    pub async fn get_sync_cursor(
        &self,
        owner_id: Uuid,
        service: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        Ok(self
            .get_integration(owner_id, service)
            .await?
            .and_then(|i| i.sync_cursor))
    }

    pub async fn set_sync_cursor(
        &self,
        owner_id: Uuid,
        service: &str,
        cursor: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE integrations
            SET sync_cursor = $3, updated_at = NOW()
            WHERE owner_id = $1 AND LOWER(service) = LOWER($2)
            "#,
        )
        .bind(owner_id)
        .bind(service)
        .bind(cursor)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    fn conceal(&self, token: &str) -> String {
        self.encryption.encrypt(token).unwrap_or_else(|e| {
            warn!("token encryption failed, storing plaintext: {e}");
            token.to_string()
        })
    }

    /// Decrypt a stored token; rows written before encryption was enabled
    /// hold plaintext and pass through unchanged.
    fn reveal(&self, stored: &str) -> String {
        match self.encryption.decrypt(stored) {
            Ok(token) => token,
            Err(_) => stored.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Exchange a refresh token at the service's token endpoint.
pub(crate) async fn refresh_access_token(
    cfg: &OAuthClientConfig,
    refresh_token: &str,
) -> Result<RefreshedToken, CredentialError> {
    let client = BasicClient::new(
        ClientId::new(cfg.client_id.clone()),
        Some(ClientSecret::new(cfg.client_secret.clone())),
        AuthUrl::new(cfg.auth_url.clone()).map_err(|e| CredentialError::Refresh(e.to_string()))?,
        Some(
            TokenUrl::new(cfg.token_url.clone())
                .map_err(|e| CredentialError::Refresh(e.to_string()))?,
        ),
    );

    let response = client
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(oauth2::reqwest::async_http_client)
        .await
        .map_err(|e| CredentialError::Refresh(e.to_string()))?;

    Ok(RefreshedToken {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_at: response
            .expires_in()
            .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn refresh_buffer_boundaries() {
        let now = Utc::now();
        assert!(needs_refresh(Some(now - Duration::minutes(1)), now));
        assert!(needs_refresh(Some(now + Duration::minutes(4)), now));
        assert!(!needs_refresh(Some(now + Duration::minutes(10)), now));
        assert!(!needs_refresh(None, now));
    }

    #[tokio::test]
    async fn refresh_exchange_parses_token_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new_access",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "new_refresh"
            })))
            .mount(&server)
            .await;

        let cfg = OAuthClientConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            auth_url: format!("{}/oauth2/auth", server.uri()),
            token_url: format!("{}/oauth2/token", server.uri()),
        };

        let refreshed = refresh_access_token(&cfg, "old_refresh").await.unwrap();
        assert_eq!(refreshed.access_token, "new_access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new_refresh"));
        assert!(refreshed.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_exchange_surfaces_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let cfg = OAuthClientConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            auth_url: format!("{}/oauth2/auth", server.uri()),
            token_url: format!("{}/oauth2/token", server.uri()),
        };

        assert!(refresh_access_token(&cfg, "revoked").await.is_err());
    }
}
