use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse, BasicTokenType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::token_store::{Credential, StoreError, TokenStore};
use crate::{Args, ConfigError, RefreshPolicy};

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub refresh_policy: RefreshPolicy,
    pub refresh_leeway: Duration,
}

impl OAuthConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: args.client_id.clone(),
            client_secret: args.client_secret.clone(),
            redirect_uri: args.redirect_url()?.to_string(),
            auth_url: args.auth_url.clone(),
            token_url: args.token_url.clone(),
            scopes: args.scopes.clone(),
            refresh_policy: args.refresh_policy,
            refresh_leeway: args.refresh_leeway,
        })
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no account has been authorized yet")]
    NotAuthorized,
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
    #[error("authorization has expired: {0}")]
    AuthorizationExpired(String),
    #[error("could not reach the token endpoint: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid OAuth endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// The single authorized account of this process.
///
/// Readers share the credential slot; loading, code exchange and refresh are
/// serialized through `writer` so the token file has one writer at a time.
pub struct OAuthSession {
    client: BasicClient,
    csrf_state: CsrfToken,
    scopes: Vec<String>,
    refresh_policy: RefreshPolicy,
    refresh_leeway: Duration,
    store: TokenStore,
    credential: RwLock<Option<Credential>>,
    writer: Mutex<()>,
}

impl OAuthSession {
    pub fn new(config: &OAuthConfig, store: TokenStore) -> Result<Self, SessionError> {
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(config.auth_url.clone())?,
            Some(TokenUrl::new(config.token_url.clone())?),
        )
        .set_redirect_uri(RedirectUrl::new(config.redirect_uri.clone())?);

        Ok(Self {
            client,
            csrf_state: CsrfToken::new_random(),
            scopes: config.scopes.clone(),
            refresh_policy: config.refresh_policy,
            refresh_leeway: config.refresh_leeway,
            store,
            credential: RwLock::new(None),
            writer: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh_policy
    }

    /// Consent URL for the configured scopes.
    pub fn authorization_url(&self) -> String {
        self.build_authorization_url(&self.scopes)
    }

    /// Builds the consent URL. Offline access makes Google issue a refresh
    /// token and the forced consent prompt makes it issue one again on every
    /// repeat authorization. The `state` value is fixed for the life of the
    /// session so the page can be rendered any number of times.
    pub fn build_authorization_url(&self, scopes: &[String]) -> String {
        let (url, _) = self
            .client
            .authorize_url(|| self.csrf_state.clone())
            .add_scopes(
                scopes
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| Scope::new(s.to_string())),
            )
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        url.to_string()
    }

    /// Whether a callback's `state` parameter belongs to a consent URL this
    /// session handed out.
    pub fn verify_state(&self, state: Option<&str>) -> bool {
        state.is_some_and(|state| state == self.csrf_state.secret().as_str())
    }

    pub async fn current(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credential.read().await.is_some()
    }

    /// Loads the stored record into memory if nothing is held yet. Returns
    /// whether the session is authenticated afterwards.
    pub async fn ensure_credentials_loaded(&self) -> Result<bool, SessionError> {
        if self.is_authenticated().await {
            return Ok(true);
        }

        let _writer = self.writer.lock().await;
        if self.is_authenticated().await {
            return Ok(true);
        }

        match self.store.load().await? {
            Some(credential) => {
                info!(path = %self.store.path().display(), "loaded stored credential");
                *self.credential.write().await = Some(credential);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Exchanges an authorization code. The credential is persisted before it
    /// becomes visible in memory; on failure neither is touched.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential, SessionError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                error!(error = %e, "error while trying to retrieve access token");
                SessionError::Exchange(e.to_string())
            })?;

        let credential = credential_from_response(&token, None);

        let _writer = self.writer.lock().await;
        self.store.save(&credential).await?;
        *self.credential.write().await = Some(credential.clone());

        info!("authorization code exchanged");
        Ok(credential)
    }

    /// Bearer token for an outbound API call, refreshed first when the policy
    /// asks for it.
    pub async fn access_token(&self) -> Result<String, SessionError> {
        if !self.ensure_credentials_loaded().await? {
            return Err(SessionError::NotAuthorized);
        }
        let credential = self.current().await.ok_or(SessionError::NotAuthorized)?;

        if self.refresh_policy == RefreshPolicy::OnExpiry
            && credential.expires_within(self.refresh_leeway, Utc::now())
        {
            let refreshed = self.refresh(&credential).await?;
            return Ok(refreshed.access_token);
        }

        Ok(credential.access_token)
    }

    async fn refresh(&self, stale: &Credential) -> Result<Credential, SessionError> {
        let _writer = self.writer.lock().await;

        // Another request may have refreshed while we waited for the writer.
        if let Some(current) = self.current().await {
            if current.access_token != stale.access_token {
                return Ok(current);
            }
        }

        let refresh_token = stale.refresh_token.clone().ok_or_else(|| {
            warn!("access token expiring and no refresh token is stored");
            SessionError::AuthorizationExpired("no refresh token stored".to_string())
        })?;

        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                error!(error = %e, "token refresh failed");
                match e {
                    RequestTokenError::ServerResponse(resp) => {
                        SessionError::AuthorizationExpired(resp.to_string())
                    }
                    RequestTokenError::Request(err) => SessionError::Transport(err.to_string()),
                    other => SessionError::Exchange(other.to_string()),
                }
            })?;

        let credential = credential_from_response(&token, Some(refresh_token));
        self.store.save(&credential).await?;
        *self.credential.write().await = Some(credential.clone());

        info!("access token refreshed");
        Ok(credential)
    }
}

fn credential_from_response(
    token: &BasicTokenResponse,
    previous_refresh_token: Option<String>,
) -> Credential {
    // An `expires_in` too large to represent is treated as no expiry.
    let expires_at = token
        .expires_in()
        .and_then(|duration| Duration::from_std(duration).ok())
        .and_then(|duration| Utc::now().checked_add_signed(duration));

    Credential {
        access_token: token.access_token().secret().clone(),
        refresh_token: token
            .refresh_token()
            .map(|t| t.secret().clone())
            .or(previous_refresh_token),
        expires_at,
        token_type: token_type_name(token.token_type()),
        scope: token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
    }
}

fn token_type_name(token_type: &BasicTokenType) -> String {
    match token_type {
        BasicTokenType::Bearer => "Bearer".to_string(),
        BasicTokenType::Mac => "mac".to_string(),
        BasicTokenType::Extension(other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SCOPE_YOUTUBE_READONLY, SCOPE_YOUTUBE_UPLOAD};
    use mockito::{Matcher, Server};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use url::Url;

    fn config(token_url: String, policy: RefreshPolicy) -> OAuthConfig {
        OAuthConfig {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
            redirect_uri: "http://localhost:3000/ytapi/auth/admin".to_string(),
            auth_url: crate::GOOGLE_AUTH_URL.to_string(),
            token_url,
            scopes: vec![
                SCOPE_YOUTUBE_READONLY.to_string(),
                SCOPE_YOUTUBE_UPLOAD.to_string(),
            ],
            refresh_policy: policy,
            refresh_leeway: Duration::minutes(5),
        }
    }

    fn session(dir: &TempDir, token_url: String, policy: RefreshPolicy) -> OAuthSession {
        let store = TokenStore::new(dir.path().join(".credentials").join("token.json"));
        OAuthSession::new(&config(token_url, policy), store).unwrap()
    }

    fn token_body(access: &str, refresh: Option<&str>) -> String {
        let mut body = serde_json::json!({
            "access_token": access,
            "expires_in": 3599,
            "scope": SCOPE_YOUTUBE_UPLOAD,
            "token_type": "Bearer",
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = serde_json::json!(refresh);
        }
        body.to_string()
    }

    #[test]
    fn authorization_url_requests_offline_access_and_consent() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir, "http://127.0.0.1:1/token".to_string(), RefreshPolicy::Never);

        let url = Url::parse(&session.authorization_url()).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(
            params["redirect_uri"],
            "http://localhost:3000/ytapi/auth/admin"
        );
        assert_eq!(
            params["scope"],
            format!("{} {}", SCOPE_YOUTUBE_READONLY, SCOPE_YOUTUBE_UPLOAD)
        );
        assert_eq!(session.authorization_url(), session.authorization_url());

        assert!(session.verify_state(Some(params["state"].as_str())));
        assert!(!session.verify_state(Some("forged")));
        assert!(!session.verify_state(None));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_stored_without_one() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "access_token": "ya29.forever",
                    "expires_in": u64::MAX,
                    "token_type": "Bearer",
                })
                .to_string(),
            )
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::Never);

        let credential = session.exchange_code("4/good").await.unwrap();
        assert_eq!(credential.access_token, "ya29.forever");
        assert!(credential.expires_at.is_none());
    }

    #[tokio::test]
    async fn exchange_code_persists_and_authenticates() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "4/good code".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("ya29.fresh", Some("1//refresh")))
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::Never);
        assert!(!session.is_authenticated().await);

        let credential = session.exchange_code("4/good code").await.unwrap();

        mock.assert_async().await;
        assert_eq!(credential.access_token, "ya29.fresh");
        assert_eq!(credential.refresh_token.as_deref(), Some("1//refresh"));
        assert!(credential.expires_at.is_some());
        assert!(session.is_authenticated().await);
        assert_eq!(session.store().load().await.unwrap(), Some(credential));
    }

    #[tokio::test]
    async fn failed_exchange_leaves_state_untouched() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Bad Request"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::Never);

        let err = session.exchange_code("expired").await.unwrap_err();

        assert!(matches!(err, SessionError::Exchange(_)));
        assert!(!session.is_authenticated().await);
        assert!(!session.store().exists().await);
    }

    #[tokio::test]
    async fn stored_record_is_loaded_on_first_use() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir, "http://127.0.0.1:1/token".to_string(), RefreshPolicy::Never);
        let stored = Credential {
            access_token: "ya29.stored".to_string(),
            refresh_token: None,
            expires_at: None,
            token_type: "Bearer".to_string(),
            scope: None,
        };
        session.store().save(&stored).await.unwrap();
        assert!(!session.is_authenticated().await);

        assert_eq!(session.access_token().await.unwrap(), "ya29.stored");
        assert_eq!(session.current().await, Some(stored));
    }

    #[tokio::test]
    async fn no_record_means_not_authorized() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir, "http://127.0.0.1:1/token".to_string(), RefreshPolicy::Never);

        assert!(!session.ensure_credentials_loaded().await.unwrap());
        assert!(matches!(
            session.access_token().await,
            Err(SessionError::NotAuthorized)
        ));
    }

    fn expired_credential() -> Credential {
        Credential {
            access_token: "ya29.old".to_string(),
            refresh_token: Some("1//keep".to_string()),
            expires_at: Some(Utc::now() - Duration::minutes(10)),
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    #[tokio::test]
    async fn never_policy_uses_expired_token_as_is() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::Never);
        session.store().save(&expired_credential()).await.unwrap();

        assert_eq!(session.access_token().await.unwrap(), "ya29.old");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn on_expiry_policy_refreshes_and_keeps_refresh_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "1//keep".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("ya29.new", None))
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::OnExpiry);
        session.store().save(&expired_credential()).await.unwrap();

        assert_eq!(session.access_token().await.unwrap(), "ya29.new");
        // The refreshed token is no longer expiring, so no second exchange.
        assert_eq!(session.access_token().await.unwrap(), "ya29.new");
        mock.assert_async().await;

        let stored = session.store().load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "ya29.new");
        assert_eq!(stored.refresh_token.as_deref(), Some("1//keep"));
    }

    #[tokio::test]
    async fn rejected_refresh_means_authorization_expired() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::OnExpiry);
        session.store().save(&expired_credential()).await.unwrap();

        let err = session.access_token().await.unwrap_err();
        assert!(matches!(err, SessionError::AuthorizationExpired(_)));
        let stored = session.store().load().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "ya29.old");
    }

    #[tokio::test]
    async fn refresh_transport_failure_is_transport() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir, "http://127.0.0.1:1/token".to_string(), RefreshPolicy::OnExpiry);
        session.store().save(&expired_credential()).await.unwrap();

        let err = session.access_token().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        let stored = session.store().load().await.unwrap().unwrap();
        assert_eq!(stored, session.current().await.unwrap());
        assert_eq!(stored.access_token, "ya29.old");
    }

    #[tokio::test]
    async fn expiring_without_refresh_token_means_authorization_expired() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let session = session(&dir, format!("{}/token", server.url()), RefreshPolicy::OnExpiry);
        let credential = Credential {
            refresh_token: None,
            ..expired_credential()
        };
        session.store().save(&credential).await.unwrap();

        let err = session.access_token().await.unwrap_err();
        assert!(matches!(err, SessionError::AuthorizationExpired(_)));
        mock.assert_async().await;
    }
}
