//! Forge REST client for PR comment posting.
//!
//! Authenticates as an App: a short-lived RS256 JWT is exchanged for a
//! per-installation access token, which is cached until shortly before
//! expiry. The controller maintains a single comment per PR, found again
//! on update via a hidden marker, instead of stacking a new comment on
//! every build.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Hidden marker identifying the controller's own comment on a PR.
pub const COMMENT_MARKER: &str = "<!-- envzilla:preview -->";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "envzilla-preview-controller";

#[derive(Clone)]
pub struct ForgeClient {
    client: Client,
    app_id: u64,
    private_key: String,
    api_base: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

impl ForgeClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        Self::with_api_base(app_id, private_key, DEFAULT_API_BASE.to_string())
    }

    /// Test seam: point the client at a stub server.
    pub fn with_api_base(app_id: u64, private_key: String, api_base: String) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            app_id,
            private_key,
            api_base,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_secs();

        let claims = AppClaims {
            iss: self.app_id,
            iat: now - 60,  // tolerate clock skew
            exp: now + 600, // 10 minute validity
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("failed to parse forge private key")?;
        encode(&header, &claims, &encoding_key).context("failed to encode app JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                let remaining = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                if remaining.as_secs() > 300 {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        info!("requesting installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("installation token request failed to send")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("installation token request failed: {status} - {body}");
            return Err(anyhow!("installation token request failed: {status}"));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("failed to parse token expiry")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

        let mut cache = self.token_cache.write().await;
        cache.insert(
            installation_id,
            (token_response.token.clone(), expires_at_system),
        );
        Ok(token_response.token)
    }

    async fn list_pr_comments(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<Vec<Comment>> {
        let token = self.get_installation_token(installation_id).await?;
        let url = format!(
            "{}/repos/{}/issues/{}/comments?per_page=100",
            self.api_base, repo_full_name, pr_number
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("comment list request failed to send")?;

        if !response.status().is_success() {
            return Err(anyhow!("comment list failed: {}", response.status()));
        }
        response
            .json()
            .await
            .context("failed to parse comment list")
    }

    async fn create_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<Comment> {
        let token = self.get_installation_token(installation_id).await?;
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, repo_full_name, pr_number
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CommentBody { body })
            .send()
            .await
            .context("comment create request failed to send")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("comment create failed: {status} - {text}"));
        }
        response.json().await.context("failed to parse comment")
    }

    async fn update_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<Comment> {
        let token = self.get_installation_token(installation_id).await?;
        let url = format!(
            "{}/repos/{}/issues/comments/{}",
            self.api_base, repo_full_name, comment_id
        );
        let response = self
            .client
            .patch(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CommentBody { body })
            .send()
            .await
            .context("comment update request failed to send")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("comment update failed: {status} - {text}"));
        }
        response.json().await.context("failed to parse comment")
    }

    /// Creates or updates the controller's single status comment on a PR.
    /// The marker is appended so the comment can be found again later.
    pub async fn upsert_preview_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        content: &str,
    ) -> Result<u64> {
        let body = format!("{content}\n\n{COMMENT_MARKER}");

        let existing = self
            .list_pr_comments(installation_id, repo_full_name, pr_number)
            .await?
            .into_iter()
            .find(|c| c.body.contains(COMMENT_MARKER));

        let comment = match existing {
            Some(found) => {
                self.update_comment(installation_id, repo_full_name, found.id, &body)
                    .await?
            }
            None => {
                self.create_comment(installation_id, repo_full_name, pr_number, &body)
                    .await?
            }
        };
        info!(
            "posted preview comment {} on {}#{}",
            comment.id, repo_full_name, pr_number
        );
        Ok(comment.id)
    }
}
