//! Obtaining a fresh access token and the children it covers.
//!
//! The rest of the crate only sees [`CredentialSource`]; how the token is
//! actually obtained stays behind it.

use std::io::IsTerminal;

use anyhow::Context;
use async_trait::async_trait;

use crate::credentials::Credential;
use crate::famly::{ApiClient, ChildProfile};

/// What a successful login yields.
#[derive(Clone)]
pub struct LoginGrant {
    pub access_token: String,
    pub children: Vec<ChildProfile>,
}

impl std::fmt::Debug for LoginGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginGrant")
            .field("access_token", &"<redacted>")
            .field("children", &self.children)
            .finish()
    }
}

impl LoginGrant {
    /// One credential per child, all sharing the token. Watermarks start
    /// empty; the store keeps any it already has.
    pub fn into_credentials(self) -> Vec<Credential> {
        let token = self.access_token;
        self.children
            .into_iter()
            .map(|child| Credential::new(child.id, token.clone()).with_name(child.name))
            .collect()
    }
}

/// Something that can produce a fresh access token. Called at most once per
/// run.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<LoginGrant>;
}

/// Token pasted by the user (flag, env var or prompt); children from
/// `--child-id` or discovered through the API.
pub struct TokenLogin {
    client: ApiClient,
    access_token: Option<String>,
    child_ids: Vec<String>,
}

impl TokenLogin {
    pub fn new(client: ApiClient, access_token: Option<String>, child_ids: Vec<String>) -> Self {
        Self {
            client,
            access_token,
            child_ids,
        }
    }

    fn token(&self) -> anyhow::Result<String> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }
        if !std::io::stdin().is_terminal() {
            anyhow::bail!(
                "No access token available and stdin is not interactive.\n\
                 Set FAMLY_ACCESS_TOKEN or pass --access-token. The token is the \
                 x-famly-accesstoken header of any request app.famly.co makes."
            );
        }
        let token = tokio::task::block_in_place(|| {
            rpassword::prompt_password("Famly access token (x-famly-accesstoken): ")
        })
        .context("Failed to read access token")?;
        let token = token.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("Empty access token");
        }
        Ok(token)
    }
}

#[async_trait]
impl CredentialSource for TokenLogin {
    async fn acquire(&self) -> anyhow::Result<LoginGrant> {
        let access_token = self.token()?;

        let children = if self.child_ids.is_empty() {
            tracing::info!("Looking up children for this account...");
            let children = self
                .client
                .fetch_children(&access_token)
                .await
                .context("Failed to discover children")?;
            if children.is_empty() {
                anyhow::bail!("No children found for this account; pass --child-id explicitly");
            }
            children
        } else {
            self.child_ids
                .iter()
                .map(|id| ChildProfile {
                    id: id.clone(),
                    name: None,
                })
                .collect()
        };

        for child in &children {
            tracing::info!(
                "Found child: {} ({})",
                child.name.as_deref().unwrap_or("unnamed"),
                child.id
            );
        }

        Ok(LoginGrant {
            access_token,
            children,
        })
    }
}
