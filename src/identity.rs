use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::types::AuthorProfile;

/// Batched, read-only access to the users held by the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_user_list(&self, ids: &[String], limit: usize) -> Result<Vec<AuthorProfile>>;
}

pub struct ClerkClient {
    client: reqwest::Client,
    api_url: Url,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct ClerkUser {
    id: String,
    username: Option<String>,
    #[serde(default)]
    email_addresses: Vec<ClerkEmailAddress>,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClerkEmailAddress {
    email_address: String,
}

impl From<ClerkUser> for AuthorProfile {
    fn from(user: ClerkUser) -> Self {
        AuthorProfile {
            id: user.id,
            display_name: user.username,
            email: user
                .email_addresses
                .into_iter()
                .next()
                .map(|e| e.email_address),
            profile_image_url: user
                .profile_image_url
                .or(user.image_url)
                .unwrap_or_default(),
        }
    }
}

impl ClerkClient {
    pub fn new(api_url: &str, secret_key: String) -> Result<Self> {
        // Keep the trailing path segment when joining ("v1/" + "users")
        let mut api_url = Url::parse(api_url).context("Invalid identity API URL")?;
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_url,
            secret_key,
        })
    }

    fn users_url(&self, ids: &[String], limit: usize) -> Result<Url> {
        let mut url = self.api_url.join("users")?;
        {
            let mut query = url.query_pairs_mut();
            for id in ids {
                query.append_pair("user_id", id);
            }
            query.append_pair("limit", &limit.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl IdentityProvider for ClerkClient {
    async fn get_user_list(&self, ids: &[String], limit: usize) -> Result<Vec<AuthorProfile>> {
        let url = self.users_url(ids, limit)?;
        debug!("Fetching {} users from identity provider", ids.len());

        let users: Vec<ClerkUser> = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?
            .error_for_status()
            .context("Identity provider rejected user list request")?
            .json()
            .await?;

        Ok(users.into_iter().map(AuthorProfile::from).collect())
    }
}
