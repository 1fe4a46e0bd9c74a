//! Hosted session archive backed by a Supabase (PostgREST) table.

use async_trait::async_trait;
use tracing::debug;

use pitchline_core::archive::{SessionArchive, SessionListing, SessionRecord};
use pitchline_core::config::StoreConfig;
use pitchline_core::error::{PitchlineError, Result};

pub struct SupabaseArchive {
    base_url: String,
    api_key: String,
    table: String,
    client: reqwest::Client,
}

impl SupabaseArchive {
    pub fn new(url: &str, api_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            table: table.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PitchlineError::Config("store.url is required for supabase".into()))?;
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| PitchlineError::Config("No Supabase API key configured".into()))?;
        Ok(Self::new(url, api_key, config.table.clone()))
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(PitchlineError::Archive(format!(
            "Supabase API error {status}: {body}"
        )))
    }
}

fn transport(e: reqwest::Error) -> PitchlineError {
    PitchlineError::Archive(format!("Supabase request failed: {e}"))
}

#[async_trait]
impl SessionArchive for SupabaseArchive {
    async fn insert(&self, record: &SessionRecord) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &self.table_url())
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        debug!(session_id = %record.session_id, table = %self.table, "Archived session");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionListing>> {
        let response = self
            .request(reqwest::Method::GET, &self.table_url())
            .query(&[
                ("select", "session_id,title,created_at,score"),
                ("order", "created_at.desc"),
            ])
            .send()
            .await
            .map_err(transport)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let filter = format!("eq.{session_id}");
        let response = self
            .request(reqwest::Method::GET, &self.table_url())
            .query(&[("select", "*"), ("session_id", filter.as_str())])
            .send()
            .await
            .map_err(transport)?;
        let rows: Vec<SessionRecord> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(rows.into_iter().next())
    }
}
