//! HTTP client for the method and profile registry.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{MetadataService, base_url, endpoint};
use crate::config::ServiceConfig;
use crate::domain::{MethodVersion, ProfileEntry};
use crate::utils::http_client::build_client;
use crate::utils::retry::retry_transient;
use crate::Result;

pub struct CisClient {
    client: Client,
    base: Url,
    api_key: Option<String>,
    retries: u32,
}

impl CisClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout())?,
            base: base_url(&config.url)?,
            api_key: config.api_key(),
            retries: config.retries,
        })
    }

    /// GET a JSON list; a 404 is an empty list.
    async fn get_list<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl MetadataService for CisClient {
    async fn latest_versions(&self, method: &str) -> Result<Vec<MethodVersion>> {
        let url = endpoint(&self.base, &["methods", method, "versions"])?;
        retry_transient("method versions", self.retries, || {
            self.get_list::<MethodVersion>(url.clone())
        })
        .await
    }

    async fn unique_profiles(&self, method: &str, version: &str) -> Result<Vec<ProfileEntry>> {
        let url = endpoint(&self.base, &["profiles", method, version])?;
        let entries: Vec<ProfileEntry> = retry_transient("method profiles", self.retries, || {
            self.get_list::<ProfileEntry>(url.clone())
        })
        .await?;

        // The registry may list a profile once per sample type; keep first occurrences.
        let mut seen = HashSet::new();
        Ok(entries
            .into_iter()
            .filter(|e| seen.insert(e.profile.clone()))
            .collect())
    }
}

impl std::fmt::Debug for CisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CisClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}
