//! Remote resource list acquisition.
//!
//! The data source exposes the resource list behind HTTP Basic auth at
//! `<base>?verb=resourcelist.xml&spaces=<s1,s2,...>`. Any non-200
//! response is a [`HarvestError::Fetch`]; the engine never retries
//! within a pull, the next scheduled run covers the same window because
//! the watermark is not advanced on failure.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::config::SyncConfig;
use crate::error::HarvestError;

/// Where the engine obtains the document text. The production
/// implementation is [`DataSourceConnector`]; tests substitute a static
/// source.
#[async_trait]
pub trait ResourceListSource: Send + Sync {
    async fn fetch(&self, spaces: &[String]) -> Result<String, HarvestError>;
}

pub struct DataSourceConnector {
    client: reqwest::Client,
    base: Url,
    user: String,
    password: String,
}

impl DataSourceConnector {
    pub fn new(config: &SyncConfig) -> Result<Self, HarvestError> {
        Self::with_timeout(config, config.request_timeout)
    }

    pub fn with_timeout(config: &SyncConfig, timeout: Duration) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Config(format!("Cannot build HTTP client: {e}")))?;
        Ok(DataSourceConnector {
            client,
            base: config.resource_list_url.clone(),
            user: config.auth_user.clone(),
            password: config.auth_pass.clone(),
        })
    }
}

#[async_trait]
impl ResourceListSource for DataSourceConnector {
    async fn fetch(&self, spaces: &[String]) -> Result<String, HarvestError> {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("verb", "resourcelist.xml")
            .append_pair("spaces", &spaces.join(","));
        tracing::info!("Retrieving the resource list from {}", self.base);
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(HarvestError::Fetch(format!(
                "Status code was {} instead of 200",
                status.as_u16()
            )));
        }
        Ok(response.text().await?)
    }
}
