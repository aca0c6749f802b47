//! HTTP client for the workspace provisioner's metrics endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use plexus_protocol::models::ResourceUtil;

use super::{StoreError, StoreResult, WorkspaceClient};

/// Talks to `GET {base}/workspaces/{id}/resources?user_id=`.
#[derive(Debug, Clone)]
pub struct HttpWorkspaceClient {
    base_url: String,
    client: reqwest::Client,
}

/// Raw sample as the provisioner reports it. Ratios are derived locally.
#[derive(Debug, Deserialize)]
struct ResourceSample {
    cpu: f64,
    cpu_limit: f64,
    mem: f64,
    mem_limit: f64,
}

impl HttpWorkspaceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building workspace client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn resources_url(&self, workspace_id: i64) -> String {
        format!("{}/workspaces/{workspace_id}/resources", self.base_url)
    }
}

#[async_trait]
impl WorkspaceClient for HttpWorkspaceClient {
    #[instrument(skip(self))]
    async fn get_resource_util(&self, workspace_id: i64, user_id: i64) -> StoreResult<ResourceUtil> {
        let response = self
            .client
            .get(self.resources_url(workspace_id))
            .query(&[("user_id", user_id)])
            .send()
            .await
            .context("requesting resource utilization")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(format!("workspace {workspace_id}")));
        }

        let sample: ResourceSample = response
            .error_for_status()
            .context("resource utilization request failed")?
            .json()
            .await
            .context("decoding resource utilization")?;

        Ok(ResourceUtil::new(sample.cpu, sample.cpu_limit, sample.mem, sample.mem_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_trailing_slash() {
        let client = HttpWorkspaceClient::new("http://ws.internal/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.resources_url(12), "http://ws.internal/workspaces/12/resources");
    }
}
