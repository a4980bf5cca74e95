//! HTTP 健康探测：GET health_url，2xx 视为健康

use std::time::Duration;

use async_trait::async_trait;

use crate::supervisor::HealthProbe;

pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "health probe got non-success status");
                false
            }
            Err(e) => {
                tracing::debug!("health probe error: {}", e);
                false
            }
        }
    }
}
