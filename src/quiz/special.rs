use async_trait::async_trait;
use log::debug;
use reqwest::{StatusCode, Url};

use crate::quiz::store::{SpecialTestService, StoreError};
use crate::quiz::TestParameters;

/// Client for the service that puts special tests together.
pub struct HttpSpecialTestService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpecialTestService {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn test_url(&self, test_id: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StoreError::Malformed(format!("bad special test url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Malformed(format!("bad special test url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["special-tests", test_id]);
        Ok(url)
    }
}

#[async_trait]
impl SpecialTestService for HttpSpecialTestService {
    async fn generate(&self, test_id: &str) -> Result<Option<TestParameters>, StoreError> {
        let url = self.test_url(test_id)?;
        debug!("Requesting special test from {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        Ok(Some(serde_json::from_str(&body)?))
    }
}
