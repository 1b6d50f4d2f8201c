//! # HTTP API Client
//!
//! Thin wrapper around `reqwest` with exponential-backoff retries for
//! transient failures and standardized JSON handling.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

/// A response whose body was decoded when the status was 2xx.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    /// Raw body of a non-2xx response.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
}

pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// # Arguments
    /// * `base_url` - Absolute base URL; relative paths are joined onto it.
    /// * `timeout` - Per-attempt request timeout.
    /// * `max_retries` - Retries for transient failures (5xx, timeouts).
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the client cannot be built.
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::builder().timeout(timeout).build()?)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner: client, base_url: url })
    }

    #[cfg(test)]
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends a request, optionally authorized with `bearer` and carrying `body`
    /// as JSON.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be joined, the request cannot be sent
    /// or a 2xx body does not decode into `T`. Non-2xx statuses are not errors;
    /// check `ApiResponse::success`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        body: Option<&B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(token) = bearer {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(serde_json::to_string(b)?);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse { data: Some(data), error_body: None, status: status.as_u16(), success: true })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse { data: None, error_body: error_text, status: status.as_u16(), success: false })
        }
    }
}
