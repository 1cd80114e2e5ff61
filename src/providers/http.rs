//! Shared HTTP plumbing for the REST adapters.
//!
//! Wraps a `reqwest::Client` with a base URL, a bearer token and a per-request
//! timeout, and turns error responses into [`ProviderError::Http`] with the
//! provider error code pulled out of the body.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ProviderError, Result};
use crate::storage::Secret;

/// Authenticated JSON client rooted at one API base URL.
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Secret,
    timeout: Duration,
    headers: HeaderMap,
}

impl ApiClient {
    pub(crate) fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Secret,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header sent with every request. Repeated names are appended.
    pub(crate) fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .append(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    /// Resolves an endpoint against the base URL. Absolute URLs (next/delta
    /// links) pass through unchanged.
    pub(crate) fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.base_url, endpoint)
        }
    }

    /// Makes an authenticated GET request.
    pub(crate) async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let request = self.client.get(self.url(endpoint));
        Self::parse(self.execute(request).await?).await
    }

    /// Makes an authenticated GET request with query parameters.
    pub(crate) async fn get_with<T, Q>(&self, endpoint: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let request = self.client.get(self.url(endpoint)).query(query);
        Self::parse(self.execute(request).await?).await
    }

    /// Makes an authenticated POST request with a JSON body.
    pub(crate) async fn post<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.client.post(self.url(endpoint)).json(body);
        Self::parse(self.execute(request).await?).await
    }

    /// Makes an authenticated POST request that doesn't return a body.
    pub(crate) async fn post_no_response<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<()> {
        let request = self.client.post(self.url(endpoint)).json(body);
        self.execute(request).await.map(|_| ())
    }

    /// Makes an authenticated PATCH request that doesn't return a body.
    pub(crate) async fn patch_no_response<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<()> {
        let request = self.client.patch(self.url(endpoint)).json(body);
        self.execute(request).await.map(|_| ())
    }

    /// Sends a request, mapping transport failures and error statuses.
    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .bearer_auth(self.token.expose())
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("parse response: {}", e)))
    }
}

/// Maps a `reqwest` send failure, keeping timeouts distinct.
pub(crate) fn map_send_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        err.into()
    }
}

/// Builds a [`ProviderError::Http`] from a non-success response.
pub(crate) async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let (code, message) = parse_error_body(&body);

    let message = message.unwrap_or_else(|| {
        if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body
        }
    });

    ProviderError::Http {
        status: status.as_u16(),
        code,
        message,
        retry_after,
    }
}

/// Extracts `(code, message)` from a Google, Graph or OAuth error body.
///
/// Google: `error.details[].reason`, `error.errors[].reason`, then `error.status`.
/// Graph: `error.code`. OAuth token endpoints: top-level `error` string.
pub(crate) fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };
    let error = &value["error"];

    if let Some(code) = error.as_str() {
        let message = value["error_description"].as_str().map(str::to_string);
        return (Some(code.to_string()), message);
    }

    let reason = |key: &str| {
        error[key]
            .as_array()
            .and_then(|items| items.iter().find_map(|item| item["reason"].as_str()))
    };
    let code = reason("details")
        .or_else(|| reason("errors"))
        .or_else(|| error["status"].as_str())
        .or_else(|| error["code"].as_str())
        .map(str::to_string);
    let message = error["message"].as_str().map(str::to_string);

    (code, message)
}
