//! Allow-listed, rate-limited outbound HTTP.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::Liveness;
use super::policy::domain_allowed;
use super::rate_limit::RateLimiter;
use crate::error::{PluginError, PluginResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound request as described by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method. Defaults to `GET`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute `http`/`https` URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// UTF-8 request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    /// A `GET` for `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// A `POST` for `url` with a body.
    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response handed back to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers (lowercase names; repeated headers keep the last).
    pub headers: BTreeMap<String, String>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ExecutionFailure`] if the body is not valid
    /// JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> PluginResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| PluginError::ExecutionFailure(format!("invalid JSON response: {e}")))
    }
}

/// HTTP client restricted to an allow-list of domains and a shared rate
/// ceiling. Redirects are never followed.
#[derive(Debug, Clone)]
pub struct RestrictedHttpClient {
    client: reqwest::Client,
    domains: Arc<BTreeSet<String>>,
    limiter: Arc<RateLimiter>,
    max_body_bytes: u64,
    liveness: Liveness,
}

impl RestrictedHttpClient {
    pub(crate) fn new(
        domains: BTreeSet<String>,
        limiter: Arc<RateLimiter>,
        max_body_bytes: u64,
        liveness: Liveness,
    ) -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lantern-plugin-host/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PluginError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            domains: Arc::new(domains),
            limiter,
            max_body_bytes,
            liveness,
        })
    }

    /// Domains this client may reach.
    #[must_use]
    pub fn allowed_domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    /// Requests left in the current rate window.
    pub async fn remaining_requests(&self) -> u32 {
        self.limiter.remaining().await
    }

    /// `GET` a URL.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn get(&self, url: &str) -> PluginResult<HttpResponse> {
        self.send(HttpRequest::get(url)).await
    }

    /// Send a request.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] for a disallowed scheme or domain, or
    /// when the rate ceiling is reached; [`PluginError::ExecutionFailure`]
    /// for transport errors or an oversized body.
    pub async fn send(&self, request: HttpRequest) -> PluginResult<HttpResponse> {
        self.liveness.check(&request.url)?;
        let url = self.check_url(&request.url)?;

        if !self.limiter.try_acquire().await {
            return Err(PluginError::denied(
                url.as_str(),
                "outbound request rate limit reached",
            ));
        }

        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                PluginError::ExecutionFailure(format!("invalid HTTP method '{}'", request.method))
            })?;

        let mut builder = self.client.request(method, url.clone());
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| PluginError::ExecutionFailure(format!("request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if let Some(len) = response.content_length()
            && len > self.max_body_bytes
        {
            return Err(self.body_too_large(&url, len));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PluginError::ExecutionFailure(format!("reading {url} failed: {e}")))?
        {
            body.extend_from_slice(&chunk);
            let size = u64::try_from(body.len()).unwrap_or(u64::MAX);
            if size > self.max_body_bytes {
                return Err(self.body_too_large(&url, size));
            }
        }

        debug!(url = %url, status, bytes = body.len(), "Plugin HTTP request completed");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn body_too_large(&self, url: &Url, size: u64) -> PluginError {
        PluginError::ExecutionFailure(format!(
            "response from {url} is {size} bytes, exceeding the {} byte limit",
            self.max_body_bytes
        ))
    }

    fn check_url(&self, raw: &str) -> PluginResult<Url> {
        let url = Url::parse(raw).map_err(|e| PluginError::denied(raw, format!("invalid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PluginError::denied(
                raw,
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| PluginError::denied(raw, "URL has no host"))?;
        if !domain_allowed(host, &self.domains) {
            return Err(PluginError::denied(
                raw,
                format!("domain '{host}' is not in the plugin's allow-list"),
            ));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(domains: &[&str], per_minute: u32) -> RestrictedHttpClient {
        RestrictedHttpClient::new(
            domains.iter().map(|d| (*d).to_string()).collect(),
            Arc::new(RateLimiter::per_minute(per_minute)),
            1024,
            Liveness::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn disallowed_domain_is_denied_without_spending_budget() {
        let c = client(&["hashlookup.circl.lu"], 60);
        let err = c.get("https://evil.example/collect").await.unwrap_err();
        assert!(matches!(err, PluginError::ResourceDenied { .. }));
        assert_eq!(c.remaining_requests().await, 60);
    }

    #[tokio::test]
    async fn non_http_schemes_are_denied() {
        let c = client(&["hashlookup.circl.lu"], 60);
        for url in [
            "file:///etc/passwd",
            "ftp://hashlookup.circl.lu/x",
            "not a url",
        ] {
            let err = c.get(url).await.unwrap_err();
            assert!(matches!(err, PluginError::ResourceDenied { .. }), "{url}");
        }
    }

    #[tokio::test]
    async fn empty_allow_list_denies_all() {
        let c = client(&[], 60);
        assert!(c.get("https://hashlookup.circl.lu/").await.is_err());
    }

    #[tokio::test]
    async fn exhausted_rate_limit_is_denied() {
        let c = client(&["hashlookup.circl.lu"], 0);
        let err = c
            .get("https://hashlookup.circl.lu/lookup/sha256/00")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limit"), "{err}");
    }

    #[test]
    fn request_json_defaults_to_get() {
        let req: HttpRequest =
            serde_json::from_str(r#"{"url":"https://example.org"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
    }
}
