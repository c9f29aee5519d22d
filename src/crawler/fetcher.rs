//! Fetching targets
//!
//! This module defines the contract between the crawl loop and the transports that
//! retrieve documents:
//! - [`FetchRequest`]: everything needed to fetch a target, plus a stable fingerprint
//! - [`FetchResponse`]: the payload, tagged by how it was obtained
//! - [`Fetcher`]: the transport trait, with a direct HTTP implementation and a
//!   browser implementation backed by a rendering service

use crate::config::FetchConfig;
use crate::rule::ClientKind;
use async_trait::async_trait;
use crate::crawler::agents::UserAgents;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors raised while fetching a target
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid request for {url}: {message}")]
    InvalidRequest { url: String, message: String },

    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Request timeout for {url}")]
    Timeout { url: String },

    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("No browser renderer is configured (needed for {url})")]
    BrowserUnavailable { url: String },

    #[error("Fetch task for {url} failed: {message}")]
    Task { url: String, message: String },
}

impl FetchError {
    fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Http {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// A fully resolved request for one target
#[derive(Debug, Clone, Serialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub header: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
    pub content_type: String,

    /// `Cookie` header taken from the job's cookie jar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,

    /// Overrides the client's default `User-Agent`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(skip)]
    pub client: ClientKind,

    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Stable fingerprint of the fetch configuration
    ///
    /// Covers the URL, method, headers, query, form and content type. Map fields are
    /// ordered, so two requests that differ only in insertion order share a
    /// fingerprint. Cookies, user agents and timeouts are not part of it.
    ///
    /// # Returns
    ///
    /// Hex-encoded SHA-256 digest
    pub fn fingerprint(&self) -> String {
        fn feed(hasher: &mut Sha256, value: &str) {
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }

        fn feed_map(hasher: &mut Sha256, map: &BTreeMap<String, String>) {
            hasher.update((map.len() as u64).to_le_bytes());
            for (key, value) in map {
                feed(hasher, key);
                feed(hasher, value);
            }
        }

        let mut hasher = Sha256::new();
        feed(&mut hasher, &self.url);
        feed(&mut hasher, &self.method.to_ascii_uppercase());
        feed_map(&mut hasher, &self.header);
        feed_map(&mut hasher, &self.query);
        feed_map(&mut hasher, &self.form);
        feed(&mut hasher, &self.content_type.to_ascii_lowercase());
        hex::encode(hasher.finalize())
    }
}

/// Payload of a successful fetch
#[derive(Debug, Clone)]
pub enum FetchContent {
    /// Raw response body with its declared content type
    Bytes { body: Vec<u8>, content_type: String },
    /// Document serialized by a browser after rendering
    Rendered { html: String },
}

impl FetchContent {
    /// The payload as bytes
    pub fn bytes(&self) -> &[u8] {
        match self {
            FetchContent::Bytes { body, .. } => body,
            FetchContent::Rendered { html } => html.as_bytes(),
        }
    }

    /// The declared content type, if any
    pub fn content_type(&self) -> &str {
        match self {
            FetchContent::Bytes { content_type, .. } => content_type,
            FetchContent::Rendered { .. } => "text/html; charset=utf-8",
        }
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final URL after redirects
    pub url: String,
    pub content: FetchContent,
    /// Raw `Set-Cookie` values returned with the document
    pub cookies: Vec<String>,
}

/// A transport able to fetch a [`FetchRequest`]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with the configured user agent and timeout
///
/// # Arguments
///
/// * `config` - The fetch configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &FetchConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches documents directly over HTTP
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = build_http_client(config).map_err(|e| FetchError::Http {
            url: String::new(),
            source: e,
        })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let invalid = |message: String| FetchError::InvalidRequest {
            url: request.url.clone(),
            message,
        };

        let url = Url::parse(&request.url).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let method =
            Method::from_bytes(request.method.as_bytes()).map_err(|e| invalid(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.header {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = &request.cookie {
            builder = builder.header(COOKIE, cookie.as_str());
        }
        if let Some(agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, agent.as_str());
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&request.url, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&request.url, e))?;

        Ok(FetchResponse {
            url: final_url,
            content: FetchContent::Bytes {
                body: body.to_vec(),
                content_type,
            },
            cookies,
        })
    }
}

/// Page returned by the rendering service
#[derive(Debug, Deserialize)]
struct RenderedPage {
    html: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    cookies: Vec<String>,
}

/// Fetches documents through a browser rendering service
///
/// The request is posted as JSON to the configured endpoint, which answers with
/// `{"html": "...", "url": "...", "cookies": ["..."]}` once the page has rendered.
#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    client: Client,
    endpoint: Url,
}

impl BrowserFetcher {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&request.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let page: RenderedPage = response
            .json()
            .await
            .map_err(|e| FetchError::from_reqwest(&request.url, e))?;

        Ok(FetchResponse {
            url: page.url.unwrap_or_else(|| request.url.clone()),
            content: FetchContent::Rendered { html: page.html },
            cookies: page.cookies,
        })
    }
}

/// The fetchers available to a job, selected per target by its client kind
#[derive(Clone)]
pub struct Fetchers {
    pub direct: Arc<dyn Fetcher>,
    pub browser: Option<Arc<dyn Fetcher>>,

    /// Agents jobs present to the sites they crawl
    pub agents: UserAgents,
}

impl Fetchers {
    /// Builds the direct fetcher and, when an endpoint is configured, the browser one
    pub fn from_config(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = build_http_client(config).map_err(|e| FetchError::Http {
            url: String::new(),
            source: e,
        })?;

        let browser = match &config.browser_endpoint {
            Some(endpoint) => {
                let endpoint = Url::parse(endpoint).map_err(|e| FetchError::InvalidRequest {
                    url: endpoint.clone(),
                    message: e.to_string(),
                })?;
                Some(Arc::new(BrowserFetcher::new(client.clone(), endpoint)) as Arc<dyn Fetcher>)
            }
            None => None,
        };

        Ok(Self {
            direct: Arc::new(HttpFetcher::with_client(client)),
            browser,
            agents: UserAgents::from_config(config),
        })
    }

    /// Wraps a single fetcher used for direct requests only
    pub fn direct(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            direct: fetcher,
            browser: None,
            agents: UserAgents::default(),
        }
    }

    /// Replaces the user agent pool
    pub fn with_agents(mut self, agents: UserAgents) -> Self {
        self.agents = agents;
        self
    }

    /// Returns the fetcher for a client kind
    pub fn select(&self, client: ClientKind, url: &str) -> Result<Arc<dyn Fetcher>, FetchError> {
        match client {
            ClientKind::Direct => Ok(Arc::clone(&self.direct)),
            ClientKind::Browser => {
                self.browser
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or_else(|| FetchError::BrowserUnavailable {
                        url: url.to_string(),
                    })
            }
        }
    }
}

impl std::fmt::Debug for Fetchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetchers")
            .field("browser", &self.browser.is_some())
            .field("agents", &self.agents.len())
            .finish()
    }
}
