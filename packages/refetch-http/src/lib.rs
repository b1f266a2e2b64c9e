//! reqwest-backed fetch executor for refetch connections.
//!
//! [`HttpFetch`] performs the network round trip for url mappings. It
//! resolves relative urls against a configured base, honors each request's
//! redirect policy and attaches a bearer token: always under `include`,
//! only to the base url's origin under `same-origin`, never under `omit`.
//!
//! # Example
//!
//! ```rust,ignore
//! use refetch::{Connection, Specs};
//! use refetch_http::{HttpConfig, HttpFetch};
//!
//! // REFETCH_BASE_URL=https://api.example.com/
//! let fetch = HttpFetch::new(HttpConfig::from_env()?)?;
//! let connection = Connection::builder().fetch(fetch).build()?;
//!
//! connection.reconcile(Specs::new().with("me", "/me"))?;
//! ```

pub mod config;

pub use config::HttpConfig;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use refetch::{Credentials, Fetch, Redirect, Request, Response};
use url::Url;

/// A [`Fetch`] executor over two reqwest clients: one following redirects,
/// one returning them as responses.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    follow: reqwest::Client,
    manual: reqwest::Client,
    config: HttpConfig,
}

impl HttpFetch {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let follow = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build http client")?;
        let manual = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            follow,
            manual,
            config,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(HttpConfig::from_env()?)
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// The absolute url a request url points at.
    ///
    /// Absolute urls are used as-is; anything else is joined onto the base url
    /// the way a browser resolves a link.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .config
                    .base_url
                    .as_ref()
                    .ok_or_else(|| anyhow!("relative url {url} needs REFETCH_BASE_URL"))?;
                base.join(url).with_context(|| format!("cannot join {url} onto {base}"))
            }
            Err(e) => Err(e).with_context(|| format!("invalid url {url}")),
        }
    }

    /// Whether the bearer token goes to `url` under `credentials`.
    ///
    /// `same-origin` only sends it to the base url's origin; without a base
    /// url there is no origin to match.
    fn sends_token(&self, credentials: Credentials, url: &Url) -> bool {
        match credentials {
            Credentials::Omit => false,
            Credentials::Include => true,
            Credentials::SameOrigin => self
                .config
                .base_url
                .as_ref()
                .is_some_and(|base| base.origin() == url.origin()),
        }
    }
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn fetch(&self, request: Request) -> Result<Response> {
        let url = self.resolve(&request.url)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("invalid method {}", request.method))?;

        let client = match request.redirect {
            Redirect::Follow => &self.follow,
            Redirect::Error | Redirect::Manual => &self.manual,
        };

        let mut builder = client.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if self.sends_token(request.credentials, &url) && request.header("Authorization").is_none() {
            if let Some(token) = &self.config.bearer_token {
                builder = builder.bearer_auth(token);
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::info!(method = %request.method, url = %url, "Sending request");
        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {url} failed", request.method))?;

        let status = resp.status();
        if request.redirect == Redirect::Error && status.is_redirection() {
            bail!("{url} redirected with status {} and redirects are refused", status.as_u16());
        }

        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read response body from {url}"))?;
        tracing::debug!(status = status.as_u16(), bytes = body.len(), url = %url, "Received response");

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}
