use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = concat!("refetch/", env!("CARGO_PKG_VERSION"));

/// HTTP executor configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Relative request urls are resolved against this.
    pub base_url: Option<Url>,
    pub timeout: Duration,
    pub user_agent: String,
    /// Sent as `Authorization: Bearer ...` per the request's credentials mode.
    pub bearer_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            bearer_token: None,
        }
    }
}

impl HttpConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("REFETCH_BASE_URL")
            .filter(|s| !s.is_empty())
            .map(|s| Url::parse(&s))
            .transpose()
            .context("REFETCH_BASE_URL must be an absolute url")?;

        let timeout = lookup("REFETCH_TIMEOUT_SECS")
            .unwrap_or_else(|| DEFAULT_TIMEOUT_SECS.to_string())
            .parse()
            .map(Duration::from_secs)
            .context("REFETCH_TIMEOUT_SECS must be a whole number of seconds")?;

        Ok(Self {
            base_url,
            timeout,
            user_agent: lookup("REFETCH_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            bearer_token: lookup("REFETCH_BEARER_TOKEN").filter(|s| !s.is_empty()),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = Some(Url::parse(base_url).with_context(|| format!("invalid base url {base_url}"))?);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}
