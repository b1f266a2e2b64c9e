//! Transport collaborators: building, executing and interpreting requests.
//!
//! The core never talks to the network itself. A url-backed mapping goes
//! through three collaborators, each replaceable per mapping or per
//! connection through [`Defaults`](crate::Defaults):
//!
//! ```text
//! RequestInit ──► BuildRequest ──► Request ──► Fetch ──► Response ──► HandleResponse ──► value | Rejection
//! ```
//!
//! - [`BuildRequest`] is a pure function of the normalized request fields.
//! - [`Fetch`] performs the round trip. Its faults are `anyhow` errors and
//!   become rejections at the pipeline boundary.
//! - [`HandleResponse`] interprets status codes and decodes the body.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RefetchError, Rejection};

// =============================================================================
// Request Options
// =============================================================================

macro_rules! request_option {
    (
        $(#[$doc:meta])*
        $name:ident, $option:literal, $allowed:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RefetchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(RefetchError::InvalidOption {
                        option: $option,
                        allowed: $allowed,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }
    };
}

request_option! {
    /// Whether credentials (cookies, auth) accompany the request.
    Credentials, "credentials", "omit, same-origin, include" {
        Omit => "omit",
        SameOrigin => "same-origin",
        Include => "include",
    }
}

request_option! {
    /// How redirects are handled.
    Redirect, "redirect", "follow, error, manual" {
        Follow => "follow",
        Error => "error",
        Manual => "manual",
    }
}

request_option! {
    /// Cross-origin request mode.
    Mode, "mode", "cors, no-cors, same-origin, navigate" {
        Cors => "cors",
        NoCors => "no-cors",
        SameOrigin => "same-origin",
        Navigate => "navigate",
    }
}

/// Returns true if `method` is a valid HTTP token (RFC 7230 `tchar`s).
pub fn is_valid_method(method: &str) -> bool {
    !method.is_empty()
        && method.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

// =============================================================================
// Request / Response
// =============================================================================

/// The normalized request fields of a url-backed mapping.
///
/// Headers are already resolved: dynamic values were called and falsy ones
/// dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestInit {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub credentials: Credentials,
    pub redirect: Redirect,
    pub mode: Mode,
}

/// A wire request handed to a [`Fetch`] executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub credentials: Credentials,
    pub redirect: Redirect,
    pub mode: Mode,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A wire response returned by a [`Fetch`] executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// A response whose body is the serialized `body`.
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string())
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Content-Length` header, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Status and headers, recorded in a cell's meta as `response`.
    pub fn summary(&self) -> Value {
        json!({
            "status": self.status,
            "status_text": self.status_text,
            "headers": self.headers,
        })
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Turns normalized request fields into a wire request.
pub trait BuildRequest: Send + Sync {
    fn build(&self, init: &RequestInit) -> Request;
}

impl<F> BuildRequest for F
where
    F: Fn(&RequestInit) -> Request + Send + Sync,
{
    fn build(&self, init: &RequestInit) -> Request {
        self(init)
    }
}

/// Performs a request.
///
/// Any error is converted into a [`Rejection`] carrying the error's context
/// chain.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response>;
}

/// Interprets a response.
///
/// `Ok(None)` means the response carried no value (no content).
#[async_trait]
pub trait HandleResponse: Send + Sync {
    async fn handle(&self, response: Response) -> Result<Option<Value>, Rejection>;
}

// =============================================================================
// Defaults
// =============================================================================

/// Copies the request fields through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBuildRequest;

impl BuildRequest for DefaultBuildRequest {
    fn build(&self, init: &RequestInit) -> Request {
        Request {
            url: init.url.clone(),
            method: init.method.clone(),
            headers: init.headers.clone(),
            body: init.body.clone(),
            credentials: init.credentials,
            redirect: init.redirect,
            mode: init.mode,
        }
    }
}

/// Decodes JSON bodies.
///
/// - `Content-Length: 0`, a 204, or an empty body yields no value and is
///   never decoded.
/// - A 2xx body is decoded; a decode failure is a rejection.
/// - Any other status decodes the body into a rejection, taking its
///   message from `error`, then `message`, then the status text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseHandler;

#[async_trait]
impl HandleResponse for JsonResponseHandler {
    async fn handle(&self, response: Response) -> Result<Option<Value>, Rejection> {
        let no_content =
            response.status == 204 || response.content_length() == Some(0) || response.body.is_empty();

        if response.is_success() {
            if no_content {
                return Ok(None);
            }
            return serde_json::from_slice(&response.body)
                .map(Some)
                .map_err(|e| {
                    Rejection::new(format!("failed to decode response body: {e}"))
                        .with_status(response.status)
                });
        }

        let status_text = if response.status_text.is_empty() {
            format!("request failed with status {}", response.status)
        } else {
            response.status_text.clone()
        };

        let cause = if no_content {
            Value::Null
        } else {
            serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&response.body).into_owned())
            })
        };

        Err(Rejection::from_cause(cause, status_text).with_status(response.status))
    }
}
