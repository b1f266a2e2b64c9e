//! Canonical descriptors and the normalization that produces them.
//!
//! Normalization turns one raw [`Spec`] into either a [`Descriptor`] or an
//! untouched [`Deferred`] trigger:
//!
//! ```text
//! Spec::Deferred ───────────────────────────────────────────► Normalized::Deferred
//! Spec::Url ──► Mapping ──┐
//! Spec::Mapping ──────────┴─► exactly one source? ──► layer over Defaults
//!                                                        │
//!                           validate method / options ◄──┘
//!                           resolve headers (drop falsy)
//!                                     │
//!                                     ▼
//!                             Normalized::Concrete(Descriptor)
//! ```
//!
//! Continuation replacements (returned by `then` / `catch`) are normalized
//! against their parent: they inherit its `comparison` when they declare
//! none and its transport wiring, never its continuation handlers, and
//! remember the root of the chain as their [`origin`](Descriptor::origin).
//! A root with a `refresh_interval` keeps polling: the chain renews from it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::defaults::Defaults;
use crate::error::RefetchError;
use crate::mapping::{
    AndCatchFn, AndThenFn, CatchFn, Deferred, Identity, Mapping, Refreshing, Spec, ThenFn,
};
use crate::transport::{
    is_valid_method, BuildRequest, Credentials, DefaultBuildRequest, Fetch, HandleResponse,
    JsonResponseHandler, Mode, Redirect, RequestInit,
};

/// Where a descriptor's value comes from.
#[derive(Debug, Clone)]
pub enum Source {
    Value(Identity),
    Request(RequestInit),
}

/// The collaborators a url-backed descriptor is executed with.
#[derive(Clone)]
pub struct Transport {
    pub fetch: Option<Arc<dyn Fetch>>,
    pub build_request: Arc<dyn BuildRequest>,
    pub handle_response: Arc<dyn HandleResponse>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("fetch", &self.fetch.is_some())
            .finish_non_exhaustive()
    }
}

/// The normalized form of one mapping.
#[derive(Clone)]
pub struct Descriptor {
    pub source: Source,
    pub meta: Value,
    pub then: Option<ThenFn>,
    pub catch: Option<CatchFn>,
    pub and_then: Option<AndThenFn>,
    pub and_catch: Option<AndCatchFn>,
    pub refresh_interval: Duration,
    pub refreshing: Refreshing,
    pub force: bool,
    pub comparison: Option<Value>,
    pub transport: Transport,
    /// The root of the continuation chain this descriptor replaced into.
    /// `None` for descriptors normalized from a round.
    pub origin: Option<Arc<Descriptor>>,
}

/// The outcome of normalizing one spec.
#[derive(Debug, Clone)]
pub enum Normalized {
    Concrete(Descriptor),
    Deferred(Deferred),
}

impl Descriptor {
    /// Normalize a spec from a round.
    pub fn normalize(name: &str, spec: Spec, defaults: &Defaults) -> Result<Normalized, RefetchError> {
        match spec {
            Spec::Deferred(deferred) => Ok(Normalized::Deferred(deferred)),
            Spec::Url(url) => {
                Self::from_mapping(name, Mapping::new().url(url), defaults, None).map(Normalized::Concrete)
            }
            Spec::Mapping(mapping) => {
                Self::from_mapping(name, mapping, defaults, None).map(Normalized::Concrete)
            }
        }
    }

    /// Normalize the replacement a `then` / `catch` handler returned.
    pub fn normalize_continuation(
        name: &str,
        spec: Spec,
        parent: &Arc<Descriptor>,
        defaults: &Defaults,
    ) -> Result<Descriptor, RefetchError> {
        let mapping = spec
            .into_mapping()
            .ok_or_else(|| RefetchError::DeferredContinuation {
                name: name.to_string(),
            })?;
        Self::from_mapping(name, mapping, defaults, Some(parent))
    }

    fn from_mapping(
        name: &str,
        mut mapping: Mapping,
        defaults: &Defaults,
        parent: Option<&Arc<Descriptor>>,
    ) -> Result<Descriptor, RefetchError> {
        let raw = match (mapping.value.take(), mapping.url.take()) {
            (Some(identity), None) => RawSource::Value(identity),
            (None, Some(url)) => RawSource::Url(url),
            (Some(_), Some(_)) => {
                return Err(RefetchError::ConflictingSource {
                    name: name.to_string(),
                })
            }
            (None, None) => {
                return Err(RefetchError::MissingSource {
                    name: name.to_string(),
                })
            }
        };

        if let Some(parent) = parent {
            mapping.comparison = mapping.comparison.or_else(|| parent.comparison.clone());
            mapping.fetch = mapping.fetch.or_else(|| parent.transport.fetch.clone());
            mapping.build_request = mapping
                .build_request
                .or_else(|| Some(parent.transport.build_request.clone()));
            mapping.handle_response = mapping
                .handle_response
                .or_else(|| Some(parent.transport.handle_response.clone()));
        }

        // A replacement picks up default `catch` / `and_catch`, never a
        // default `then` / `and_then`.
        let own = parent.map(|_| (mapping.then.clone(), mapping.and_then.clone()));
        let mut m = mapping.layered_over(defaults.base());
        if let Some((then, and_then)) = own {
            m.then = then;
            m.and_then = and_then;
        }

        let method = m.method.unwrap_or_else(|| "GET".to_string());
        if !is_valid_method(&method) {
            return Err(RefetchError::InvalidMethod {
                name: name.to_string(),
                method,
            });
        }
        let credentials: Credentials = parse_or(m.credentials, Credentials::SameOrigin)?;
        let redirect: Redirect = parse_or(m.redirect, Redirect::Follow)?;
        let mode: Mode = parse_or(m.mode, Mode::Cors)?;

        let transport = Transport {
            fetch: m.fetch,
            build_request: m
                .build_request
                .unwrap_or_else(|| Arc::new(DefaultBuildRequest)),
            handle_response: m
                .handle_response
                .unwrap_or_else(|| Arc::new(JsonResponseHandler)),
        };

        let source = match raw {
            RawSource::Value(identity) => {
                if matches!(identity, Identity::Lazy(_)) && m.comparison.is_none() {
                    return Err(RefetchError::LazyValueWithoutComparison {
                        name: name.to_string(),
                    });
                }
                Source::Value(identity)
            }
            RawSource::Url(url) => {
                if transport.fetch.is_none() {
                    return Err(RefetchError::MissingFetch {
                        name: name.to_string(),
                    });
                }
                let headers: BTreeMap<String, String> = m
                    .headers
                    .iter()
                    .filter_map(|(k, v)| v.resolve().map(|v| (k.clone(), v)))
                    .collect();
                Source::Request(RequestInit {
                    url,
                    method,
                    headers,
                    body: m.body,
                    credentials,
                    redirect,
                    mode,
                })
            }
        };

        let origin = parent.map(|p| p.origin.clone().unwrap_or_else(|| Arc::clone(p)));

        Ok(Descriptor {
            source,
            meta: m.meta.unwrap_or_else(|| json!({})),
            then: m.then,
            catch: m.catch,
            and_then: m.and_then,
            and_catch: m.and_catch,
            refresh_interval: m.refresh_interval.unwrap_or(Duration::ZERO),
            refreshing: m.refreshing.unwrap_or_default(),
            force: m.force.unwrap_or(false),
            comparison: m.comparison,
            transport,
            origin,
        })
    }

    // =========================================================================
    // Equality
    // =========================================================================

    /// Whether two descriptors describe the same operation.
    ///
    /// If either side declares `comparison`, only the comparisons are
    /// compared. Otherwise value, url, method, headers and body are.
    pub fn equals(&self, other: &Descriptor) -> bool {
        if self.comparison.is_some() || other.comparison.is_some() {
            return self.comparison == other.comparison;
        }

        match (&self.source, &other.source) {
            (Source::Value(a), Source::Value(b)) => a.same(b),
            (Source::Request(a), Source::Request(b)) => {
                a.url == b.url && a.method == b.method && a.headers == b.headers && a.body == b.body
            }
            _ => false,
        }
    }

    /// The descriptor a new round is diffed against: the chain root.
    pub fn diff_base(&self) -> &Descriptor {
        self.origin.as_deref().unwrap_or(self)
    }

    /// The descriptor a renewal re-runs, and whose interval schedules it.
    ///
    /// A chain whose root polls renews from the root, so the whole chain runs
    /// again. Otherwise the descriptor renews itself.
    pub fn renewal_target(&self) -> &Descriptor {
        let root = self.diff_base();
        if root.refresh_interval.is_zero() {
            self
        } else {
            root
        }
    }

    /// A copy that re-dispatches as a forced renewal.
    pub fn renewal(&self) -> Descriptor {
        Descriptor {
            refreshing: Refreshing::On,
            force: true,
            ..self.clone()
        }
    }

    pub fn should_dispatch(&self, previous: Option<&Descriptor>) -> bool {
        self.force
            || !self.refreshing.is_off()
            || previous.map_or(true, |prev| !prev.diff_base().equals(self))
    }

    pub fn url(&self) -> Option<&str> {
        match &self.source {
            Source::Request(init) => Some(&init.url),
            Source::Value(_) => None,
        }
    }

    pub fn request(&self) -> Option<&RequestInit> {
        match &self.source {
            Source::Request(init) => Some(init),
            Source::Value(_) => None,
        }
    }
}

enum RawSource {
    Value(Identity),
    Url(String),
}

fn parse_or<T>(raw: Option<String>, fallback: T) -> Result<T, RefetchError>
where
    T: std::str::FromStr<Err = RefetchError>,
{
    raw.map_or(Ok(fallback), |s| s.parse())
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("source", &self.source)
            .field("meta", &self.meta)
            .field("refresh_interval", &self.refresh_interval)
            .field("refreshing", &self.refreshing)
            .field("force", &self.force)
            .field("comparison", &self.comparison)
            .field("has_origin", &self.origin.is_some())
            .finish_non_exhaustive()
    }
}
