//! Raw, caller-facing inputs.
//!
//! Every round, the caller hands the connection a [`Specs`] map: one
//! [`Spec`] per name. A spec is one of three shapes:
//!
//! | shape | meaning |
//! |-------|---------|
//! | [`Spec::Url`] | sugar for `Mapping::new().url(..)` |
//! | [`Spec::Mapping`] | a descriptor built fluently with [`Mapping`] |
//! | [`Spec::Deferred`] | a trigger, called only through `invoke` |
//!
//! Nothing in this module validates anything. Validation, defaults and
//! header resolution happen when a spec is normalized into a
//! [`Descriptor`](crate::Descriptor).
//!
//! # Example
//!
//! ```ignore
//! use refetch::{Mapping, Spec, Specs};
//! use std::time::Duration;
//!
//! let specs = Specs::new()
//!     .with("user", format!("/users/{id}"))
//!     .with(
//!         "feed",
//!         Mapping::new()
//!             .url("/feed")
//!             .refresh_interval(Duration::from_secs(30))
//!             .then(|feed, _| feed["next"].as_str().map(Spec::from)),
//!     )
//!     .with(
//!         "like",
//!         Spec::deferred(move |args| {
//!             Specs::new().with("like_response", Mapping::new().url("/likes").method("POST").body(args[0].to_string()))
//!         }),
//!     );
//! ```

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::error::Rejection;
use crate::transport::{BuildRequest, Fetch, HandleResponse};

// =============================================================================
// Handler Types
// =============================================================================

/// `then`: maps a fulfilled value to a replacement spec for the same name.
pub type ThenFn = Arc<dyn Fn(&Value, &Value) -> Option<Spec> + Send + Sync>;
/// `catch`: maps a rejection to a replacement spec for the same name.
pub type CatchFn = Arc<dyn Fn(&Rejection, &Value) -> Option<Spec> + Send + Sync>;
/// `and_then`: maps a fulfilled value to sibling specs.
pub type AndThenFn = Arc<dyn Fn(&Value, &Value) -> Specs + Send + Sync>;
/// `and_catch`: maps a rejection to sibling specs.
pub type AndCatchFn = Arc<dyn Fn(&Rejection, &Value) -> Specs + Send + Sync>;
/// Optimistic transform of the retained value during a renewal.
pub type RefreshFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// A header whose value is computed at normalization time.
pub type HeaderFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;
/// A value computed lazily each time the mapping is dispatched.
pub type LazyFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, Rejection>> + Send + Sync>;

// =============================================================================
// Identity Values
// =============================================================================

/// A promise-like value that may be shared across rounds.
///
/// Two `PendingValue`s are equal only if they are clones of the same one, so
/// reusing it across rounds does not dispatch again.
#[derive(Clone)]
pub struct PendingValue(Arc<Shared<BoxFuture<'static, Result<Value, Rejection>>>>);

impl PendingValue {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Rejection>> + Send + 'static,
    {
        Self(Arc::new(future.boxed().shared()))
    }

    /// A future resolving with the shared outcome.
    pub fn outcome(&self) -> BoxFuture<'static, Result<Value, Rejection>> {
        (*self.0).clone().boxed()
    }

    pub fn ptr_eq(&self, other: &PendingValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PendingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingValue")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

/// The `value` side of a mapping's source.
#[derive(Clone)]
pub enum Identity {
    /// Already known; fulfills in the same round.
    Ready(Value),
    /// Promise-like; awaited, compared by identity.
    Pending(PendingValue),
    /// Computed on each dispatch; only comparable through `comparison`.
    Lazy(LazyFn),
}

impl Identity {
    /// Structural for ready values, pointer identity otherwise.
    pub fn same(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::Ready(a), Identity::Ready(b)) => a == b,
            (Identity::Pending(a), Identity::Pending(b)) => a.ptr_eq(b),
            (Identity::Lazy(a), Identity::Lazy(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            Identity::Pending(p) => f.debug_tuple("Pending").field(p).finish(),
            Identity::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

// =============================================================================
// Headers / Refreshing
// =============================================================================

/// A header entry in a mapping or defaults layer.
#[derive(Clone)]
pub enum HeaderValue {
    Static(String),
    Dynamic(HeaderFn),
    /// Removes a header set by a lower layer.
    Unset,
}

impl HeaderValue {
    /// The literal value, or `None` if it is falsy (unset or empty).
    pub fn resolve(&self) -> Option<String> {
        let value = match self {
            HeaderValue::Static(s) => Some(s.clone()),
            HeaderValue::Dynamic(f) => f(),
            HeaderValue::Unset => None,
        };
        value.filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Static(s) => f.debug_tuple("Static").field(s).finish(),
            HeaderValue::Dynamic(_) => f.write_str("Dynamic(..)"),
            HeaderValue::Unset => f.write_str("Unset"),
        }
    }
}

/// Whether a dispatch is a renewal of the current cell.
#[derive(Clone, Default)]
pub enum Refreshing {
    #[default]
    Off,
    On,
    /// A renewal that optimistically transforms the retained value.
    Transform(RefreshFn),
}

impl Refreshing {
    pub fn is_off(&self) -> bool {
        matches!(self, Refreshing::Off)
    }
}

impl fmt::Debug for Refreshing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refreshing::Off => f.write_str("Off"),
            Refreshing::On => f.write_str("On"),
            Refreshing::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

// =============================================================================
// Deferred Triggers
// =============================================================================

/// A name bound to a callable instead of a concrete mapping.
///
/// Never called by normalization. Invoking it with arguments produces
/// further specs, which run as a round of their own.
#[derive(Clone)]
pub struct Deferred(Arc<dyn Fn(&[Value]) -> Specs + Send + Sync>);

impl Deferred {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Specs + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Specs {
        (self.0)(args)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred(..)")
    }
}

// =============================================================================
// Spec / Specs
// =============================================================================

/// What one name is bound to in a round.
#[derive(Debug, Clone)]
pub enum Spec {
    Url(String),
    Mapping(Mapping),
    Deferred(Deferred),
}

impl Spec {
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Specs + Send + Sync + 'static,
    {
        Spec::Deferred(Deferred::new(f))
    }

    /// The spec as a mapping. Deferred triggers have none.
    pub fn into_mapping(self) -> Option<Mapping> {
        match self {
            Spec::Url(url) => Some(Mapping::new().url(url)),
            Spec::Mapping(mapping) => Some(mapping),
            Spec::Deferred(_) => None,
        }
    }
}

impl From<&str> for Spec {
    fn from(url: &str) -> Self {
        Spec::Url(url.to_string())
    }
}

impl From<String> for Spec {
    fn from(url: String) -> Self {
        Spec::Url(url)
    }
}

impl From<Mapping> for Spec {
    fn from(mapping: Mapping) -> Self {
        Spec::Mapping(mapping)
    }
}

impl From<Deferred> for Spec {
    fn from(deferred: Deferred) -> Self {
        Spec::Deferred(deferred)
    }
}

/// A name → spec map for one round.
#[derive(Debug, Clone, Default)]
pub struct Specs(BTreeMap<String, Spec>);

impl Specs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, spec: impl Into<Spec>) -> Self {
        self.insert(name, spec);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: impl Into<Spec>) {
        self.0.insert(name.into(), spec.into());
    }

    pub fn get(&self, name: &str) -> Option<&Spec> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl IntoIterator for Specs {
    type Item = (String, Spec);
    type IntoIter = btree_map::IntoIter<String, Spec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K: Into<String>, S: Into<Spec>> FromIterator<(K, S)> for Specs {
    fn from_iter<I: IntoIterator<Item = (K, S)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, s)| (k.into(), s.into())).collect())
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// A descriptor built fluently.
///
/// Every field is optional; unset fields fall back to the connection's
/// [`Defaults`](crate::Defaults). Exactly one of [`value`](Mapping::value)
/// (or its pending/lazy variants) and [`url`](Mapping::url) must be set.
#[derive(Clone, Default)]
pub struct Mapping {
    pub(crate) url: Option<String>,
    pub(crate) value: Option<Identity>,
    pub(crate) method: Option<String>,
    pub(crate) headers: BTreeMap<String, HeaderValue>,
    pub(crate) body: Option<String>,
    pub(crate) credentials: Option<String>,
    pub(crate) redirect: Option<String>,
    pub(crate) mode: Option<String>,
    pub(crate) meta: Option<Value>,
    pub(crate) refresh_interval: Option<Duration>,
    pub(crate) refreshing: Option<Refreshing>,
    pub(crate) force: Option<bool>,
    pub(crate) comparison: Option<Value>,
    pub(crate) then: Option<ThenFn>,
    pub(crate) catch: Option<CatchFn>,
    pub(crate) and_then: Option<AndThenFn>,
    pub(crate) and_catch: Option<AndCatchFn>,
    pub(crate) fetch: Option<Arc<dyn Fetch>>,
    pub(crate) build_request: Option<Arc<dyn BuildRequest>>,
    pub(crate) handle_response: Option<Arc<dyn HandleResponse>>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Source
    // -------------------------------------------------------------------------

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// An already-known value.
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(Identity::Ready(value.into()));
        self
    }

    /// A promise-like value. Reuse the same [`PendingValue`] across rounds
    /// to keep it from being dispatched again.
    pub fn pending_value(mut self, value: PendingValue) -> Self {
        self.value = Some(Identity::Pending(value));
        self
    }

    /// A value computed on every dispatch. Requires [`comparison`](Mapping::comparison).
    pub fn lazy_value<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Rejection>> + Send + 'static,
    {
        self.value = Some(Identity::Lazy(Arc::new(move || f().boxed())));
        self
    }

    // -------------------------------------------------------------------------
    // Request
    // -------------------------------------------------------------------------

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into(), HeaderValue::Static(value.into()));
        self
    }

    /// A header computed when the mapping is normalized. `None` or an empty
    /// string drops the header.
    pub fn header_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.headers
            .insert(name.into(), HeaderValue::Dynamic(Arc::new(f)));
        self
    }

    /// Remove a header contributed by the defaults.
    pub fn drop_header(mut self, name: impl Into<String>) -> Self {
        self.headers.insert(name.into(), HeaderValue::Unset);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// A JSON body.
    pub fn json_body(self, body: &Value) -> Self {
        self.body(body.to_string())
    }

    /// `omit`, `same-origin` or `include` (or a [`Credentials`](crate::Credentials)).
    pub fn credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// `follow`, `error` or `manual` (or a [`Redirect`](crate::Redirect)).
    pub fn redirect(mut self, redirect: impl Into<String>) -> Self {
        self.redirect = Some(redirect.into());
        self
    }

    /// `cors`, `no-cors`, `same-origin` or `navigate` (or a [`Mode`](crate::Mode)).
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Renew the mapping this long after each fulfillment. Zero disables it.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Mark this dispatch as a renewal: the current value stays visible.
    pub fn refreshing(mut self, refreshing: bool) -> Self {
        self.refreshing = Some(if refreshing {
            Refreshing::On
        } else {
            Refreshing::Off
        });
        self
    }

    /// A renewal that shows `transform(current value)` until it settles.
    pub fn refreshing_with<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.refreshing = Some(Refreshing::Transform(Arc::new(transform)));
        self
    }

    /// Dispatch even if the mapping is unchanged.
    pub fn force(mut self, force: bool) -> Self {
        self.force = Some(force);
        self
    }

    /// Compare mappings by this value instead of structurally.
    pub fn comparison(mut self, comparison: impl Into<Value>) -> Self {
        self.comparison = Some(comparison.into());
        self
    }

    // -------------------------------------------------------------------------
    // Continuations
    // -------------------------------------------------------------------------

    pub fn then<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Option<Spec> + Send + Sync + 'static,
    {
        self.then = Some(Arc::new(f));
        self
    }

    pub fn catch<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rejection, &Value) -> Option<Spec> + Send + Sync + 'static,
    {
        self.catch = Some(Arc::new(f));
        self
    }

    pub fn and_then<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Specs + Send + Sync + 'static,
    {
        self.and_then = Some(Arc::new(f));
        self
    }

    pub fn and_catch<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rejection, &Value) -> Specs + Send + Sync + 'static,
    {
        self.and_catch = Some(Arc::new(f));
        self
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    pub fn fetch(mut self, fetch: impl Fetch + 'static) -> Self {
        self.fetch = Some(Arc::new(fetch));
        self
    }

    pub fn build_request(mut self, build: impl BuildRequest + 'static) -> Self {
        self.build_request = Some(Arc::new(build));
        self
    }

    pub fn handle_response(mut self, handle: impl HandleResponse + 'static) -> Self {
        self.handle_response = Some(Arc::new(handle));
        self
    }

    // -------------------------------------------------------------------------
    // Layering
    // -------------------------------------------------------------------------

    /// Fill every unset field from `base`. Headers merge key-wise, this
    /// mapping's entries winning.
    pub(crate) fn layered_over(self, base: &Mapping) -> Mapping {
        let mut headers = base.headers.clone();
        headers.extend(self.headers);

        Mapping {
            url: self.url.or_else(|| base.url.clone()),
            value: self.value.or_else(|| base.value.clone()),
            method: self.method.or_else(|| base.method.clone()),
            headers,
            body: self.body.or_else(|| base.body.clone()),
            credentials: self.credentials.or_else(|| base.credentials.clone()),
            redirect: self.redirect.or_else(|| base.redirect.clone()),
            mode: self.mode.or_else(|| base.mode.clone()),
            meta: self.meta.or_else(|| base.meta.clone()),
            refresh_interval: self.refresh_interval.or(base.refresh_interval),
            refreshing: self.refreshing.or_else(|| base.refreshing.clone()),
            force: self.force.or(base.force),
            comparison: self.comparison.or_else(|| base.comparison.clone()),
            then: self.then.or_else(|| base.then.clone()),
            catch: self.catch.or_else(|| base.catch.clone()),
            and_then: self.and_then.or_else(|| base.and_then.clone()),
            and_catch: self.and_catch.or_else(|| base.and_catch.clone()),
            fetch: self.fetch.or_else(|| base.fetch.clone()),
            build_request: self.build_request.or_else(|| base.build_request.clone()),
            handle_response: self.handle_response.or_else(|| base.handle_response.clone()),
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("url", &self.url)
            .field("value", &self.value)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("credentials", &self.credentials)
            .field("redirect", &self.redirect)
            .field("mode", &self.mode)
            .field("meta", &self.meta)
            .field("refresh_interval", &self.refresh_interval)
            .field("refreshing", &self.refreshing)
            .field("force", &self.force)
            .field("comparison", &self.comparison)
            .field("then", &self.then.is_some())
            .field("catch", &self.catch.is_some())
            .field("and_then", &self.and_then.is_some())
            .field("and_catch", &self.and_catch.is_some())
            .field("fetch", &self.fetch.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_spec_is_url_sugar() {
        let mapping = Spec::from("/a/1").into_mapping().unwrap();
        assert_eq!(mapping.url.as_deref(), Some("/a/1"));
        assert!(mapping.value.is_none());
    }

    #[test]
    fn test_deferred_spec_has_no_mapping() {
        let spec = Spec::deferred(|_| Specs::new());
        assert!(spec.into_mapping().is_none());
    }

    #[test]
    fn test_deferred_call_passes_args() {
        let deferred = Deferred::new(|args| Specs::new().with("echo", Mapping::new().value(args[0].clone())));
        let specs = deferred.call(&[json!(7)]);
        assert_eq!(specs.names().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_specs_are_ordered_by_name() {
        let specs: Specs = [("b", "/b"), ("a", "/a")].into_iter().collect();
        assert_eq!(specs.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(specs.len(), 2);
        assert!(specs.get("a").is_some());
    }

    #[test]
    fn test_header_resolution_drops_falsy() {
        assert_eq!(HeaderValue::Static("x".into()).resolve(), Some("x".into()));
        assert_eq!(HeaderValue::Static(String::new()).resolve(), None);
        assert_eq!(HeaderValue::Unset.resolve(), None);
        assert_eq!(HeaderValue::Dynamic(Arc::new(|| None::<String>)).resolve(), None);
        assert_eq!(
            HeaderValue::Dynamic(Arc::new(|| Some("Bearer t".into()))).resolve(),
            Some("Bearer t".into())
        );
    }

    #[test]
    fn test_layered_over_prefers_top_and_merges_headers() {
        let base = Mapping::new()
            .method("GET")
            .header("Accept", "application/json")
            .header("X-Base", "1")
            .meta(json!({ "base": true }));
        let top = Mapping::new()
            .url("/a")
            .method("POST")
            .header("X-Top", "2")
            .drop_header("X-Base");

        let merged = top.layered_over(&base);
        assert_eq!(merged.url.as_deref(), Some("/a"));
        assert_eq!(merged.method.as_deref(), Some("POST"));
        assert_eq!(merged.meta, Some(json!({ "base": true })));
        assert_eq!(merged.headers.len(), 3);
        assert!(matches!(merged.headers.get("X-Base"), Some(HeaderValue::Unset)));
        assert!(matches!(merged.headers.get("Accept"), Some(HeaderValue::Static(v)) if v == "application/json"));
    }

    #[test]
    fn test_identity_same() {
        let a = Identity::Ready(json!({ "x": 1 }));
        let b = Identity::Ready(json!({ "x": 1 }));
        assert!(a.same(&b));

        let p = PendingValue::new(async { Ok(json!(1)) });
        let q = PendingValue::new(async { Ok(json!(1)) });
        assert!(Identity::Pending(p.clone()).same(&Identity::Pending(p)));
        assert!(!Identity::Pending(q).same(&a));
    }

    #[tokio::test]
    async fn test_pending_value_shares_outcome() {
        let p = PendingValue::new(async { Err(Rejection::new("late")) });
        let first = p.outcome().await;
        let second = p.clone().outcome().await;
        assert_eq!(first, second);
        assert_eq!(first.unwrap_err().message, "late");
    }
}
