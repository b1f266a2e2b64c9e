//! Connection-level defaults, layered beneath every mapping.
//!
//! Built-in values:
//!
//! | field | default |
//! |-------|---------|
//! | method | `GET` |
//! | headers | `Accept: application/json`, `Content-Type: application/json` |
//! | credentials | `same-origin` |
//! | redirect | `follow` |
//! | mode | `cors` |
//! | meta | `{}` |
//! | refresh interval | zero (no renewal) |
//! | build request / handle response | [`DefaultBuildRequest`] / [`JsonResponseHandler`] |
//! | fetch | none |
//!
//! Layers are chainable; each one overrides the fields it sets and headers
//! merge key-wise. Default `then` / `catch` / `and_then` / `and_catch`
//! handlers are allowed:
//!
//! ```ignore
//! let defaults = Defaults::new()
//!     .with(Mapping::new().header("Authorization", format!("Bearer {token}")))
//!     .with(Mapping::new().credentials(Credentials::Include))
//!     .fetch(HttpFetch::new(config)?);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::mapping::{HeaderValue, Mapping};
use crate::transport::{
    Credentials, DefaultBuildRequest, Fetch, JsonResponseHandler, Mode, Redirect,
};

/// Layered defaults applied under every mapping of a connection.
///
/// A layer's source (`url` / `value`) is ignored. Its continuation handlers
/// apply to every mapping that declares none of its own; `then` / `and_then`
/// replacements never pick up the default `then` / `and_then` again.
#[derive(Debug, Clone)]
pub struct Defaults {
    base: Mapping,
}

impl Default for Defaults {
    fn default() -> Self {
        let base = Mapping::new()
            .method("GET")
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .credentials(Credentials::SameOrigin)
            .redirect(Redirect::Follow)
            .mode(Mode::Cors)
            .meta(json!({}))
            .refresh_interval(Duration::ZERO)
            .refreshing(false)
            .force(false)
            .build_request(DefaultBuildRequest)
            .handle_response(JsonResponseHandler);
        Self { base }
    }
}

impl Defaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer `mapping` over the current defaults.
    pub fn with(self, mut mapping: Mapping) -> Self {
        mapping.url = None;
        mapping.value = None;

        Self {
            base: mapping.layered_over(&self.base),
        }
    }

    /// Install the fetch executor used by url mappings that name none.
    pub fn fetch(self, fetch: impl Fetch + 'static) -> Self {
        self.with(Mapping::new().fetch(fetch))
    }

    pub(crate) fn fetch_arc(mut self, fetch: Arc<dyn Fetch>) -> Self {
        self.base.fetch = Some(fetch);
        self
    }

    pub fn has_fetch(&self) -> bool {
        self.base.fetch.is_some()
    }

    /// The literal value a default header currently resolves to.
    pub fn header(&self, name: &str) -> Option<String> {
        self.base.headers.get(name).and_then(HeaderValue::resolve)
    }

    pub fn meta(&self) -> Value {
        self.base.meta.clone().unwrap_or_else(|| json!({}))
    }

    pub(crate) fn base(&self) -> &Mapping {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetch;

    #[test]
    fn test_builtin_defaults() {
        let defaults = Defaults::new();
        let base = defaults.base();
        assert_eq!(base.method.as_deref(), Some("GET"));
        assert_eq!(base.credentials.as_deref(), Some("same-origin"));
        assert_eq!(base.redirect.as_deref(), Some("follow"));
        assert_eq!(base.mode.as_deref(), Some("cors"));
        assert_eq!(defaults.header("Accept").as_deref(), Some("application/json"));
        assert_eq!(defaults.header("Content-Type").as_deref(), Some("application/json"));
        assert_eq!(defaults.meta(), json!({}));
        assert!(!defaults.has_fetch());
    }

    #[test]
    fn test_layers_chain_and_later_wins() {
        let defaults = Defaults::new()
            .with(Mapping::new().header("X-Client", "one").meta(json!({ "layer": 1 })))
            .with(Mapping::new().header("X-Client", "two").credentials("include"));

        assert_eq!(defaults.header("X-Client").as_deref(), Some("two"));
        assert_eq!(defaults.meta(), json!({ "layer": 1 }));
        assert_eq!(defaults.base().credentials.as_deref(), Some("include"));
        assert_eq!(defaults.header("Accept").as_deref(), Some("application/json"));
    }

    #[test]
    fn test_layer_can_unset_builtin_header() {
        let defaults = Defaults::new().with(Mapping::new().drop_header("Content-Type"));
        assert_eq!(defaults.header("Content-Type"), None);
    }

    #[test]
    fn test_layer_ignores_source() {
        let defaults = Defaults::new().with(Mapping::new().url("/should/not/stick").value(1));
        assert!(defaults.base().url.is_none());
        assert!(defaults.base().value.is_none());
    }

    #[test]
    fn test_layer_carries_continuations() {
        let defaults = Defaults::new().with(
            Mapping::new()
                .then(|_, _| None)
                .catch(|_, _| None)
                .and_then(|_, _| crate::Specs::new())
                .and_catch(|_, _| crate::Specs::new()),
        );
        let base = defaults.base();
        assert!(base.then.is_some());
        assert!(base.catch.is_some());
        assert!(base.and_then.is_some());
        assert!(base.and_catch.is_some());
    }

    #[test]
    fn test_mapping_handlers_take_precedence() {
        let defaults = Defaults::new().with(Mapping::new().then(|_, _| Some("/from/defaults".into())));
        let own = Mapping::new().then(|_, _| Some("/from/mapping".into()));

        let layered = own.layered_over(defaults.base());
        let then = layered.then.unwrap();
        match then(&json!(null), &json!({})) {
            Some(crate::Spec::Url(url)) => assert_eq!(url, "/from/mapping"),
            other => panic!("Expected the mapping's own url, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_installs_executor() {
        let defaults = Defaults::new().fetch(MockFetch::new());
        assert!(defaults.has_fetch());
    }
}
