//! Turns a descriptor into an outcome.
//!
//! The pipeline keeps no state between calls. It decides how a descriptor's
//! value is obtained and hands back either a settled completion (ready
//! values) or a future to be driven by the connection:
//!
//! - `Identity::Ready` settles in the same round, so its pending cell is
//!   never observable.
//! - `Identity::Pending` / `Identity::Lazy` are awaited.
//! - `Source::Request` goes through `BuildRequest` → `Fetch` → `HandleResponse`.
//!   The serialized request is recorded in the meta as `request` and the
//!   response status and headers as `response`.
//!
//! Continuations, guard checks and timers are the connection's business.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use crate::descriptor::{Descriptor, Source};
use crate::error::Rejection;
use crate::mapping::Identity;

/// The outcome of one execution, with the meta it settled with.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub outcome: Result<Value, Rejection>,
    pub meta: Value,
}

impl Completion {
    pub fn fulfilled(value: Value, meta: Value) -> Self {
        Self {
            outcome: Ok(value),
            meta,
        }
    }

    pub fn rejected(reason: Rejection, meta: Value) -> Self {
        Self {
            outcome: Err(reason),
            meta,
        }
    }
}

pub enum Execution {
    Settled(Completion),
    InFlight(BoxFuture<'static, Completion>),
}

impl Execution {
    /// Drive the execution to its completion.
    pub async fn completion(self) -> Completion {
        match self {
            Execution::Settled(completion) => completion,
            Execution::InFlight(future) => future.await,
        }
    }
}

pub fn execute(descriptor: &Descriptor) -> Execution {
    let meta = descriptor.meta.clone();

    match &descriptor.source {
        Source::Value(Identity::Ready(value)) => {
            Execution::Settled(Completion::fulfilled(value.clone(), meta))
        }
        Source::Value(Identity::Pending(pending)) => {
            let outcome = pending.outcome();
            Execution::InFlight(
                async move {
                    Completion {
                        outcome: outcome.await,
                        meta,
                    }
                }
                .boxed(),
            )
        }
        Source::Value(Identity::Lazy(f)) => {
            let outcome = f();
            Execution::InFlight(
                async move {
                    Completion {
                        outcome: outcome.await,
                        meta,
                    }
                }
                .boxed(),
            )
        }
        Source::Request(init) => {
            let Some(fetch) = descriptor.transport.fetch.clone() else {
                return Execution::Settled(Completion::rejected(
                    Rejection::new(format!("no fetch executor for {}", init.url)),
                    meta,
                ));
            };
            let handler = descriptor.transport.handle_response.clone();
            let request = descriptor.transport.build_request.build(init);
            let meta = annotate(
                &meta,
                "request",
                serde_json::to_value(&request).unwrap_or(Value::Null),
            );

            Execution::InFlight(
                async move {
                    debug!(method = %request.method, url = %request.url, "fetching");

                    let response = match fetch.fetch(request).await {
                        Ok(response) => response,
                        Err(e) => return Completion::rejected(Rejection::from_error(&e), meta),
                    };
                    let meta = annotate(&meta, "response", response.summary());

                    match handler.handle(response).await {
                        Ok(value) => Completion::fulfilled(value.unwrap_or(Value::Null), meta),
                        Err(reason) => Completion::rejected(reason, meta),
                    }
                }
                .boxed(),
            )
        }
    }
}

/// Add `key` to an object meta. Non-object metas are left as they are.
fn annotate(meta: &Value, key: &str, value: Value) -> Value {
    let mut meta = meta.clone();
    if let Value::Object(map) = &mut meta {
        map.insert(key.to_string(), value);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::Defaults;
    use crate::descriptor::Normalized;
    use crate::mapping::{Mapping, PendingValue, Spec};
    use crate::testing::{MockFetch, Reply};
    use crate::transport::{BuildRequest, DefaultBuildRequest, RequestInit};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn descriptor(fetch: &MockFetch, spec: impl Into<Spec>) -> Descriptor {
        match Descriptor::normalize("x", spec.into(), &Defaults::new().fetch(fetch.clone())).unwrap() {
            Normalized::Concrete(d) => d,
            Normalized::Deferred(_) => panic!("Expected a concrete descriptor"),
        }
    }

    #[test]
    fn test_ready_value_settles_immediately() {
        let fetch = MockFetch::new();
        let d = descriptor(&fetch, Mapping::new().value(json!({ "a": 1 })).meta(json!({ "m": 1 })));
        match execute(&d) {
            Execution::Settled(c) => {
                assert_eq!(c.outcome, Ok(json!({ "a": 1 })));
                assert_eq!(c.meta, json!({ "m": 1 }));
            }
            Execution::InFlight(_) => panic!("Expected a settled execution"),
        }
        assert_eq!(fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_value_is_awaited() {
        let fetch = MockFetch::new();
        let d = descriptor(&fetch, Mapping::new().pending_value(PendingValue::new(async { Ok(json!(5)) })));
        let execution = execute(&d);
        assert!(matches!(execution, Execution::InFlight(_)));
        assert_eq!(execution.completion().await.outcome, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_lazy_value_runs_per_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetch = MockFetch::new();
        let d = descriptor(
            &fetch,
            Mapping::new()
                .lazy_value(move || {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!(n)) }
                })
                .comparison("k"),
        );

        assert_eq!(execute(&d).completion().await.outcome, Ok(json!(0)));
        assert_eq!(execute(&d).completion().await.outcome, Ok(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_records_request_and_response_meta() {
        let fetch = MockFetch::new();
        let d = descriptor(&fetch, Mapping::new().url("/a/1").meta(json!({ "tag": "t" })));

        let c = execute(&d).completion().await;
        assert_eq!(c.outcome, Ok(json!({ "T": "t" })));
        assert_eq!(c.meta["tag"], json!("t"));
        assert_eq!(c.meta["request"]["url"], json!("/a/1"));
        assert_eq!(c.meta["request"]["method"], json!("GET"));
        assert_eq!(c.meta["request"]["credentials"], json!("same-origin"));
        assert_eq!(c.meta["response"]["status"], json!(200));

        let calls = fetch.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].header("Accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_custom_build_request_is_used() {
        let fetch = MockFetch::new();
        let d = descriptor(
            &fetch,
            Mapping::new().url("/a/1").build_request(|init: &RequestInit| {
                let mut request = DefaultBuildRequest.build(init);
                request.url = format!("https://api.example.com{}", init.url);
                request
            }),
        );

        execute(&d).completion().await;
        assert_eq!(fetch.calls()[0].url, "https://api.example.com/a/1");
    }

    #[tokio::test]
    async fn test_no_content_fulfills_with_null() {
        let fetch = MockFetch::new();
        fetch.reply("/empty", Reply::Empty(204));
        let d = descriptor(&fetch, "/empty");
        assert_eq!(execute(&d).completion().await.outcome, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_executor_fault_becomes_rejection() {
        let fetch = MockFetch::new();
        fetch.reply("/down", Reply::Fail("connection refused".into()));
        let d = descriptor(&fetch, "/down");

        let c = execute(&d).completion().await;
        let reason = c.outcome.unwrap_err();
        assert!(reason.message.contains("connection refused"));
        assert!(c.meta.get("response").is_none());
        assert!(c.meta.get("request").is_some());
    }

    #[tokio::test]
    async fn test_error_status_becomes_rejection() {
        let fetch = MockFetch::new();
        fetch.reply("/missing", Reply::Json(404, json!({ "error": "no such item" })));
        let d = descriptor(&fetch, "/missing");

        let c = execute(&d).completion().await;
        let reason = c.outcome.unwrap_err();
        assert_eq!(reason.message, "no such item");
        assert_eq!(reason.status, Some(404));
        assert_eq!(c.meta["response"]["status"], json!(404));
    }

    #[test]
    fn test_annotate_skips_non_objects() {
        assert_eq!(annotate(&json!("tag"), "request", json!(1)), json!("tag"));
        assert_eq!(annotate(&json!({}), "request", json!(1)), json!({ "request": 1 }));
    }
}
