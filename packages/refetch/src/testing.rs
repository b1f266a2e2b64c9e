//! Testing utilities for refetch connections.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! refetch = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Scripted Responses with `MockFetch`
//!
//! ```ignore
//! use refetch::testing::{MockFetch, Reply};
//!
//! let fetch = MockFetch::new();
//! fetch.reply("/users/1", Reply::Json(200, json!({ "id": 1 })));
//! fetch.reply("/users/2", Reply::Json(404, json!({ "error": "no such user" })));
//!
//! let connection = Connection::builder().fetch(fetch.clone()).build()?;
//! ```
//!
//! Urls without a scripted reply answer `200 {"T":"t"}`.
//!
//! ## Controlling Completion Order with `Gate`
//!
//! ```ignore
//! let slow = fetch.hold("/a/1");          // requests to /a/1 now wait
//! connection.reconcile(Specs::new().with("item", "/a/1"))?;
//! connection.reconcile(Specs::new().with("item", "/a/2"))?;
//!
//! wait_for_state(&mut rx, "item", |s| s.is_fulfilled()).await;
//! slow.release();                         // /a/1 completes late
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};

use crate::connection::Props;
use crate::promise_state::PromiseState;
use crate::transport::{Fetch, Request, Response};

/// How long [`wait_for_state`] waits before panicking.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// MockFetch
// =============================================================================

/// A scripted reply for one url.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A JSON body with the given status.
    Json(u16, Value),
    /// No body.
    Empty(u16),
    /// An executor fault (network error).
    Fail(String),
    /// A response returned as-is.
    Raw(Response),
}

impl Reply {
    fn into_response(self) -> anyhow::Result<Response> {
        match self {
            Reply::Json(status, body) => Ok(Response::json(status, &body)),
            Reply::Empty(status) => Ok(Response::new(status)),
            Reply::Fail(message) => Err(anyhow!(message)),
            Reply::Raw(response) => Ok(response),
        }
    }
}

#[derive(Default)]
struct MockState {
    replies: HashMap<String, Reply>,
    gates: HashMap<String, Arc<Semaphore>>,
    calls: Vec<Request>,
}

/// An in-memory [`Fetch`] executor that records every request.
///
/// Clones share their script and call log.
#[derive(Clone, Default)]
pub struct MockFetch {
    state: Arc<Mutex<MockState>>,
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script the reply for `url`. Replaces any previous script.
    pub fn reply(&self, url: impl Into<String>, reply: Reply) -> &Self {
        self.lock().replies.insert(url.into(), reply);
        self
    }

    /// Hold every later request to `url` until the returned gate lets it
    /// through. Each [`Gate::release`] lets exactly one request complete.
    pub fn hold(&self, url: impl Into<String>) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.lock().gates.insert(url.into(), semaphore.clone());
        Gate { semaphore }
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<Request> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.lock().calls.iter().filter(|r| r.url == url).count()
    }

    /// Panics unless `url` was fetched exactly `expected` times.
    pub fn assert_calls_to(&self, url: &str, expected: usize) {
        let actual = self.calls_to(url);
        assert_eq!(
            actual, expected,
            "Expected {expected} request(s) to {url}, got {actual}: {:?}",
            self.calls().iter().map(|r| r.url.as_str()).collect::<Vec<_>>()
        );
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        let url = request.url.clone();
        let gate = {
            let mut state = self.lock();
            state.calls.push(request);
            state.gates.get(&url).cloned()
        };

        if let Some(gate) = gate {
            gate.acquire()
                .await
                .context("mock gate closed")?
                .forget();
        }

        let reply = self
            .lock()
            .replies
            .get(&url)
            .cloned()
            .unwrap_or_else(|| Reply::Json(200, json!({ "T": "t" })));
        reply.into_response()
    }
}

/// Releases requests held by [`MockFetch::hold`].
#[derive(Clone)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
}

impl Gate {
    /// Let one held request complete.
    pub fn release(&self) {
        self.semaphore.add_permits(1);
    }
}

// =============================================================================
// Waiting on Snapshots
// =============================================================================

/// Wait until the cell for `name` satisfies `predicate`, and return it.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`] or if the connection is dropped.
pub async fn wait_for_state<F>(
    rx: &mut watch::Receiver<Props>,
    name: &str,
    predicate: F,
) -> Arc<PromiseState>
where
    F: Fn(&PromiseState) -> bool,
{
    let found = tokio::time::timeout(
        WAIT_TIMEOUT,
        rx.wait_for(|props| {
            props
                .get(name)
                .and_then(|p| p.as_state())
                .is_some_and(|s| predicate(s))
        }),
    )
    .await
    .map(|r| r.map(|props| props.get(name).and_then(|p| p.as_state()).cloned()));

    match found {
        Ok(Ok(Some(state))) => state,
        Ok(Ok(None)) => panic!("cell {name} vanished"),
        Ok(Err(_)) => panic!("connection dropped while waiting for {name}"),
        Err(_) => panic!(
            "timed out waiting for {name}; last snapshot: {:?}",
            rx.borrow().get(name)
        ),
    }
}

/// Yield to the runtime until spawned completions have been posted.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Credentials, Mode, Redirect};
    use std::collections::BTreeMap;

    fn request(url: &str) -> Request {
        Request {
            url: url.to_string(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: None,
            credentials: Credentials::SameOrigin,
            redirect: Redirect::Follow,
            mode: Mode::Cors,
        }
    }

    #[tokio::test]
    async fn test_default_reply() {
        let fetch = MockFetch::new();
        let response = fetch.fetch(request("/x")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({ "T": "t" }).to_string());
        fetch.assert_calls_to("/x", 1);
    }

    #[tokio::test]
    async fn test_scripted_fail() {
        let fetch = MockFetch::new();
        fetch.reply("/x", Reply::Fail("boom".into()));
        let err = fetch.fetch(request("/x")).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_gate_holds_until_released() {
        let fetch = MockFetch::new();
        let gate = fetch.hold("/slow");

        let f = fetch.clone();
        let task = tokio::spawn(async move { f.fetch(request("/slow")).await });
        settle().await;
        assert!(!task.is_finished());
        assert_eq!(fetch.call_count(), 1);

        gate.release();
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
    }
}
