//! # Refetch
//!
//! Declarative, name-keyed reconciliation of asynchronous fetches into
//! immutable [`PromiseState`] cells.
//!
//! ## Core Concepts
//!
//! A caller describes, every time its inputs change, what should back each
//! name:
//! - a url (`"/users/1"`),
//! - a [`Mapping`] (a url or a value, plus options and continuations),
//! - a deferred trigger, called only on demand.
//!
//! The [`Connection`] decides per name whether the running operation is
//! still valid, starts new ones only when needed, and never lets an
//! out-of-order completion overwrite a newer result.
//!
//! ## Architecture
//!
//! ```text
//! Trigger source (input change)
//!     │
//!     ▼ reconcile(specs)
//! Descriptor::normalize ──► Defaults layered under each mapping
//!     │
//!     ▼ should_dispatch? (force | refreshing | !origin.equals(next))
//! Dispatch ──► StartedAt minted ──► pending / refreshing cell committed
//!     │
//!     ▼
//! pipeline::execute ──► BuildRequest ──► Fetch ──► HandleResponse
//!     │
//!     ▼ completion (carries its StartedAt)
//! Guard: stale or torn down? ──► discarded
//!     │
//!     ├─► then / catch ──► replacement under the same name and stamp
//!     ├─► commit resolve / reject ──► refresh timer (fulfilled, interval > 0)
//!     └─► and_then / and_catch ──► sibling specs, applied like a round
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Cells are immutable** - every transition builds a new cell
//! 2. **Rounds are atomic** - a configuration fault aborts the round before any change
//! 3. **Unchanged means untouched** - a no-op round keeps the same `Arc` and publishes nothing
//! 4. **The newest stamp wins** - a completion older than its name's record is discarded
//! 5. **Teardown fails closed** - after teardown no completion or timer changes anything
//!
//! ## Example
//!
//! ```ignore
//! use refetch::{Connection, Mapping, Spec, Specs};
//! use std::time::Duration;
//!
//! let connection = Connection::builder()
//!     .fetch(refetch_http::HttpFetch::new(config)?)
//!     .build()?;
//!
//! connection.reconcile(
//!     Specs::new()
//!         .with("user", format!("/users/{user_id}"))
//!         .with(
//!             "notifications",
//!             Mapping::new()
//!                 .url("/notifications")
//!                 .refresh_interval(Duration::from_secs(30)),
//!         )
//!         .with(
//!             "mark_read",
//!             Spec::deferred(|args| {
//!                 Specs::new().with(
//!                     "mark_read_response",
//!                     Mapping::new()
//!                         .url(format!("/notifications/{}", args[0]))
//!                         .method("PATCH")
//!                         .and_then(|_, _| {
//!                             Specs::new().with(
//!                                 "notifications",
//!                                 Mapping::new().url("/notifications").force(true),
//!                             )
//!                         }),
//!                 )
//!             }),
//!         ),
//! )?;
//!
//! connection.invoke("mark_read", &[json!(42)])?;
//! ```

mod connection;
mod defaults;
mod descriptor;
mod error;
mod guard;
mod mapping;
mod pipeline;
mod promise_state;
mod transport;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Result cells
pub use promise_state::{PromiseState, Step};

// Errors
pub use error::{RefetchError, Rejection};

// Raw inputs
pub use mapping::{
    AndCatchFn, AndThenFn, CatchFn, Deferred, HeaderValue, Identity, Mapping, PendingValue,
    Refreshing, Spec, Specs, ThenFn,
};

// Defaults
pub use defaults::Defaults;

// Normalized descriptors
pub use descriptor::{Descriptor, Normalized, Source, Transport};

// Transport collaborators
pub use transport::{
    is_valid_method, BuildRequest, Credentials, DefaultBuildRequest, Fetch, HandleResponse,
    JsonResponseHandler, Mode, Redirect, Request, RequestInit, Response,
};

// Execution
pub use pipeline::{execute, Completion, Execution};

// Reconciliation
pub use connection::{Connection, ConnectionBuilder, Prop, Props, Trigger};
pub use guard::StartedAt;

// Re-export async_trait for Fetch / HandleResponse implementors
pub use async_trait::async_trait;
