//! Immutable lifecycle snapshots of one asynchronous operation.
//!
//! A [`PromiseState`] is what callers observe for every name. It never
//! changes in place: each transition builds a new cell.
//!
//! ```text
//!            create()                 resolve() / reject()
//!   (none) ───────────► pending ──────────────────────────► fulfilled | rejected
//!                          ▲                                       │
//!                          │ refresh(None)                         │ refresh(Some(prev))
//!                          │                                       ▼
//!                          └──────────────────────  fulfilled + refreshing (value kept)
//! ```
//!
//! # Invariants
//!
//! - Exactly one of `pending`, `fulfilled`, `rejected` holds.
//! - `settled == fulfilled || rejected`.
//! - `refreshing` may accompany any of the three.
//! - `value` is present iff fulfilled, `reason` iff rejected.
//!
//! # Example
//!
//! ```ignore
//! use refetch::{PromiseState, Step};
//! use serde_json::json;
//!
//! let cell = PromiseState::resolve(json!("v"), json!({}));
//! let wrapped = cell
//!     .then(|v, _| Step::Value(json!(format!("F[{}]", v.as_str().unwrap_or_default()))));
//! assert_eq!(wrapped.value(), Some(&json!("F[v]")));
//! ```

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{Map, Value};

use crate::error::{RefetchError, Rejection};

#[derive(Debug, Clone, PartialEq)]
enum Status<T> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection),
}

/// Immutable snapshot of one named asynchronous operation's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PromiseState<T = Value> {
    status: Status<T>,
    refreshing: bool,
    meta: Value,
}

/// The result of a continuation handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T = Value> {
    /// A plain value, wrapped as a fulfilled cell carrying the original meta.
    Value(T),
    /// A cell, adopted as-is.
    State(PromiseState<T>),
}

fn meta_or_default(meta: Value) -> Value {
    if meta.is_null() {
        Value::Object(Map::new())
    } else {
        meta
    }
}

impl<T> PromiseState<T> {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// A pending cell. A `null` meta is replaced by `{}`.
    pub fn create(meta: Value) -> Self {
        Self {
            status: Status::Pending,
            refreshing: false,
            meta: meta_or_default(meta),
        }
    }

    /// A fulfilled cell.
    pub fn resolve(value: T, meta: Value) -> Self {
        Self {
            status: Status::Fulfilled(value),
            refreshing: false,
            meta: meta_or_default(meta),
        }
    }

    /// A rejected cell.
    pub fn reject(reason: impl Into<Rejection>, meta: Value) -> Self {
        Self {
            status: Status::Rejected(reason.into()),
            refreshing: false,
            meta: meta_or_default(meta),
        }
    }

    /// Absorb an existing cell.
    ///
    /// A settled cell is returned unchanged. Resolving with a cell that has
    /// not settled yet is a programmer error.
    pub fn adopt(cell: PromiseState<T>) -> Result<Self, RefetchError> {
        if cell.is_settled() {
            Ok(cell)
        } else {
            Err(RefetchError::UnsettledResolve)
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_pending(&self) -> bool {
        matches!(self.status, Status::Pending)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.status, Status::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.status, Status::Rejected(_))
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// The value, present iff fulfilled.
    pub fn value(&self) -> Option<&T> {
        match &self.status {
            Status::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    /// The rejection reason, present iff rejected.
    pub fn reason(&self) -> Option<&Rejection> {
        match &self.status {
            Status::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }
}

impl<T: Clone> PromiseState<T> {
    /// Start a renewal.
    ///
    /// With a previous cell, its state, value and meta are kept and
    /// `refreshing` is layered on top. Without one, this is a pending cell
    /// that is also refreshing.
    pub fn refresh(previous: Option<&PromiseState<T>>, meta: Value) -> Self {
        match previous {
            Some(prev) => Self {
                refreshing: true,
                ..prev.clone()
            },
            None => Self {
                refreshing: true,
                ..Self::create(meta)
            },
        }
    }

    /// Start a renewal whose retained value is optimistically transformed.
    ///
    /// The transform only runs when the previous cell is fulfilled.
    pub fn refresh_with<F>(previous: Option<&PromiseState<T>>, meta: Value, transform: F) -> Self
    where
        F: FnOnce(&T) -> T,
    {
        let mut next = Self::refresh(previous, meta);
        if let Status::Fulfilled(value) = &next.status {
            next.status = Status::Fulfilled(transform(value));
        }
        next
    }

    // =========================================================================
    // Combinators
    // =========================================================================

    /// Combine cells into one whose value is the ordered list of their values.
    ///
    /// Fulfilled only when every input is fulfilled (so `all([])` is
    /// fulfilled). Any rejected input makes the result rejected with the
    /// first reason in input order; otherwise any pending input keeps it
    /// pending. `refreshing` is set if any input is refreshing. The meta is
    /// the list of input metas.
    ///
    /// A cell holds exactly one status, so a rejected input wins over a
    /// pending one: the result is rejected and *not* pending, even though
    /// "pending if any input is pending" would also hold.
    pub fn all<'a, I>(cells: I) -> PromiseState<Vec<T>>
    where
        I: IntoIterator<Item = &'a PromiseState<T>>,
        T: 'a,
    {
        let mut values = Vec::new();
        let mut metas = Vec::new();
        let mut reason: Option<Rejection> = None;
        let mut pending = false;
        let mut refreshing = false;

        for cell in cells {
            refreshing |= cell.refreshing;
            metas.push(cell.meta.clone());
            match &cell.status {
                Status::Pending => pending = true,
                Status::Fulfilled(value) => values.push(value.clone()),
                Status::Rejected(r) => {
                    if reason.is_none() {
                        reason = Some(r.clone());
                    }
                }
            }
        }

        let status = match (reason, pending) {
            (Some(reason), _) => Status::Rejected(reason),
            (None, true) => Status::Pending,
            (None, false) => Status::Fulfilled(values),
        };

        PromiseState {
            status,
            refreshing,
            meta: Value::Array(metas),
        }
    }

    /// The first settled input in iteration order wins.
    ///
    /// `refreshing` is OR-ed across all inputs. With no settled input the
    /// result is pending with an empty meta; nothing is merged.
    pub fn race<'a, I>(cells: I) -> PromiseState<T>
    where
        I: IntoIterator<Item = &'a PromiseState<T>>,
        T: 'a,
    {
        let mut winner: Option<&PromiseState<T>> = None;
        let mut refreshing = false;

        for cell in cells {
            refreshing |= cell.refreshing;
            if winner.is_none() && cell.is_settled() {
                winner = Some(cell);
            }
        }

        match winner {
            Some(cell) => PromiseState {
                refreshing,
                ..cell.clone()
            },
            None => PromiseState {
                status: Status::Pending,
                refreshing,
                meta: Value::Object(Map::new()),
            },
        }
    }

    /// Map this cell through optional fulfillment and rejection handlers.
    ///
    /// Handlers receive the value (or reason) and the meta. Without a
    /// matching handler the cell is returned unchanged.
    pub fn continuation<F, R>(&self, on_fulfilled: Option<F>, on_rejected: Option<R>) -> Self
    where
        F: FnOnce(&T, &Value) -> Step<T>,
        R: FnOnce(&Rejection, &Value) -> Step<T>,
    {
        let step = match (&self.status, on_fulfilled, on_rejected) {
            (Status::Fulfilled(value), Some(f), _) => f(value, &self.meta),
            (Status::Rejected(reason), _, Some(r)) => r(reason, &self.meta),
            _ => return self.clone(),
        };

        match step {
            Step::Value(value) => Self::resolve(value, self.meta.clone()),
            Step::State(cell) => cell,
        }
    }

    /// Shorthand for a continuation with only a fulfillment handler.
    pub fn then<F>(&self, on_fulfilled: F) -> Self
    where
        F: FnOnce(&T, &Value) -> Step<T>,
    {
        self.continuation(Some(on_fulfilled), None::<fn(&Rejection, &Value) -> Step<T>>)
    }

    /// Shorthand for a continuation with only a rejection handler.
    pub fn catch<R>(&self, on_rejected: R) -> Self
    where
        R: FnOnce(&Rejection, &Value) -> Step<T>,
    {
        self.continuation(None::<fn(&T, &Value) -> Step<T>>, Some(on_rejected))
    }
}

impl<T> Default for PromiseState<T> {
    fn default() -> Self {
        Self::create(Value::Null)
    }
}

impl<T: Serialize> Serialize for PromiseState<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PromiseState", 8)?;
        s.serialize_field("pending", &self.is_pending())?;
        s.serialize_field("refreshing", &self.refreshing)?;
        s.serialize_field("fulfilled", &self.is_fulfilled())?;
        s.serialize_field("rejected", &self.is_rejected())?;
        s.serialize_field("settled", &self.is_settled())?;
        s.serialize_field("value", &self.value())?;
        s.serialize_field("reason", &self.reason())?;
        s.serialize_field("meta", &self.meta)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(v: &Value, _meta: &Value) -> Step {
        Step::Value(json!(format!("F[{}]", v.as_str().unwrap_or_default())))
    }

    #[test]
    fn test_create_is_pending_with_empty_meta() {
        let ps: PromiseState = PromiseState::create(Value::Null);
        assert!(ps.is_pending());
        assert!(!ps.is_settled());
        assert!(!ps.is_refreshing());
        assert!(ps.value().is_none());
        assert!(ps.reason().is_none());
        assert_eq!(ps.meta(), &json!({}));
    }

    #[test]
    fn test_resolve_and_reject() {
        let ok = PromiseState::resolve(json!(1), json!({ "tag": "a" }));
        assert!(ok.is_fulfilled() && ok.is_settled());
        assert_eq!(ok.value(), Some(&json!(1)));
        assert_eq!(ok.meta(), &json!({ "tag": "a" }));

        let err: PromiseState = PromiseState::reject("boom", Value::Null);
        assert!(err.is_rejected() && err.is_settled());
        assert_eq!(err.reason().map(|r| r.message.as_str()), Some("boom"));
        assert!(err.value().is_none());
    }

    #[test]
    fn test_adopt_settled_returns_cell_unchanged() {
        let cell = PromiseState::resolve(json!("x"), json!({ "m": 1 }));
        assert_eq!(PromiseState::adopt(cell.clone()), Ok(cell));
    }

    #[test]
    fn test_adopt_unsettled_is_fault() {
        let cell: PromiseState = PromiseState::create(Value::Null);
        assert_eq!(PromiseState::adopt(cell), Err(RefetchError::UnsettledResolve));
    }

    // =========================================================================
    // Refresh Tests
    // =========================================================================

    #[test]
    fn test_refresh_keeps_previous_value() {
        let prev = PromiseState::resolve(json!({ "T": "t" }), json!({ "m": 1 }));
        let next = PromiseState::refresh(Some(&prev), json!({ "other": true }));

        assert!(next.is_refreshing());
        assert!(next.is_fulfilled());
        assert_eq!(next.value(), Some(&json!({ "T": "t" })));
        assert_eq!(next.meta(), &json!({ "m": 1 }));
        assert!(!prev.is_refreshing(), "previous cell must not be mutated");
    }

    #[test]
    fn test_refresh_without_previous_is_pending_refreshing() {
        let ps: PromiseState = PromiseState::refresh(None, json!({ "m": 2 }));
        assert!(ps.is_pending());
        assert!(ps.is_refreshing());
        assert_eq!(ps.meta(), &json!({ "m": 2 }));
    }

    #[test]
    fn test_refresh_with_transforms_fulfilled_value() {
        let prev = PromiseState::resolve(json!(["a"]), Value::Null);
        let next = PromiseState::refresh_with(Some(&prev), Value::Null, |v| {
            let mut items = v.as_array().cloned().unwrap_or_default();
            items.push(json!("b"));
            Value::Array(items)
        });
        assert!(next.is_refreshing());
        assert_eq!(next.value(), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_refresh_with_skips_transform_when_rejected() {
        let prev: PromiseState = PromiseState::reject("nope", Value::Null);
        let next = PromiseState::refresh_with(Some(&prev), Value::Null, |_| panic!("not called"));
        assert!(next.is_rejected());
        assert!(next.is_refreshing());
    }

    // =========================================================================
    // All / Race Tests
    // =========================================================================

    #[test]
    fn test_all_fulfilled_collects_values() {
        let a = PromiseState::resolve(json!(1), json!({ "a": 1 }));
        let b = PromiseState::resolve(json!(2), json!({ "b": 2 }));
        let all = PromiseState::all([&a, &b]);

        assert!(all.is_fulfilled());
        assert_eq!(all.value(), Some(&vec![json!(1), json!(2)]));
        assert_eq!(all.meta(), &json!([{ "a": 1 }, { "b": 2 }]));
    }

    #[test]
    fn test_all_pending_if_any_pending() {
        let a: PromiseState = PromiseState::create(Value::Null);
        let b = PromiseState::resolve(json!("x"), Value::Null);
        let all = PromiseState::all([&a, &b]);

        assert!(all.is_pending());
        assert!(all.value().is_none());
    }

    #[test]
    fn test_all_empty_is_fulfilled() {
        let all = PromiseState::<Value>::all(std::iter::empty());
        assert!(all.is_fulfilled());
        assert_eq!(all.value(), Some(&Vec::new()));
        assert_eq!(all.meta(), &json!([]));
    }

    #[test]
    fn test_all_takes_first_reason_and_ors_refreshing() {
        let a = PromiseState::refresh(Some(&PromiseState::resolve(json!(1), Value::Null)), Value::Null);
        let b: PromiseState = PromiseState::reject("first", Value::Null);
        let c: PromiseState = PromiseState::reject("second", Value::Null);
        let d: PromiseState = PromiseState::create(Value::Null);
        let all = PromiseState::all([&a, &b, &c, &d]);

        assert!(all.is_rejected());
        assert!(all.is_refreshing());
        assert_eq!(all.reason().map(|r| r.message.as_str()), Some("first"));
    }

    #[test]
    fn test_all_rejected_and_pending_is_rejected_only() {
        let pending: PromiseState = PromiseState::create(Value::Null);
        let rejected: PromiseState = PromiseState::reject("down", Value::Null);

        for all in [
            PromiseState::all([&pending, &rejected]),
            PromiseState::all([&rejected, &pending]),
        ] {
            assert!(all.is_rejected());
            assert!(!all.is_pending());
            assert!(all.is_settled());
            assert!(!all.is_refreshing());
            assert_eq!(all.reason().map(|r| r.message.as_str()), Some("down"));
        }
    }

    #[test]
    fn test_race_first_settled_wins() {
        let a = PromiseState::resolve(json!("A"), Value::Null);
        let b = PromiseState::resolve(json!("B"), Value::Null);
        assert_eq!(PromiseState::race([&a, &b]).value(), Some(&json!("A")));
    }

    #[test]
    fn test_race_skips_pending() {
        let a: PromiseState = PromiseState::create(Value::Null);
        let b = PromiseState::resolve(json!("B"), json!({ "b": true }));
        let race = PromiseState::race([&a, &b]);
        assert_eq!(race.value(), Some(&json!("B")));
        assert_eq!(race.meta(), &json!({ "b": true }));
    }

    #[test]
    fn test_race_without_winner_is_pending() {
        let a: PromiseState = PromiseState::refresh(None, json!({ "a": 1 }));
        let b: PromiseState = PromiseState::create(json!({ "b": 1 }));
        let race = PromiseState::race([&a, &b]);

        assert!(race.is_pending());
        assert!(race.is_refreshing());
        assert!(race.value().is_none());
        assert!(race.reason().is_none());
        assert_eq!(race.meta(), &json!({}));
    }

    // =========================================================================
    // Continuation Tests
    // =========================================================================

    #[test]
    fn test_then_wraps_value_with_same_meta() {
        let cell = PromiseState::resolve(json!("v"), json!({ "m": 1 }));
        let next = cell.then(wrap);
        assert!(next.is_fulfilled());
        assert_eq!(next.value(), Some(&json!("F[v]")));
        assert_eq!(next.meta(), &json!({ "m": 1 }));
    }

    #[test]
    fn test_then_chains_compose() {
        let cell = PromiseState::resolve(json!("v"), Value::Null);
        assert_eq!(cell.then(wrap).then(wrap).value(), Some(&json!("F[F[v]]")));
    }

    #[test]
    fn test_then_adopts_returned_state() {
        let cell = PromiseState::resolve(json!("v"), Value::Null);
        let next = cell.then(|_, _| Step::State(PromiseState::reject("no", json!({ "x": 1 }))));
        assert!(next.is_rejected());
        assert_eq!(next.meta(), &json!({ "x": 1 }));
    }

    #[test]
    fn test_then_on_rejected_is_identity() {
        let cell: PromiseState = PromiseState::reject("r", Value::Null);
        assert_eq!(cell.then(wrap), cell);
    }

    #[test]
    fn test_catch_recovers_rejection() {
        let cell: PromiseState = PromiseState::reject("r", json!({ "m": 1 }));
        let next = cell.catch(|reason, _| Step::Value(json!(format!("R[{}]", reason.message))));
        assert!(next.is_fulfilled());
        assert_eq!(next.value(), Some(&json!("R[r]")));
        assert_eq!(next.meta(), &json!({ "m": 1 }));
    }

    #[test]
    fn test_continuation_without_handlers_is_identity() {
        let cell: PromiseState = PromiseState::create(Value::Null);
        let next = cell.continuation(
            None::<fn(&Value, &Value) -> Step>,
            None::<fn(&Rejection, &Value) -> Step>,
        );
        assert_eq!(next, cell);
    }

    #[test]
    fn test_serializes_all_flags() {
        let cell = PromiseState::refresh(Some(&PromiseState::resolve(json!(3), Value::Null)), Value::Null);
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(
            json,
            json!({
                "pending": false,
                "refreshing": true,
                "fulfilled": true,
                "rejected": false,
                "settled": true,
                "value": 3,
                "reason": null,
                "meta": {}
            })
        );
    }
}
