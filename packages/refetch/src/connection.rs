//! The reconciler: one connection owns the records and cells of a set of names.
//!
//! Every entry point (a round, a trigger invocation, a completion, a timer)
//! becomes a queue of explicit work items processed under the connection's
//! single lock:
//!
//! ```text
//! reconcile(specs) ──► normalize all ──► apply ──┐
//! invoke(name) ──► deferred(args) ──► (round) ───┤
//!                                                ▼
//!                                        ┌── VecDeque<Work> ◄───────────────┐
//!                                        │                                  │
//!     Dispatch ──► stamp, commit pending/refreshing ──► pipeline::execute   │
//!                                        │               │                  │
//!                                        │     Settled ──┴─► Settle ────────┤
//!                                        │     InFlight ─► task ─► post ────┤
//!                                        │                                  │
//!     Settle ──► guard ──► then? ──► Dispatch(Continue) ────────────────────┤
//!                          └─► commit ──► timer? ──► and_then? ──► FanOut ──┤
//!     Refresh (timer) ──► guard ──► Dispatch(renewal of chain root) ────────┘
//!                                        │
//!                                        ▼
//!                              publish snapshot (if dirty)
//! ```
//!
//! A round is atomic: every spec is normalized before anything changes, and
//! the snapshot is published once the queue has drained.
//!
//! # Usage
//!
//! ```ignore
//! use refetch::{Connection, Mapping, Specs};
//!
//! let connection = Connection::builder().fetch(HttpFetch::new(config)?).build()?;
//! let mut props = connection.subscribe();
//!
//! connection.reconcile(Specs::new().with("user", format!("/users/{id}")))?;
//!
//! props.changed().await?;
//! if let Some(user) = props.borrow().get("user").and_then(|p| p.as_state()) {
//!     println!("pending={} value={:?}", user.is_pending(), user.value());
//! }
//! ```
//!
//! # Callbacks
//!
//! `then`, `catch`, `and_then`, `and_catch`, deferred triggers and dynamic
//! headers run while the connection's lock is held. They must not call back
//! into the same connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::defaults::Defaults;
use crate::descriptor::{Descriptor, Normalized};
use crate::error::RefetchError;
use crate::guard::{self, Clock, Record, StartedAt, Verdict};
use crate::mapping::{Deferred, Refreshing, Spec, Specs};
use crate::pipeline::{self, Completion, Execution};
use crate::promise_state::PromiseState;
use crate::transport::Fetch;

// =============================================================================
// Props
// =============================================================================

/// A snapshot of every name a connection has seen.
pub type Props = BTreeMap<String, Prop>;

/// What a name currently exposes.
#[derive(Clone)]
pub enum Prop {
    State(Arc<PromiseState>),
    Trigger(Trigger),
}

impl Prop {
    pub fn as_state(&self) -> Option<&Arc<PromiseState>> {
        match self {
            Prop::State(state) => Some(state),
            Prop::Trigger(_) => None,
        }
    }

    pub fn as_trigger(&self) -> Option<&Trigger> {
        match self {
            Prop::Trigger(trigger) => Some(trigger),
            Prop::State(_) => None,
        }
    }
}

impl fmt::Debug for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prop::State(state) => f.debug_tuple("State").field(state).finish(),
            Prop::Trigger(trigger) => f.debug_tuple("Trigger").field(&trigger.name).finish(),
        }
    }
}

/// A callable bound to a deferred name.
///
/// Holds the connection weakly; invoking it after the connection is gone
/// or torn down fails with [`RefetchError::TornDown`].
#[derive(Clone)]
pub struct Trigger {
    name: String,
    shared: Weak<Shared>,
}

impl Trigger {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the deferred function and run the specs it returns as a round.
    pub fn invoke(&self, args: &[Value]) -> Result<(), RefetchError> {
        let shared = self.shared.upgrade().ok_or(RefetchError::TornDown)?;
        shared.invoke(&self.name, args)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").field("name", &self.name).finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    defaults: Defaults,
    fetch: Option<Arc<dyn Fetch>>,
    runtime: Option<Handle>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            defaults: Defaults::new(),
            fetch: None,
            runtime: None,
        }
    }

    pub fn defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// The fetch executor for url mappings that name none.
    pub fn fetch(mut self, fetch: impl Fetch + 'static) -> Self {
        self.fetch = Some(Arc::new(fetch));
        self
    }

    /// Run in-flight work on `handle` instead of the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the connection.
    ///
    /// Fails with [`RefetchError::NoRuntime`] outside of a tokio runtime
    /// unless one was given with [`runtime`](ConnectionBuilder::runtime).
    pub fn build(self) -> Result<Connection, RefetchError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| RefetchError::NoRuntime)?,
        };
        let defaults = match self.fetch {
            Some(fetch) => self.defaults.fetch_arc(fetch),
            None => self.defaults,
        };
        let (props_tx, _) = watch::channel(Props::new());

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            defaults,
            runtime,
            state: Mutex::new(State::default()),
            props_tx,
        });
        debug!(connection = %shared.id, "connection built");

        Ok(Connection { shared })
    }
}

// =============================================================================
// Connection
// =============================================================================

/// The reconciliation context for a set of names.
///
/// Dropping the connection tears it down.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Run one round.
    ///
    /// Every spec is normalized first; a configuration fault in any of them
    /// aborts the round before anything changes.
    pub fn reconcile(&self, specs: Specs) -> Result<(), RefetchError> {
        self.shared.reconcile(specs)
    }

    /// Invoke the deferred trigger bound to `name`.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<(), RefetchError> {
        self.shared.invoke(name, args)
    }

    /// Stop every refresh timer and discard every later completion.
    ///
    /// Idempotent.
    pub fn teardown(&self) {
        self.shared.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.lock().torn_down
    }

    /// The current cell for `name`.
    pub fn state(&self, name: &str) -> Option<Arc<PromiseState>> {
        self.shared.lock().cells.get(name).cloned()
    }

    pub fn trigger(&self, name: &str) -> Option<Trigger> {
        let state = self.shared.lock();
        state.triggers.contains_key(name).then(|| Trigger {
            name: name.to_string(),
            shared: Arc::downgrade(&self.shared),
        })
    }

    pub fn props(&self) -> Props {
        let state = self.shared.lock();
        self.shared.snapshot(&state)
    }

    /// A receiver notified whenever a cell or trigger changes.
    pub fn subscribe(&self) -> watch::Receiver<Props> {
        self.shared.props_tx.subscribe()
    }

    pub fn started_at(&self, name: &str) -> Option<StartedAt> {
        self.shared.lock().records.get(name).map(|r| r.started_at)
    }

    /// The descriptor currently executing (or last executed) for `name`.
    pub fn descriptor(&self, name: &str) -> Option<Arc<Descriptor>> {
        self.shared
            .lock()
            .records
            .get(name)
            .map(|r| Arc::clone(&r.descriptor))
    }

    pub fn is_refresh_scheduled(&self, name: &str) -> bool {
        self.shared
            .lock()
            .records
            .get(name)
            .is_some_and(Record::is_refresh_scheduled)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared {
    id: Uuid,
    defaults: Defaults,
    runtime: Handle,
    state: Mutex<State>,
    props_tx: watch::Sender<Props>,
}

#[derive(Default)]
struct State {
    torn_down: bool,
    clock: Clock,
    records: HashMap<String, Record>,
    cells: BTreeMap<String, Arc<PromiseState>>,
    triggers: BTreeMap<String, Deferred>,
    dirty: bool,
}

enum Work {
    Dispatch {
        name: String,
        descriptor: Arc<Descriptor>,
        mode: DispatchMode,
    },
    Settle {
        name: String,
        started_at: StartedAt,
        completion: Completion,
    },
    Refresh {
        name: String,
        started_at: StartedAt,
    },
    FanOut {
        from: String,
        specs: Specs,
    },
}

enum DispatchMode {
    /// A new operation: mint a stamp and commit a pending or refreshing cell.
    Fresh,
    /// A `then` / `catch` replacement running under the parent's stamp.
    Continue(StartedAt),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(connection = %self.id, "connection state mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn reconcile(self: &Arc<Self>, specs: Specs) -> Result<(), RefetchError> {
        let mut state = self.lock();
        if state.torn_down {
            return Err(RefetchError::TornDown);
        }
        self.round(&mut state, specs)
    }

    fn invoke(self: &Arc<Self>, name: &str, args: &[Value]) -> Result<(), RefetchError> {
        let mut state = self.lock();
        if state.torn_down {
            return Err(RefetchError::TornDown);
        }
        let deferred = state
            .triggers
            .get(name)
            .cloned()
            .ok_or_else(|| RefetchError::UnknownTrigger {
                name: name.to_string(),
            })?;

        debug!(connection = %self.id, name, "invoking trigger");
        let specs = deferred.call(args);
        self.round(&mut state, specs)
    }

    fn round(self: &Arc<Self>, state: &mut State, specs: Specs) -> Result<(), RefetchError> {
        let normalized = specs
            .into_iter()
            .map(|(name, spec)| Descriptor::normalize(&name, spec, &self.defaults).map(|n| (name, n)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut queue = VecDeque::new();
        for (name, normalized) in normalized {
            self.apply(state, name, normalized, &mut queue);
        }
        self.run(state, queue);
        Ok(())
    }

    /// Post a completion or timer firing from a spawned task.
    fn post(self: &Arc<Self>, work: Work) {
        let mut state = self.lock();
        self.run(&mut state, VecDeque::from([work]));
    }

    fn teardown(&self) {
        let mut state = self.lock();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        for record in state.records.values_mut() {
            record.cancel_refresh();
        }
        debug!(connection = %self.id, "connection torn down");
    }

    // =========================================================================
    // Work Loop
    // =========================================================================

    fn run(self: &Arc<Self>, state: &mut State, mut queue: VecDeque<Work>) {
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Dispatch {
                    name,
                    descriptor,
                    mode,
                } => self.dispatch(state, name, descriptor, mode, &mut queue),
                Work::Settle {
                    name,
                    started_at,
                    completion,
                } => self.settle(state, name, started_at, completion, &mut queue),
                Work::Refresh { name, started_at } => {
                    self.refresh(state, name, started_at, &mut queue)
                }
                Work::FanOut { from, specs } => self.fan_out(state, &from, specs, &mut queue),
            }
        }
        self.publish(state);
    }

    /// Decide what a normalized spec does to its name.
    fn apply(&self, state: &mut State, name: String, normalized: Normalized, queue: &mut VecDeque<Work>) {
        match normalized {
            Normalized::Deferred(deferred) => {
                // Dropping the record aborts its timer; its in-flight results
                // find no record and are discarded.
                if state.records.remove(&name).is_some() {
                    debug!(connection = %self.id, name = %name, "trigger supersedes mapping");
                }
                let removed_cell = state.cells.remove(&name).is_some();
                let replaced = state.triggers.insert(name, deferred).is_some();
                if removed_cell || !replaced {
                    state.dirty = true;
                }
            }
            Normalized::Concrete(descriptor) => {
                if state.triggers.remove(&name).is_some() {
                    state.dirty = true;
                }
                let previous = state.records.get(&name).map(|r| r.descriptor.as_ref());
                if descriptor.should_dispatch(previous) {
                    queue.push_back(Work::Dispatch {
                        name,
                        descriptor: Arc::new(descriptor),
                        mode: DispatchMode::Fresh,
                    });
                } else {
                    trace!(connection = %self.id, name = %name, "unchanged");
                }
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        state: &mut State,
        name: String,
        descriptor: Arc<Descriptor>,
        mode: DispatchMode,
        queue: &mut VecDeque<Work>,
    ) {
        let started_at = match mode {
            DispatchMode::Fresh => {
                let started_at = state.clock.mint();
                let previous = state.cells.get(&name).map(Arc::as_ref);
                let meta = descriptor.meta.clone();
                let cell = match &descriptor.refreshing {
                    Refreshing::Off => PromiseState::create(meta),
                    Refreshing::On => PromiseState::refresh(previous, meta),
                    Refreshing::Transform(transform) => {
                        PromiseState::refresh_with(previous, meta, |v| transform(v))
                    }
                };

                // Replacing the record drops the previous one, aborting its timer.
                state
                    .records
                    .insert(name.clone(), Record::new(Arc::clone(&descriptor), started_at));
                self.commit(state, &name, cell);
                debug!(connection = %self.id, name = %name, started_at = %started_at, "dispatching");
                started_at
            }
            DispatchMode::Continue(started_at) => {
                match state.records.get_mut(&name) {
                    Some(record) if record.started_at == started_at => {
                        record.descriptor = Arc::clone(&descriptor);
                    }
                    _ => {
                        trace!(connection = %self.id, name = %name, started_at = %started_at, "discarding stale continuation");
                        return;
                    }
                }
                debug!(connection = %self.id, name = %name, started_at = %started_at, "continuing");
                started_at
            }
        };

        match pipeline::execute(&descriptor) {
            Execution::Settled(completion) => queue.push_back(Work::Settle {
                name,
                started_at,
                completion,
            }),
            Execution::InFlight(future) => {
                let weak = Arc::downgrade(self);
                self.runtime.spawn(async move {
                    let completion = future.await;
                    if let Some(shared) = weak.upgrade() {
                        shared.post(Work::Settle {
                            name,
                            started_at,
                            completion,
                        });
                    }
                });
            }
        }
    }

    fn settle(
        self: &Arc<Self>,
        state: &mut State,
        name: String,
        started_at: StartedAt,
        completion: Completion,
        queue: &mut VecDeque<Work>,
    ) {
        let descriptor = match guard::check(state.torn_down, state.records.get(&name), started_at) {
            Verdict::Current => match state.records.get(&name) {
                Some(record) => Arc::clone(&record.descriptor),
                None => return,
            },
            verdict => {
                trace!(connection = %self.id, name = %name, started_at = %started_at, ?verdict, "discarding completion");
                return;
            }
        };

        let Completion { outcome, meta } = completion;
        match outcome {
            Ok(value) => {
                if let Some(spec) = descriptor.then.as_ref().and_then(|then| then(&value, &meta)) {
                    self.continue_with(state, name, spec, &descriptor, started_at, meta, queue);
                    return;
                }

                debug!(connection = %self.id, name = %name, started_at = %started_at, "fulfilled");
                self.commit(state, &name, PromiseState::resolve(value.clone(), meta.clone()));

                // A `then` chain commits here, so the root's interval still applies.
                let interval = descriptor.renewal_target().refresh_interval;
                if !interval.is_zero() {
                    self.schedule_refresh(state, &name, started_at, interval);
                }
                if let Some(and_then) = &descriptor.and_then {
                    let specs = and_then(&value, &meta);
                    queue.push_back(Work::FanOut { from: name, specs });
                }
            }
            Err(reason) => {
                if let Some(spec) = descriptor.catch.as_ref().and_then(|catch| catch(&reason, &meta)) {
                    self.continue_with(state, name, spec, &descriptor, started_at, meta, queue);
                    return;
                }

                debug!(connection = %self.id, name = %name, started_at = %started_at, reason = %reason, "rejected");
                self.commit(state, &name, PromiseState::reject(reason.clone(), meta.clone()));

                if let Some(and_catch) = &descriptor.and_catch {
                    let specs = and_catch(&reason, &meta);
                    queue.push_back(Work::FanOut { from: name, specs });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn continue_with(
        &self,
        state: &mut State,
        name: String,
        spec: Spec,
        parent: &Arc<Descriptor>,
        started_at: StartedAt,
        meta: Value,
        queue: &mut VecDeque<Work>,
    ) {
        match Descriptor::normalize_continuation(&name, spec, parent, &self.defaults) {
            Ok(next) => queue.push_back(Work::Dispatch {
                name,
                descriptor: Arc::new(next),
                mode: DispatchMode::Continue(started_at),
            }),
            Err(e) => {
                error!(connection = %self.id, name = %name, error = %e, "continuation rejected");
                self.commit(state, &name, PromiseState::reject(e, meta));
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, state: &mut State, name: &str, started_at: StartedAt, interval: Duration) {
        let weak = Arc::downgrade(self);
        let timer_name = name.to_string();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(shared) = weak.upgrade() {
                shared.post(Work::Refresh {
                    name: timer_name,
                    started_at,
                });
            }
        });

        if let Some(record) = state.records.get_mut(name) {
            record.schedule(timer.abort_handle());
            trace!(connection = %self.id, name, ?interval, "refresh scheduled");
        } else {
            timer.abort();
        }
    }

    fn refresh(&self, state: &mut State, name: String, started_at: StartedAt, queue: &mut VecDeque<Work>) {
        let verdict = guard::check(state.torn_down, state.records.get(&name), started_at);
        let record = match (verdict, state.records.get_mut(&name)) {
            (Verdict::Current, Some(record)) => record,
            (verdict, _) => {
                trace!(connection = %self.id, name = %name, started_at = %started_at, ?verdict, "discarding refresh");
                return;
            }
        };

        // The firing timer must not be aborted by the re-dispatch.
        let _ = record.take_refresh();
        let renewal = Arc::new(record.descriptor.renewal_target().renewal());
        debug!(connection = %self.id, name = %name, "renewing");
        queue.push_back(Work::Dispatch {
            name,
            descriptor: renewal,
            mode: DispatchMode::Fresh,
        });
    }

    fn fan_out(&self, state: &mut State, from: &str, specs: Specs, queue: &mut VecDeque<Work>) {
        for (name, spec) in specs {
            match Descriptor::normalize(&name, spec, &self.defaults) {
                Ok(normalized) => self.apply(state, name, normalized, queue),
                Err(e) => {
                    error!(connection = %self.id, from, name = %name, error = %e, "skipping sibling mapping");
                }
            }
        }
    }

    // =========================================================================
    // Cells
    // =========================================================================

    fn commit(&self, state: &mut State, name: &str, cell: PromiseState) {
        state.cells.insert(name.to_string(), Arc::new(cell));
        state.dirty = true;
    }

    fn snapshot(self: &Arc<Self>, state: &State) -> Props {
        let mut props: Props = state
            .cells
            .iter()
            .map(|(name, cell)| (name.clone(), Prop::State(Arc::clone(cell))))
            .collect();
        for name in state.triggers.keys() {
            props.insert(
                name.clone(),
                Prop::Trigger(Trigger {
                    name: name.clone(),
                    shared: Arc::downgrade(self),
                }),
            );
        }
        props
    }

    fn publish(self: &Arc<Self>, state: &mut State) {
        if !state.dirty {
            return;
        }
        state.dirty = false;
        let props = self.snapshot(state);
        self.props_tx.send_replace(props);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use crate::testing::{wait_for_state, MockFetch, Reply};
    use serde_json::json;

    fn connection(fetch: &MockFetch) -> Connection {
        Connection::builder().fetch(fetch.clone()).build().unwrap()
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = Connection::builder().build().unwrap_err();
        assert_eq!(err, RefetchError::NoRuntime);
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let connection = Connection::builder()
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();
        connection
            .reconcile(Specs::new().with("n", Mapping::new().value(1)))
            .unwrap();
        assert_eq!(connection.state("n").unwrap().value(), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_ready_value_commits_in_the_same_round() {
        let connection = connection(&MockFetch::new());
        let mut rx = connection.subscribe();

        connection
            .reconcile(Specs::new().with("n", Mapping::new().value(json!([1, 2]))))
            .unwrap();

        let cell = connection.state("n").unwrap();
        assert!(cell.is_fulfilled());
        assert_eq!(cell.value(), Some(&json!([1, 2])));

        // One publication, never showing the pending cell
        assert!(rx.has_changed().unwrap());
        let props = rx.borrow_and_update().clone();
        assert!(props["n"].as_state().unwrap().is_fulfilled());
    }

    #[tokio::test]
    async fn test_fetch_goes_pending_then_fulfilled() {
        let fetch = MockFetch::new();
        let connection = connection(&fetch);
        let mut rx = connection.subscribe();

        connection.reconcile(Specs::new().with("item", "/a/1")).unwrap();
        assert!(connection.state("item").unwrap().is_pending());

        let cell = wait_for_state(&mut rx, "item", |s| s.is_fulfilled()).await;
        assert_eq!(cell.value(), Some(&json!({ "T": "t" })));
        assert_eq!(fetch.calls_to("/a/1"), 1);
    }

    #[tokio::test]
    async fn test_configuration_fault_aborts_whole_round() {
        let fetch = MockFetch::new();
        let connection = connection(&fetch);

        let err = connection
            .reconcile(
                Specs::new()
                    .with("good", "/a/1")
                    .with("bad", Mapping::new().url("/b").value(1)),
            )
            .unwrap_err();

        assert_eq!(err, RefetchError::ConflictingSource { name: "bad".into() });
        assert!(connection.state("good").is_none());
        assert!(connection.props().is_empty());
        assert_eq!(fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_round_keeps_cell_identity() {
        let connection = connection(&MockFetch::new());
        connection
            .reconcile(Specs::new().with("n", Mapping::new().value(1)))
            .unwrap();
        let first = connection.state("n").unwrap();
        let stamp = connection.started_at("n").unwrap();

        let mut rx = connection.subscribe();
        rx.borrow_and_update();
        connection
            .reconcile(Specs::new().with("n", Mapping::new().value(1)))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &connection.state("n").unwrap()));
        assert_eq!(connection.started_at("n").unwrap(), stamp);
        assert!(!rx.has_changed().unwrap(), "no-op round must not publish");
    }

    #[tokio::test]
    async fn test_invoke_unknown_trigger() {
        let connection = connection(&MockFetch::new());
        let err = connection.invoke("nope", &[]).unwrap_err();
        assert_eq!(err, RefetchError::UnknownTrigger { name: "nope".into() });
    }

    #[tokio::test]
    async fn test_teardown_rejects_new_rounds() {
        let connection = connection(&MockFetch::new());
        connection.teardown();
        connection.teardown();
        assert!(connection.is_torn_down());
        assert_eq!(
            connection.reconcile(Specs::new().with("n", Mapping::new().value(1))),
            Err(RefetchError::TornDown)
        );
    }

    #[tokio::test]
    async fn test_trigger_outlives_connection_safely() {
        let connection = connection(&MockFetch::new());
        connection
            .reconcile(Specs::new().with("go", Spec::deferred(|_| Specs::new())))
            .unwrap();
        let trigger = connection.trigger("go").unwrap();
        assert_eq!(trigger.name(), "go");

        drop(connection);
        assert_eq!(trigger.invoke(&[]), Err(RefetchError::TornDown));
    }

    #[tokio::test]
    async fn test_rejection_is_committed() {
        let fetch = MockFetch::new();
        fetch.reply("/err", Reply::Json(500, json!({ "message": "exploded" })));
        let connection = connection(&fetch);
        let mut rx = connection.subscribe();

        connection.reconcile(Specs::new().with("item", "/err")).unwrap();
        let cell = wait_for_state(&mut rx, "item", |s| s.is_rejected()).await;
        assert_eq!(cell.reason().unwrap().message, "exploded");
        assert_eq!(cell.meta()["response"]["status"], json!(500));
    }
}
