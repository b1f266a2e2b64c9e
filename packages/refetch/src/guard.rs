//! Stale-result suppression and refresh timer ownership.
//!
//! Every dispatch is stamped with a fresh [`StartedAt`]. Completions carry
//! the stamp they were dispatched with and are checked before anything is
//! committed, continued or scheduled:
//!
//! ```text
//!   dispatch A (seq 1) ─────────────────────────────► completes late
//!   dispatch B (seq 2) ───────► completes                    │
//!                                  │                         ▼
//!                          record.seq == 2 ✓          record.seq == 2 ✗ (discarded)
//! ```
//!
//! The [`Record`] for a name owns its refresh timer. Replacing or dropping a
//! record aborts the timer.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

use crate::descriptor::Descriptor;

/// A dispatch stamp.
///
/// Ordered and compared by sequence number only; the wall-clock time is
/// kept for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct StartedAt {
    pub seq: u64,
    pub at: DateTime<Utc>,
}

impl PartialEq for StartedAt {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for StartedAt {}

impl PartialOrd for StartedAt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StartedAt {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl fmt::Display for StartedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.seq, self.at.format("%H:%M:%S%.3f"))
    }
}

/// Mints strictly increasing stamps.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    next: u64,
}

impl Clock {
    pub(crate) fn mint(&mut self) -> StartedAt {
        self.next += 1;
        StartedAt {
            seq: self.next,
            at: Utc::now(),
        }
    }
}

/// The per-name execution record.
pub(crate) struct Record {
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) started_at: StartedAt,
    refresh: Option<AbortHandle>,
}

impl Record {
    pub(crate) fn new(descriptor: Arc<Descriptor>, started_at: StartedAt) -> Self {
        Self {
            descriptor,
            started_at,
            refresh: None,
        }
    }

    /// Install a refresh timer, aborting any previous one.
    pub(crate) fn schedule(&mut self, handle: AbortHandle) {
        if let Some(old) = self.refresh.replace(handle) {
            old.abort();
        }
    }

    /// Take the timer out without aborting it (it is the one firing).
    pub(crate) fn take_refresh(&mut self) -> Option<AbortHandle> {
        self.refresh.take()
    }

    pub(crate) fn cancel_refresh(&mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_refresh_scheduled(&self) -> bool {
        self.refresh.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        self.cancel_refresh();
    }
}

/// What the guard decided about a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Current,
    /// A newer dispatch superseded it.
    Stale,
    /// The name no longer has a record (it became a trigger).
    Unknown,
    TornDown,
}

/// Check a completion's stamp against the name's current record.
pub(crate) fn check(torn_down: bool, record: Option<&Record>, started_at: StartedAt) -> Verdict {
    if torn_down {
        return Verdict::TornDown;
    }
    match record {
        None => Verdict::Unknown,
        Some(record) if record.started_at == started_at => Verdict::Current,
        Some(_) => Verdict::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::Defaults;
    use crate::descriptor::Normalized;
    use crate::mapping::Mapping;
    use std::time::Duration;

    fn descriptor() -> Arc<Descriptor> {
        match Descriptor::normalize("x", Mapping::new().value(1).into(), &Defaults::new()).unwrap() {
            Normalized::Concrete(d) => Arc::new(d),
            Normalized::Deferred(_) => panic!("Expected a concrete descriptor"),
        }
    }

    #[test]
    fn test_clock_is_strictly_monotonic() {
        let mut clock = Clock::default();
        let a = clock.mint();
        let b = clock.mint();
        let c = clock.mint();
        assert!(a < b && b < c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_started_at_ignores_wall_clock() {
        let now = Utc::now();
        let a = StartedAt { seq: 3, at: now };
        let b = StartedAt {
            seq: 3,
            at: now - chrono::Duration::seconds(10),
        };
        assert_eq!(a, b);
        assert!(StartedAt { seq: 2, at: now } < b);
    }

    #[test]
    fn test_check_verdicts() {
        let mut clock = Clock::default();
        let first = clock.mint();
        let second = clock.mint();
        let record = Record::new(descriptor(), second);

        assert_eq!(check(false, Some(&record), second), Verdict::Current);
        assert_eq!(check(false, Some(&record), first), Verdict::Stale);
        assert_eq!(check(false, None, second), Verdict::Unknown);
        assert_eq!(check(true, Some(&record), second), Verdict::TornDown);
    }

    #[tokio::test]
    async fn test_dropping_record_aborts_timer() {
        let timer = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        let mut record = Record::new(descriptor(), Clock::default().mint());
        record.schedule(timer.abort_handle());
        assert!(record.is_refresh_scheduled());

        drop(record);
        let err = timer.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_schedule_replaces_and_aborts_previous() {
        let first = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        let second = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        let mut record = Record::new(descriptor(), Clock::default().mint());

        record.schedule(first.abort_handle());
        record.schedule(second.abort_handle());
        assert!(first.await.unwrap_err().is_cancelled());

        let taken = record.take_refresh().unwrap();
        assert!(!record.is_refresh_scheduled());
        drop(record);
        assert!(!taken.is_finished());
        taken.abort();
        assert!(second.await.unwrap_err().is_cancelled());
    }
}
