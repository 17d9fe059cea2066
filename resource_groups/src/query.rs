// Copyright 2026 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// The engine-facing contract of a submitted query. The execution engine owns the query's
/// lifecycle; groups hold a reference for bookkeeping and release it when the query reports a
/// terminal state.
///
pub trait ManagedQuery: Send + Sync + 'static {
    ///
    /// Begins execution. Idempotent, and must not panic: failures surface as a terminal state.
    ///
    fn start(&self);

    fn state(&self) -> QueryState;

    ///
    /// Registers a callback invoked on each subsequent state transition. The callback may be
    /// invoked from arbitrary threads, and must not be invoked synchronously by the registration
    /// itself: callers register while holding the tree lock, which the callback re-acquires.
    /// Duplicate terminal notifications are tolerated.
    ///
    fn add_state_change_listener(&self, listener: StateChangeListener);

    ///
    /// The query's current memory reservation in bytes. Read only while the owning tree's lock
    /// is held.
    ///
    fn total_memory_reservation(&self) -> u64;
}

pub type StateChangeListener = Box<dyn Fn(QueryState) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryState {
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Failed | QueryState::Canceled
        )
    }
}

///
/// A token that identifies one admitted query within its tree. Minted at admission, and never
/// reused for the tree's lifetime.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) struct QueryId(u64);

impl QueryId {
    pub(crate) fn initial() -> QueryId {
        QueryId(0)
    }

    pub(crate) fn next(self) -> QueryId {
        QueryId(self.0 + 1)
    }
}
