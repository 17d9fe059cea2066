// Copyright 2026 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod group;
mod id;
mod queue;
mod query;

pub use crate::group::GroupInfo;
pub use crate::id::ResourceGroupId;
pub use crate::query::{ManagedQuery, QueryState, StateChangeListener};
pub use crate::queue::FifoSet;

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use petgraph::dot;
use petgraph::graph::{DiGraph, NodeIndex};
use task_executor::Executor;
use tokio::time::sleep;

use crate::group::Group;
use crate::query::QueryId;

// 2^32 groups ought to be more than enough for anyone!
pub(crate) type GroupIndex = NodeIndex<u32>;

type GroupGraph = DiGraph<Group, (), u32>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupError {
    /// Queries may only be submitted to leaf groups.
    NotLeaf(ResourceGroupId),
    /// Sub-groups may not be created under a group that currently holds queries.
    HasQueries(ResourceGroupId),
    /// Group names must be non-empty.
    InvalidName,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::NotLeaf(id) => {
                write!(f, "cannot submit queries to {id}: it is not a leaf group")
            }
            GroupError::HasQueries(id) => {
                write!(f, "cannot create a sub-group of {id} while it has queries")
            }
            GroupError::InvalidName => write!(f, "group names must be non-empty"),
        }
    }
}

impl std::error::Error for GroupError {}

///
/// A handle to one group in an admission tree.
///
/// Handles are cheap to clone. All handles of a tree share a single lock, and every operation
/// holds it for its full duration: the tree's invariants (counter identities, eligibility
/// membership) span whole root-to-leaf spines, and there is no finer-grained locking.
/// Submitted query starts are handed to the tree's `Executor` and never awaited under the lock.
///
#[derive(Clone)]
pub struct ResourceGroup {
    inner: Arc<Mutex<InnerTree>>,
    executor: Executor,
    index: GroupIndex,
}

impl ResourceGroup {
    ///
    /// Creates a new one-group tree. The returned handle is the root: the only handle on which
    /// the driver entry points may be invoked.
    ///
    pub fn new_root(
        name: &str,
        max_running_queries: usize,
        max_queued_queries: usize,
        soft_memory_limit_bytes: u64,
        executor: Executor,
    ) -> Result<ResourceGroup, GroupError> {
        if name.is_empty() {
            return Err(GroupError::InvalidName);
        }
        let mut pg = GroupGraph::new();
        let root = pg.add_node(Group::new(
            ResourceGroupId::new_root(name),
            None,
            max_running_queries,
            max_queued_queries,
            soft_memory_limit_bytes,
        ));
        Ok(ResourceGroup {
            inner: Arc::new(Mutex::new(InnerTree {
                pg,
                root,
                queries: FnvHashMap::default(),
                next_query_id: QueryId::initial(),
            })),
            executor,
            index: root,
        })
    }

    pub fn id(&self) -> ResourceGroupId {
        self.inner.lock().pg[self.index].id.clone()
    }

    /// Returns a point-in-time snapshot of this group's limits, counts, and cached memory.
    pub fn info(&self) -> GroupInfo {
        self.inner.lock().pg[self.index].info()
    }

    ///
    /// Returns the named child, creating it if absent. A group may not acquire its first child
    /// while it holds queries: queries live only at leaves.
    ///
    /// If the child already exists it is returned as-is.
    /// TODO: the supplied limits are ignored in that case; decide whether reconfiguration
    /// should apply here or be rejected.
    ///
    pub fn get_or_create_sub_group(
        &self,
        name: &str,
        max_running_queries: usize,
        max_queued_queries: usize,
        soft_memory_limit_bytes: u64,
    ) -> Result<ResourceGroup, GroupError> {
        let mut inner = self.inner.lock();
        let index = inner.get_or_create_sub_group(
            self.index,
            name,
            max_running_queries,
            max_queued_queries,
            soft_memory_limit_bytes,
        )?;
        Ok(ResourceGroup {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            index,
        })
    }

    ///
    /// Attempts to admit a query to this leaf group: started immediately if every group on the
    /// path to the root has running headroom, queued here if every such group has queue
    /// headroom, and rejected with `Ok(false)` otherwise. Rejection is an expected outcome, not
    /// an error.
    ///
    /// The query's terminal state releases its slot, via the registered listener. A query that
    /// is already terminal when admitted is cleaned up before this method returns.
    ///
    pub fn add(&self, query: Arc<dyn ManagedQuery>) -> Result<bool, GroupError> {
        let mut inner = self.inner.lock();
        let query_id = match inner.admit(self.index, query.clone(), &self.executor)? {
            Some(query_id) => query_id,
            None => return Ok(false),
        };

        let weak = Arc::downgrade(&self.inner);
        let leaf = self.index;
        query.add_state_change_listener(Box::new(move |state| {
            if state.is_done() {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.lock().query_finished(leaf, query_id);
                }
            }
        }));
        // The query may have reached a terminal state before the listener was registered. The
        // completion path is idempotent, so run it once more.
        if query.state().is_done() {
            inner.query_finished(leaf, query_id);
        }
        Ok(true)
    }

    pub fn set_max_running_queries(&self, max_running_queries: usize) {
        self.inner
            .lock()
            .set_max_running_queries(self.index, max_running_queries);
    }

    pub fn set_max_queued_queries(&self, max_queued_queries: usize) {
        self.inner
            .lock()
            .set_max_queued_queries(self.index, max_queued_queries);
    }

    pub fn set_soft_memory_limit(&self, soft_memory_limit_bytes: u64) {
        self.inner
            .lock()
            .set_soft_memory_limit(self.index, soft_memory_limit_bytes);
    }

    ///
    /// One driver tick: refreshes memory statistics top-down, then starts queued queries until
    /// no eligible work remains. May only be invoked on the root handle. Concurrent ticks
    /// serialize on the tree lock.
    ///
    pub fn process_queued_queries(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(
            self.index, inner.root,
            "process_queued_queries may only be invoked on the root group"
        );
        inner.process_queued_queries(&self.executor);
    }

    ///
    /// Spawns a task on the tree's executor which runs a driver tick at the given interval.
    /// May only be invoked on the root handle.
    ///
    /// Uses a `Weak` reference to the tree, so the task exits once the last handle is dropped.
    ///
    pub fn spawn_driver(&self, interval: Duration) {
        {
            let inner = self.inner.lock();
            assert_eq!(
                self.index, inner.root,
                "spawn_driver may only be invoked on the root group"
            );
        }
        let _join = self.executor.native_spawn(Self::driver_task(
            Arc::downgrade(&self.inner),
            self.executor.clone(),
            interval,
        ));
    }

    async fn driver_task(inner: Weak<Mutex<InnerTree>>, executor: Executor, interval: Duration) {
        loop {
            sleep(interval).await;

            if let Some(inner) = Weak::upgrade(&inner) {
                inner.lock().process_queued_queries(&executor);
            } else {
                // The tree has been dropped.
                break;
            }
        }
    }

    /// Writes the tree in GraphViz DOT format, labelling each group with its subtree counts.
    pub fn visualize(&self, path: &Path) -> io::Result<()> {
        let inner = self.inner.lock();
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);

        let graph = inner.pg.filter_map(
            |_, group| {
                Some(format!(
                    "{}: {} running, {} queued",
                    group.id,
                    group.subtree_running_queries(),
                    group.subtree_queued_queries()
                ))
            },
            |_, _| Some(""),
        );

        f.write_all(
            format!(
                "{}",
                dot::Dot::with_config(&graph, &[dot::Config::EdgeNoLabel])
            )
            .as_bytes(),
        )?;

        Ok(())
    }
}

///
/// The tree itself: a petgraph arena of groups plus the handles of all live queries. Only ever
/// touched through the `Mutex` in `ResourceGroup`, which is what makes the `&mut self` methods
/// below safe to walk whole spines without further synchronization.
///
struct InnerTree {
    pg: GroupGraph,
    root: GroupIndex,
    // One entry per admitted, not-yet-terminal query.
    queries: FnvHashMap<QueryId, Arc<dyn ManagedQuery>>,
    next_query_id: QueryId,
}

impl InnerTree {
    fn get_or_create_sub_group(
        &mut self,
        parent: GroupIndex,
        name: &str,
        max_running_queries: usize,
        max_queued_queries: usize,
        soft_memory_limit_bytes: u64,
    ) -> Result<GroupIndex, GroupError> {
        if name.is_empty() {
            return Err(GroupError::InvalidName);
        }
        let parent_group = &self.pg[parent];
        if !parent_group.running_queries.is_empty() || !parent_group.queued_queries.is_empty() {
            return Err(GroupError::HasQueries(parent_group.id.clone()));
        }
        if let Some(&existing) = parent_group.sub_groups.get(name) {
            return Ok(existing);
        }

        let id = parent_group.id.child(name);
        let index = self.pg.add_node(Group::new(
            id,
            Some(parent),
            max_running_queries,
            max_queued_queries,
            soft_memory_limit_bytes,
        ));
        self.pg.add_edge(parent, index, ());
        self.pg[parent].sub_groups.insert(name.to_owned(), index);
        Ok(index)
    }

    ///
    /// Decides admission for a query submitted to the given leaf. A group's capacity gates its
    /// whole subtree, so both decisions conjoin the predicate over every group from the leaf up
    /// to the root. Returns the minted id, or None for rejection.
    ///
    fn admit(
        &mut self,
        index: GroupIndex,
        query: Arc<dyn ManagedQuery>,
        executor: &Executor,
    ) -> Result<Option<QueryId>, GroupError> {
        if !self.pg[index].is_leaf() {
            return Err(GroupError::NotLeaf(self.pg[index].id.clone()));
        }

        let mut can_queue = true;
        let mut can_run = true;
        let mut ancestor = Some(index);
        while let Some(current) = ancestor {
            let group = &self.pg[current];
            can_queue &= group.can_queue_more();
            can_run &= group.can_run_more();
            ancestor = group.parent;
        }
        if !can_queue && !can_run {
            log::debug!("rejecting query submitted to {}: at capacity", self.pg[index].id);
            return Ok(None);
        }

        let query_id = self.next_query_id;
        self.next_query_id = query_id.next();
        self.queries.insert(query_id, query);

        if can_run {
            self.start_in_background(index, query_id, executor);
        } else {
            self.enqueue(index, query_id);
        }
        Ok(Some(query_id))
    }

    fn enqueue(&mut self, index: GroupIndex, query_id: QueryId) {
        self.pg[index].queued_queries.add(query_id);
        let mut child = index;
        while let Some(parent) = self.pg[child].parent {
            self.pg[parent].descendant_queued_queries += 1;
            child = parent;
        }
        self.update_eligibility(index);
    }

    ///
    /// Moves the query into the leaf's running set, propagates counters and dirty flags up the
    /// spine, and hands the start action to the executor. The submission must not block on the
    /// started work: the lock is held here.
    ///
    fn start_in_background(&mut self, index: GroupIndex, query_id: QueryId, executor: &Executor) {
        log::trace!("starting query {query_id:?} in {}", self.pg[index].id);
        self.pg[index].running_queries.insert(query_id);
        let mut child = index;
        while let Some(parent) = self.pg[child].parent {
            let parent_group = &mut self.pg[parent];
            parent_group.descendant_running_queries += 1;
            parent_group.dirty_sub_groups.insert(child);
            child = parent;
        }
        self.update_eligibility(index);

        let query = self
            .queries
            .get(&query_id)
            .expect("admitted queries are registered until they finish")
            .clone();
        let _join = executor.native_spawn(async move { query.start() });
    }

    ///
    /// Re-derives membership of every group on the spine above `index` in its parent's eligible
    /// queue. The container's add/remove are idempotent, so repeated updates are safe and
    /// preserve the FIFO order of groups that stay eligible.
    ///
    fn update_eligibility(&mut self, mut index: GroupIndex) {
        while let Some(parent) = self.pg[index].parent {
            let eligible = self.pg[index].is_eligible();
            let parent_group = &mut self.pg[parent];
            if eligible {
                parent_group.eligible_sub_groups.add(index);
            } else {
                parent_group.eligible_sub_groups.remove(&index);
            }
            index = parent;
        }
    }

    ///
    /// Releases the query's slot in the given leaf. Idempotent: terminal notifications can be
    /// delivered more than once, and also race admission of an already-terminal query.
    ///
    fn query_finished(&mut self, index: GroupIndex, query_id: QueryId) {
        if self.pg[index].running_queries.remove(&query_id) {
            let mut child = index;
            while let Some(parent) = self.pg[child].parent {
                self.pg[parent].descendant_running_queries -= 1;
                child = parent;
            }
        } else if self.pg[index].queued_queries.remove(&query_id) {
            let mut child = index;
            while let Some(parent) = self.pg[child].parent {
                self.pg[parent].descendant_queued_queries -= 1;
                child = parent;
            }
        } else {
            // Already cleaned up. Dirty flags are pruned during the next refresh.
            return;
        }
        self.queries.remove(&query_id);
        self.update_eligibility(index);
    }

    fn set_max_running_queries(&mut self, index: GroupIndex, max_running_queries: usize) {
        let group = &mut self.pg[index];
        let could_run = group.can_run_more();
        group.max_running_queries = max_running_queries;
        if group.can_run_more() != could_run {
            self.update_eligibility(index);
        }
    }

    fn set_max_queued_queries(&mut self, index: GroupIndex, max_queued_queries: usize) {
        let group = &mut self.pg[index];
        let could_run = group.can_run_more();
        group.max_queued_queries = max_queued_queries;
        if group.can_run_more() != could_run {
            self.update_eligibility(index);
        }
    }

    fn set_soft_memory_limit(&mut self, index: GroupIndex, soft_memory_limit_bytes: u64) {
        let group = &mut self.pg[index];
        let could_run = group.can_run_more();
        group.soft_memory_limit_bytes = soft_memory_limit_bytes;
        if group.can_run_more() != could_run {
            self.update_eligibility(index);
        }
    }

    ///
    /// Recomputes cached memory usage top-down. Internal nodes visit only children with running
    /// queries in their subtrees (the dirty set), replacing each child's stale contribution with
    /// its fresh one; a child whose subtree has drained is pruned from the set on the way
    /// through. Between ticks the cached values go stale, which is what makes the memory limit
    /// soft: admission gates on the values as of the last tick.
    ///
    fn refresh_stats(&mut self, index: GroupIndex) {
        if self.pg[index].is_leaf() {
            let total: u64 = self.pg[index]
                .running_queries
                .iter()
                .map(|query_id| self.queries[query_id].total_memory_reservation())
                .sum();
            self.pg[index].cached_memory_usage_bytes = total;
        } else {
            // Iteration order over the dirty set is arbitrary.
            let dirty: Vec<GroupIndex> = self.pg[index].dirty_sub_groups.iter().copied().collect();
            for sub_group in dirty {
                let old_memory_usage = self.pg[sub_group].cached_memory_usage_bytes;
                self.pg[index].cached_memory_usage_bytes -= old_memory_usage;
                self.refresh_stats(sub_group);
                let new_memory_usage = self.pg[sub_group].cached_memory_usage_bytes;
                self.pg[index].cached_memory_usage_bytes += new_memory_usage;
                if !self.pg[sub_group].is_dirty() {
                    self.pg[index].dirty_sub_groups.remove(&sub_group);
                }
                if old_memory_usage != new_memory_usage {
                    // A memory change can flip can_run_more, and the eligible queues must
                    // observe that before dispatch walks them.
                    self.update_eligibility(sub_group);
                }
            }
        }
    }

    ///
    /// Starts exactly one query from this subtree if the limits currently allow one, and reports
    /// whether it did. Internal nodes delegate to the head of their eligible-child queue; a
    /// child that stays eligible afterwards re-enters at the tail, which is what makes dispatch
    /// round-robin across siblings.
    ///
    fn start_next(&mut self, index: GroupIndex, executor: &Executor) -> bool {
        if !self.pg[index].can_run_more() {
            return false;
        }
        if let Some(query_id) = self.pg[index].queued_queries.poll() {
            self.start_in_background(index, query_id, executor);
            return true;
        }
        let Some(sub_group) = self.pg[index].eligible_sub_groups.poll() else {
            return false;
        };
        let started = self.start_next(sub_group, executor);
        assert!(
            started,
            "eligible sub-group {} had no queries to start",
            self.pg[sub_group].id
        );
        self.pg[index].descendant_queued_queries -= 1;
        // Not update_eligibility: the start already walked the spine, and repeating the walk at
        // every level of the recursion would be quadratic in tree depth.
        if self.pg[sub_group].is_eligible() {
            self.pg[index].eligible_sub_groups.add(sub_group);
        }
        true
    }

    fn process_queued_queries(&mut self, executor: &Executor) {
        self.refresh_stats(self.root);
        let mut started = 0_usize;
        while self.start_next(self.root, executor) {
            started += 1;
        }
        if started > 0 {
            log::debug!("started {started} queued queries in {}", self.pg[self.root].id);
        }
    }
}
