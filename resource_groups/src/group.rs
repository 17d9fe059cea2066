// Copyright 2026 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::{FnvHashMap, FnvHashSet};

use crate::id::ResourceGroupId;
use crate::query::QueryId;
use crate::queue::FifoSet;
use crate::GroupIndex;

///
/// One node of an admission tree. Leaves hold queries; internal nodes hold sub-groups, cached
/// descendant counters, and the queues that drive dispatch. All fields are guarded by the
/// tree-wide lock.
///
pub(crate) struct Group {
    pub(crate) id: ResourceGroupId,
    pub(crate) parent: Option<GroupIndex>,
    pub(crate) sub_groups: FnvHashMap<String, GroupIndex>,
    pub(crate) soft_memory_limit_bytes: u64,
    pub(crate) max_running_queries: usize,
    pub(crate) max_queued_queries: usize,
    // Only non-empty at leaves.
    pub(crate) queued_queries: FifoSet<QueryId>,
    pub(crate) running_queries: FnvHashSet<QueryId>,
    // Direct children that could start a query right now, in round-robin order. Only non-empty
    // at internal nodes.
    pub(crate) eligible_sub_groups: FifoSet<GroupIndex>,
    // Direct children with a running query somewhere in their subtree. Pruned lazily during
    // memory refresh.
    pub(crate) dirty_sub_groups: FnvHashSet<GroupIndex>,
    pub(crate) descendant_running_queries: usize,
    pub(crate) descendant_queued_queries: usize,
    pub(crate) cached_memory_usage_bytes: u64,
}

impl Group {
    pub(crate) fn new(
        id: ResourceGroupId,
        parent: Option<GroupIndex>,
        max_running_queries: usize,
        max_queued_queries: usize,
        soft_memory_limit_bytes: u64,
    ) -> Group {
        Group {
            id,
            parent,
            sub_groups: FnvHashMap::default(),
            soft_memory_limit_bytes,
            max_running_queries,
            max_queued_queries,
            queued_queries: FifoSet::new(),
            running_queries: FnvHashSet::default(),
            eligible_sub_groups: FifoSet::new(),
            dirty_sub_groups: FnvHashSet::default(),
            descendant_running_queries: 0,
            descendant_queued_queries: 0,
            cached_memory_usage_bytes: 0,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.sub_groups.is_empty()
    }

    pub(crate) fn subtree_running_queries(&self) -> usize {
        self.running_queries.len() + self.descendant_running_queries
    }

    pub(crate) fn subtree_queued_queries(&self) -> usize {
        self.queued_queries.len() + self.descendant_queued_queries
    }

    // A zero limit closes the group.
    pub(crate) fn can_run_more(&self) -> bool {
        self.subtree_running_queries() < self.max_running_queries
            && self.cached_memory_usage_bytes < self.soft_memory_limit_bytes
    }

    pub(crate) fn can_queue_more(&self) -> bool {
        self.subtree_queued_queries() < self.max_queued_queries
    }

    ///
    /// True if some query in this subtree could be started right now, as far as this node's own
    /// limits are concerned.
    ///
    pub(crate) fn is_eligible(&self) -> bool {
        self.can_run_more()
            && (!self.queued_queries.is_empty() || !self.eligible_sub_groups.is_empty())
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.subtree_running_queries() > 0
    }

    pub(crate) fn info(&self) -> GroupInfo {
        GroupInfo {
            id: self.id.clone(),
            soft_memory_limit_bytes: self.soft_memory_limit_bytes,
            max_running_queries: self.max_running_queries,
            max_queued_queries: self.max_queued_queries,
            num_running_queries: self.subtree_running_queries(),
            num_queued_queries: self.subtree_queued_queries(),
            memory_usage_bytes: self.cached_memory_usage_bytes,
        }
    }
}

///
/// A point-in-time snapshot of one group. Running/queued counts cover the whole subtree;
/// memory usage is the value cached by the most recent driver tick.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupInfo {
    pub id: ResourceGroupId,
    pub soft_memory_limit_bytes: u64,
    pub max_running_queries: usize,
    pub max_queued_queries: usize,
    pub num_running_queries: usize,
    pub num_queued_queries: usize,
    pub memory_usage_bytes: u64,
}
