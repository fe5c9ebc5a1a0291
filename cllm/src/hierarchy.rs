//! Symmetry-group partitioning and the tree of hierarchy nodes it produces.
//!
//! Execution collapses the tree's "control node forwards to least-loaded child, awaits
//! children, sum-reduces" behavior to one shared, lock-free [`cllm_queues::WorkQueue`] per
//! symmetry group: a control node's mailbox-and-relay role is, for a pool of sibling
//! workers under the same group, exactly what an SPMC queue already gives us for free
//! (any idle worker in the group competitively claims the next batch). Routing is only a
//! scheduling hint — correctness does not depend on routing choice — so collapsing the
//! relay hops this way keeps the routing goal (cache-local grouping) without a second
//! message-passing mechanism alongside the one already built.

use crate::error::{CllmError, Result};

/// Default symmetry order `K`.
pub const DEFAULT_SYMMETRY_ORDER: u32 = 12;

/// Whether a node executes batches (`Worker`) or only routes/reduces (`Control`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Control,
    Worker,
}

/// One node in the hierarchy tree, held in an arena
/// rather than linked via borrowed references — the Design Notes call for replacing raw
/// back-pointers between nodes with a typed handle into a coordinator-owned table; this
/// arena's `usize` indices are that handle.
#[derive(Debug, Clone)]
pub struct HierarchyNode {
    pub sphere_id: usize,
    pub level: u32,
    pub symmetry_group: u32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub role: Role,
}

impl HierarchyNode {
    fn new(sphere_id: usize, level: u32, symmetry_group: u32, parent: Option<usize>, role: Role) -> Self {
        Self { sphere_id, level, symmetry_group, parent, children: Vec::new(), role }
    }
}

/// The constructed tree, plus the derived mapping every worker-processing routine needs:
/// which symmetry group each leaf worker belongs to.
pub struct HierarchyTree {
    nodes: Vec<HierarchyNode>,
    /// `worker_groups[i]` is the symmetry group of the `i`-th leaf worker (0-based, in
    /// construction order) — the index used everywhere else in this crate as `sphere_id`
    /// for segment/scratch assignment.
    worker_groups: Vec<u32>,
    symmetry_order: u32,
}

impl HierarchyTree {
    /// Returns the new child's arena index, or [`CllmError::InvariantViolation`] if
    /// `parent` does not exist.
    fn add_child(&mut self, parent: usize, symmetry_group: u32, role: Role) -> Result<usize> {
        if parent >= self.nodes.len() {
            return Err(CllmError::InvariantViolation(format!("add_child: no such parent {parent}")));
        }
        let level = self.nodes[parent].level + 1;
        let child_idx = self.nodes.len();
        self.nodes.push(HierarchyNode::new(child_idx, level, symmetry_group, Some(parent), role));
        self.nodes[parent].children.push(child_idx);
        Ok(child_idx)
    }

    /// Builds the tree for `target_worker_count` workers under symmetry order `k`: flat
    /// when there are at most `k` leaves, else a two-level fan-out of `k` group nodes.
    pub fn build(target_worker_count: usize, k: u32) -> Result<Self> {
        if k == 0 {
            return Err(CllmError::InvariantViolation("symmetry order must be at least 1".into()));
        }

        let root = HierarchyNode::new(0, 0, 0, None, Role::Control);
        let mut tree = Self { nodes: vec![root], worker_groups: Vec::new(), symmetry_order: k };

        if target_worker_count <= 1 {
            // A single worker, no hierarchy: the "root" itself is the sole worker.
            tree.nodes[0].role = Role::Worker;
            tree.worker_groups.push(0);
            return Ok(tree);
        }

        let leaves = target_worker_count - 1;

        if leaves <= k as usize {
            for i in 0..leaves {
                let group = (i as u32) % k;
                tree.add_child(0, group, Role::Worker)?;
                tree.worker_groups.push(group);
            }
            return Ok(tree);
        }

        // Two-level fan-out: K level-1 group nodes, then the remaining workers
        // round-robin across those K parents, inheriting the parent's group.
        let mut level1 = Vec::with_capacity(k as usize);
        for group in 0..k {
            let idx = tree.add_child(0, group, Role::Control)?;
            level1.push(idx);
        }

        let remaining = leaves - k as usize;
        for i in 0..remaining {
            let parent_slot = i % k as usize;
            let parent_idx = level1[parent_slot];
            let group = tree.nodes[parent_idx].symmetry_group;
            tree.add_child(parent_idx, group, Role::Worker)?;
            tree.worker_groups.push(group);
        }
        // Level-1 group nodes themselves carry no worker unless `remaining` assigned one;
        // demote any level-1 node with no worker children into a worker of its own group
        // so every configured group still does useful work (spec requires routing
        // fall back, not idle capacity).
        for &idx in &level1 {
            if tree.nodes[idx].children.is_empty() {
                tree.nodes[idx].role = Role::Worker;
                tree.worker_groups.push(tree.nodes[idx].symmetry_group);
            }
        }

        Ok(tree)
    }

    /// The symmetry group of leaf worker `sphere_id` (construction order).
    pub fn worker_group(&self, sphere_id: usize) -> u32 {
        self.worker_groups[sphere_id]
    }

    /// Total leaf workers this tree assigns work to.
    pub fn worker_count(&self) -> usize {
        self.worker_groups.len()
    }

    /// Read-only view of the arena, for diagnostics and tests.
    pub fn nodes(&self) -> &[HierarchyNode] {
        &self.nodes
    }

    pub fn symmetry_order(&self) -> u32 {
        self.symmetry_order
    }
}

/// Counts vocabulary tokens per symmetry group and reports the dominant one.
///
/// `group_of` is the vocabulary's `token_id -> group` mapping; when `None`,
/// `token_id % k` is used as the fallback.
pub fn dominant_group(token_ids: &[u32], k: u32, group_of: Option<&dyn Fn(u32) -> u32>) -> u32 {
    let mut counts = vec![0u64; k as usize];
    for &token in token_ids {
        let group = group_of.map(|f| f(token)).unwrap_or(token % k);
        counts[(group % k) as usize] += 1;
    }
    counts
        .iter()
        .enumerate()
        .max_by_key(|&(_, count)| count)
        .map(|(group, _)| group as u32)
        .unwrap_or(0)
}

/// Resolves a dominant group to an actual routable group index: identity if that group
/// has an assigned worker, else `dominant_group % num_groups_with_workers` over the
/// groups that do.
pub fn route_group(dominant: u32, groups_with_workers: &[u32]) -> u32 {
    if groups_with_workers.contains(&dominant) {
        return dominant;
    }
    if groups_with_workers.is_empty() {
        return dominant;
    }
    let idx = (dominant as usize) % groups_with_workers.len();
    groups_with_workers[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_has_no_hierarchy() {
        let tree = HierarchyTree::build(1, DEFAULT_SYMMETRY_ORDER).unwrap();
        assert_eq!(tree.worker_count(), 1);
        assert_eq!(tree.nodes().len(), 1);
        assert_eq!(tree.nodes()[0].role, Role::Worker);
    }

    #[test]
    fn flat_topology_for_t_le_k_plus_1() {
        let k = 12;
        let tree = HierarchyTree::build(k as usize + 1, k).unwrap();
        assert_eq!(tree.worker_count(), k as usize);
        assert_eq!(tree.nodes()[0].role, Role::Control);
        for i in 0..k as usize {
            assert_eq!(tree.worker_group(i), i as u32 % k);
        }
    }

    #[test]
    fn two_level_fanout_for_t_gt_k_plus_1() {
        let k = 3;
        let target = k as usize * k as usize + 1; // T = K*K + 1
        let tree = HierarchyTree::build(target, k).unwrap();
        // root + K level-1 control nodes + (T-1-K) level-2 workers.
        let level1_count = tree.nodes().iter().filter(|n| n.level == 1).count();
        assert_eq!(level1_count, k as usize);
        assert_eq!(tree.worker_count(), target - 1 - k as usize);
    }

    #[test]
    fn dominant_group_picks_highest_count() {
        // {0: 5, 1: 1, 2: 2} with K=3 and the mod-3 fallback mapping.
        let tokens: Vec<u32> = vec![0, 3, 6, 9, 12, 1, 2, 5];
        assert_eq!(dominant_group(&tokens, 3, None), 0);
    }

    #[test]
    fn route_group_falls_back_when_group_has_no_worker() {
        let groups_with_workers = vec![0, 1];
        assert_eq!(route_group(0, &groups_with_workers), 0);
        assert_eq!(route_group(2, &groups_with_workers), 0); // 2 % 2 == 0
    }

    #[test]
    fn add_child_rejects_unknown_parent() {
        let mut tree = HierarchyTree::build(1, 4).unwrap();
        assert!(tree.add_child(99, 0, Role::Worker).is_err());
    }
}
