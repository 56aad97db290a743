//! # Agent KD-Tree
//!
//! Axis-aligned-bounding-box kd-tree over agent positions, rebuilt from scratch
//! every tick and queried for bounded-radius k-nearest neighbors.
//!
//! ## Layout
//!
//! Nodes live in a flat, pre-sized arena addressed by index. A node covers the
//! half-open segment `[begin, end)` of the agent array, which the build reorders
//! in place. The left child of node `i` is stored at `i + 1`; the right child at
//! `i + 2 * left_len`, the worst-case node count of the left subtree. A subtree
//! over `k` elements therefore never uses more than `2k - 1` slots, and the arena
//! needs `2n` nodes for `n` agents. Nodes are overwritten on rebuild, never freed.
//!
//! ## Query
//!
//! Standard branch-and-bound descent: visit the nearer child first and descend
//! into the farther one only while its box is still inside the (shrinking)
//! search radius. The visitor owns the radius: a bounded neighbor list tightens
//! it to the distance of its last kept candidate once full.

use crate::structs::{sqr, AgentState, Vector3D};
use log::warn;

/// Segments at or below this length are not subdivided.
pub const MAX_LEAF_SIZE: usize = 10;

const INITIAL_NODE_CAPACITY: usize = 256;

/// Anything with a position can be indexed.
pub trait Spatial {
    fn position(&self) -> Vector3D;
}

impl Spatial for AgentState {
    fn position(&self) -> Vector3D {
        self.position
    }
}

impl Spatial for Vector3D {
    fn position(&self) -> Vector3D {
        *self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AgentTreeNode {
    begin: usize,
    end: usize,
    left: usize,
    right: usize,
    min_coord: Vector3D,
    max_coord: Vector3D,
}

impl AgentTreeNode {
    fn is_leaf(&self) -> bool {
        self.end - self.begin <= MAX_LEAF_SIZE
    }

    /// Squared distance from `point` to this node's box; zero inside.
    fn distance_squared_to(&self, point: &Vector3D) -> f64 {
        (0..3)
            .map(|axis| {
                sqr((self.min_coord[axis] - point[axis]).max(0.0))
                    + sqr((point[axis] - self.max_coord[axis]).max(0.0))
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<AgentTreeNode>,
    len: usize,
    built: bool,
}

impl Default for KdTree {
    fn default() -> Self {
        Self::new()
    }
}

impl KdTree {
    pub fn new() -> Self {
        KdTree {
            nodes: vec![AgentTreeNode::default(); INITIAL_NODE_CAPACITY],
            len: 0,
            built: false,
        }
    }

    /// Number of agents covered by the last build.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Grows the node arena so a tree over `agent_count` agents fits.
    /// Over-allocates by 2x to avoid regrowing on small count changes.
    pub fn reserve_for(&mut self, agent_count: usize) {
        let needed = 2 * agent_count;
        if needed > self.nodes.len() {
            self.nodes = vec![AgentTreeNode::default(); 4 * agent_count];
        }
    }

    /// Marks the tree stale; queries are refused until the next build.
    pub fn invalidate(&mut self) {
        self.built = false;
    }

    /// Rebuilds the tree over `items`, reordering them in place.
    pub fn build<T: Spatial>(&mut self, items: &mut [T]) {
        self.len = items.len();
        if items.is_empty() {
            self.built = false;
            return;
        }
        // Count changes are normally handled by the scheduler; this catches
        // callers that skipped it.
        self.reserve_for(items.len());
        self.build_recursive(items, 0, items.len(), 0);
        self.built = true;
    }

    fn build_recursive<T: Spatial>(&mut self, items: &mut [T], begin: usize, end: usize, node: usize) {
        let mut min_coord = items[begin].position();
        let mut max_coord = min_coord;
        for item in &items[begin + 1..end] {
            let p = item.position();
            for axis in 0..3 {
                min_coord[axis] = min_coord[axis].min(p[axis]);
                max_coord[axis] = max_coord[axis].max(p[axis]);
            }
        }

        {
            let current = &mut self.nodes[node];
            current.begin = begin;
            current.end = end;
            current.min_coord = min_coord;
            current.max_coord = max_coord;
        }

        if end - begin <= MAX_LEAF_SIZE {
            return;
        }

        // Split the widest axis at its midpoint
        let extent = max_coord - min_coord;
        let axis = if extent.x > extent.y && extent.x > extent.z {
            0
        } else if extent.y > extent.z {
            1
        } else {
            2
        };
        let split_value = 0.5 * (max_coord[axis] + min_coord[axis]);

        // Two-pointer partition: [begin, left) < split_value <= [left, end)
        let mut left = begin;
        let mut right = end;
        while left < right {
            while left < right && items[left].position()[axis] < split_value {
                left += 1;
            }
            while right > left && items[right - 1].position()[axis] >= split_value {
                right -= 1;
            }
            if left < right {
                items.swap(left, right - 1);
                left += 1;
                right -= 1;
            }
        }

        // Degenerate split: peel one element off so the recursion always makes
        // progress. A segment of coincident points is halved by index instead,
        // which keeps the depth logarithmic however many agents share a spot.
        let mut left_len = left - begin;
        if left_len == 0 {
            left_len = if extent[axis] > 0.0 { 1 } else { (end - begin) / 2 };
            left = begin + left_len;
        }

        let left_node = node + 1;
        let right_node = node + 2 * left_len;
        self.nodes[node].left = left_node;
        self.nodes[node].right = right_node;

        self.build_recursive(items, begin, left, left_node);
        self.build_recursive(items, left, end, right_node);
    }

    /// Visits every item that may lie within `range_sq` of `position`.
    ///
    /// `visit(index, item, range_sq)` is called for each item of every leaf
    /// reached; it may shrink `range_sq`, which prunes the rest of the search.
    /// Querying an unbuilt, empty or stale tree logs a warning and visits nothing.
    pub fn query<T, F>(&self, items: &[T], position: Vector3D, range_sq: &mut f64, visit: &mut F)
    where
        T: Spatial,
        F: FnMut(usize, &T, &mut f64),
    {
        if !self.built || self.len == 0 {
            warn!("kd-tree queried before being built or with zero agents; skipping");
            return;
        }
        if items.len() != self.len {
            warn!(
                "kd-tree built over {} agents but queried with {}; skipping",
                self.len,
                items.len()
            );
            return;
        }
        self.query_recursive(items, &position, range_sq, visit, 0);
    }

    fn query_recursive<T, F>(
        &self,
        items: &[T],
        position: &Vector3D,
        range_sq: &mut f64,
        visit: &mut F,
        node: usize,
    ) where
        T: Spatial,
        F: FnMut(usize, &T, &mut f64),
    {
        let current = &self.nodes[node];
        if current.is_leaf() {
            for index in current.begin..current.end {
                visit(index, &items[index], range_sq);
            }
            return;
        }

        let dist_sq_left = self.nodes[current.left].distance_squared_to(position);
        let dist_sq_right = self.nodes[current.right].distance_squared_to(position);

        let (near, near_dist_sq, far, far_dist_sq) = if dist_sq_left < dist_sq_right {
            (current.left, dist_sq_left, current.right, dist_sq_right)
        } else {
            (current.right, dist_sq_right, current.left, dist_sq_left)
        };

        if near_dist_sq < *range_sq {
            self.query_recursive(items, position, range_sq, visit, near);
            if far_dist_sq < *range_sq {
                self.query_recursive(items, position, range_sq, visit, far);
            }
        }
    }

    /// Depth of the deepest leaf; the root is depth 0.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        if !self.built {
            return 0;
        }
        let mut deepest = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            let current = &self.nodes[node];
            deepest = deepest.max(depth);
            if !current.is_leaf() {
                stack.push((current.left, depth + 1));
                stack.push((current.right, depth + 1));
            }
        }
        deepest
    }

    /// Leaf segments in depth-first order.
    #[cfg(test)]
    pub(crate) fn leaf_segments(&self) -> Vec<std::ops::Range<usize>> {
        let mut out = Vec::new();
        if self.built {
            self.collect_leaves(0, &mut out);
        }
        out
    }

    #[cfg(test)]
    fn collect_leaves(&self, node: usize, out: &mut Vec<std::ops::Range<usize>>) {
        let current = &self.nodes[node];
        if current.is_leaf() {
            out.push(current.begin..current.end);
        } else {
            self.collect_leaves(current.left, out);
            self.collect_leaves(current.right, out);
        }
    }

    /// Checks segment partitioning and box containment for every node.
    #[cfg(test)]
    pub(crate) fn assert_invariants<T: Spatial>(&self, items: &[T]) {
        if self.built {
            self.assert_node(items, 0);
        }
    }

    #[cfg(test)]
    fn assert_node<T: Spatial>(&self, items: &[T], node: usize) {
        let current = &self.nodes[node];
        assert!(current.begin < current.end, "empty node segment at {}", node);
        for item in &items[current.begin..current.end] {
            let p = item.position();
            for axis in 0..3 {
                assert!(p[axis] >= current.min_coord[axis] && p[axis] <= current.max_coord[axis]);
            }
        }
        if !current.is_leaf() {
            let left = &self.nodes[current.left];
            let right = &self.nodes[current.right];
            assert_eq!(left.begin, current.begin, "left child must start at parent begin");
            assert_eq!(left.end, right.begin, "children must be contiguous");
            assert_eq!(right.end, current.end, "right child must end at parent end");
            self.assert_node(items, current.left);
            self.assert_node(items, current.right);
        }
    }
}
