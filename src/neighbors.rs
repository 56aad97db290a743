//! # Neighbor Collection
//!
//! Gathers, for one querying agent, the nearest agents it must avoid. Two
//! independent passes run over the same kd-tree:
//!
//! - **Reciprocal pass**: other Reciprocal agents within `neighbor_dist`
//! - **OneSided pass**: OneSided agents within `projectile_dist`
//!
//! Each pass keeps at most `max_neighbors` candidates, sorted by ascending
//! squared distance. Once a list is full its last entry becomes the new search
//! radius, which lets the tree prune everything farther away.

use crate::kdtree::KdTree;
use crate::structs::{sqr, AgentCategory, AgentState};
use ordered_float::OrderedFloat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NeighborCandidate {
    pub dist_sq: OrderedFloat<f64>,
    /// Index into the tick's agent array.
    pub index: usize,
}

/// Bounded, distance-sorted list of neighbor candidates.
#[derive(Debug, Clone, Default)]
pub struct NeighborList {
    entries: Vec<NeighborCandidate>,
}

impl NeighborList {
    pub fn new() -> Self {
        NeighborList { entries: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[NeighborCandidate] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborCandidate> {
        self.entries.iter()
    }

    /// Inserts a candidate if it is strictly inside `range_sq`, keeping the list
    /// sorted and at most `max` long. When the list is full afterwards,
    /// `range_sq` shrinks to the distance of the farthest kept candidate.
    pub fn insert(&mut self, dist_sq: f64, index: usize, max: usize, range_sq: &mut f64) {
        if max == 0 || !(dist_sq < *range_sq) {
            return;
        }

        let candidate = NeighborCandidate {
            dist_sq: OrderedFloat(dist_sq),
            index,
        };

        // A full list drops its farthest entry; the new one is closer by the range check.
        if self.entries.len() < max {
            self.entries.push(candidate);
        }

        let mut i = self.entries.len() - 1;
        while i != 0 && dist_sq < self.entries[i - 1].dist_sq.0 {
            self.entries[i] = self.entries[i - 1];
            i -= 1;
        }
        self.entries[i] = candidate;

        if self.entries.len() == max {
            *range_sq = self.entries[self.entries.len() - 1].dist_sq.0;
        }
    }
}

/// Runs both collection passes for `agents[agent_index]`.
///
/// Both lists are cleared first. An agent with `max_neighbors == 0` ends up with
/// two empty lists and therefore never avoids anything.
pub fn collect_neighbors(
    agent_index: usize,
    agents: &[AgentState],
    tree: &KdTree,
    reciprocal: &mut NeighborList,
    one_sided: &mut NeighborList,
) {
    reciprocal.clear();
    one_sided.clear();

    let agent = &agents[agent_index];
    let max = agent.params.max_neighbors;
    if max == 0 {
        return;
    }
    let position = agent.position;

    // Reciprocal pass
    let mut range_sq = sqr(agent.params.neighbor_dist);
    tree.query(agents, position, &mut range_sq, &mut |index, other: &AgentState, range_sq: &mut f64| {
        if index == agent_index || other.category() != AgentCategory::Reciprocal {
            return;
        }
        let dist_sq = (position - other.position).magnitude_squared();
        reciprocal.insert(dist_sq, index, max, range_sq);
    });

    // OneSided pass
    let mut range_sq = sqr(agent.params.projectile_dist);
    tree.query(agents, position, &mut range_sq, &mut |index, other: &AgentState, range_sq: &mut f64| {
        if index == agent_index || other.category() != AgentCategory::OneSided {
            return;
        }
        let dist_sq = (position - other.position).magnitude_squared();
        one_sided.insert(dist_sq, index, max, range_sq);
    });
}
