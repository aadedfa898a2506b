//! Walkable Graph
//!
//! Nodes are non-hill cells; edges join cells whose Euclidean distance is at
//! most 1.5 (the eight neighbours). Paths are plain BFS: the grid is small
//! and every edge has the same cost.

use std::collections::{BTreeSet, VecDeque, BTreeMap};

use crate::core::Position;

/// Neighbour offsets in a fixed order so BFS results are reproducible.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1), (-1, 0), (-1, 1),
    (0, -1),           (0, 1),
    (1, -1),  (1, 0),  (1, 1),
];

/// Set of walkable cells with implicit 8-neighbour edges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeSet<Position>,
}

impl Graph {
    /// Build from every cell `walkable` accepts.
    pub fn build(lines: i32, cols: i32, walkable: impl Fn(Position) -> bool) -> Self {
        let mut nodes = BTreeSet::new();
        for l in 0..lines {
            for c in 0..cols {
                let pos = Position::new(l, c);
                if walkable(pos) {
                    nodes.insert(pos);
                }
            }
        }
        Self { nodes }
    }

    /// Is `pos` a node?
    #[inline]
    pub fn contains(&self, pos: Position) -> bool {
        self.nodes.contains(&pos)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// No nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in row-major order.
    pub fn nodes(&self) -> impl Iterator<Item = Position> + '_ {
        self.nodes.iter().copied()
    }

    /// Nodes adjacent to `pos`.
    pub fn neighbours(&self, pos: Position) -> impl Iterator<Item = Position> + '_ {
        NEIGHBOURS
            .iter()
            .map(move |(dl, dc)| Position::new(pos.row + dl, pos.col + dc))
            .filter(move |p| self.nodes.contains(p))
    }

    /// Keep only the component containing `root`. Empty if `root` is no node.
    pub fn prune_to_component(&mut self, root: Position) {
        if !self.contains(root) {
            self.nodes.clear();
            return;
        }
        let mut seen = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(cur) = queue.pop_front() {
            for next in self.neighbours(cur) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        self.nodes = seen;
    }

    /// Shortest path from `from` to `to`, both included.
    pub fn find_way(&self, from: Position, to: Position) -> Option<Vec<Position>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(vec![from]);
        }
        let mut parent: BTreeMap<Position, Position> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        parent.insert(from, from);
        while let Some(cur) = queue.pop_front() {
            if cur == to {
                break;
            }
            for next in self.neighbours(cur) {
                if let std::collections::btree_map::Entry::Vacant(e) = parent.entry(next) {
                    e.insert(cur);
                    queue.push_back(next);
                }
            }
        }
        if !parent.contains_key(&to) {
            return None;
        }
        let mut way = vec![to];
        let mut cur = to;
        while cur != from {
            cur = *parent.get(&cur)?;
            way.push(cur);
        }
        way.reverse();
        Some(way)
    }
}
