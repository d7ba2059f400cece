//! Copy dependency edges between handles of different groups.

use std::hash::Hash;

use hashbrown::HashMap;
use slotmap::SlotMap;

use crate::DependencyId;

/// One direction of an edge; `other` is the edge stored on the peer.
#[derive(Clone, Copy, Debug)]
struct Dependency<H> {
    handle: H,
    other: DependencyId,
}

/// Symmetric copy dependency graph.
///
/// Every edge is stored twice, once per endpoint, each pointing at its mirror. A handle that
/// depends on one member of a set of mutually dependent handles depends on all of them.
#[derive(Debug)]
pub(crate) struct DependencyGraph<H: Copy + Eq + Hash> {
    edges: SlotMap<DependencyId, Dependency<H>>,
    by_handle: HashMap<H, Vec<DependencyId>>,
}

impl<H: Copy + Eq + Hash> Default for DependencyGraph<H> {
    fn default() -> Self {
        Self {
            edges: SlotMap::with_key(),
            by_handle: HashMap::new(),
        }
    }
}

impl<H: Copy + Eq + Hash> DependencyGraph<H> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn peer(&self, edge: DependencyId) -> Option<H> {
        let other = self.edges.get(edge)?.other;
        self.edges.get(other).map(|d| d.handle)
    }

    /// Handles `handle` has an edge to, in insertion order.
    pub(crate) fn neighbours(&self, handle: H) -> Vec<H> {
        self.by_handle
            .get(&handle)
            .map(|edges| edges.iter().filter_map(|&e| self.peer(e)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_dependency(&self, a: H, b: H) -> bool {
        self.neighbours(a).contains(&b)
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.edges.len() / 2
    }

    fn insert_pair(&mut self, a: H, b: H) {
        let ea = self.edges.insert(Dependency {
            handle: a,
            other: DependencyId::default(),
        });
        let eb = self.edges.insert(Dependency {
            handle: b,
            other: ea,
        });
        if let Some(edge) = self.edges.get_mut(ea) {
            edge.other = eb;
        }
        self.by_handle.entry(a).or_default().push(ea);
        self.by_handle.entry(b).or_default().push(eb);
    }

    /// Links `a` and `b`, then links each of `a`'s peers to `b` and each of `b`'s peers to `a`.
    ///
    /// Returns `None` if the edge already existed. Otherwise returns the peers of `b` (other
    /// than `a`) that were linked to `a`; a caller copying from `a` into `b` must also defer that
    /// copy into them.
    pub(crate) fn connect(&mut self, a: H, b: H) -> Option<Vec<H>> {
        if a == b || self.has_dependency(a, b) {
            return None;
        }

        self.insert_pair(a, b);

        for peer in self.neighbours(a) {
            if peer != b {
                self.connect(peer, b);
            }
        }

        let linked: Vec<H> = self
            .neighbours(b)
            .into_iter()
            .filter(|&peer| peer != a)
            .collect();
        for &peer in &linked {
            self.connect(peer, a);
        }

        Some(linked)
    }

    /// Removes every edge of `handle` in both directions and returns its former peers.
    pub(crate) fn remove_handle(&mut self, handle: H) -> Vec<H> {
        let Some(edges) = self.by_handle.remove(&handle) else {
            return Vec::new();
        };

        let mut peers = Vec::with_capacity(edges.len());
        for edge in edges {
            let Some(dependency) = self.edges.remove(edge) else {
                continue;
            };
            let Some(mirror) = self.edges.remove(dependency.other) else {
                continue;
            };
            if let Some(list) = self.by_handle.get_mut(&mirror.handle) {
                list.retain(|&e| e != dependency.other);
                if list.is_empty() {
                    self.by_handle.remove(&mirror.handle);
                }
            }
            peers.push(mirror.handle);
        }
        peers
    }

    /// Every edge has a mirror that points back at it.
    pub(crate) fn check_symmetry(&self) -> bool {
        self.edges.iter().all(|(id, edge)| {
            self.edges
                .get(edge.other)
                .is_some_and(|mirror| mirror.other == id && mirror.handle != edge.handle)
        }) && self.by_handle.iter().all(|(handle, edges)| {
            edges
                .iter()
                .all(|&e| self.edges.get(e).is_some_and(|d| d.handle == *handle))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sorted(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn edges_are_symmetric_and_unique() {
        let mut graph = DependencyGraph::new();
        assert_eq!(graph.connect(1u32, 2), Some(vec![]));
        assert_eq!(graph.connect(1, 2), None);
        assert_eq!(graph.connect(2, 1), None);
        assert_eq!(graph.connect(3, 3), None);

        assert_eq!(graph.neighbours(1), vec![2]);
        assert_eq!(graph.neighbours(2), vec![1]);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.check_symmetry());
    }

    #[test]
    fn connecting_into_a_set_links_every_member() {
        let mut graph = DependencyGraph::new();
        graph.connect(1u32, 2);
        graph.connect(2, 3);

        assert_eq!(sorted(graph.neighbours(1)), vec![2, 3]);
        assert_eq!(sorted(graph.neighbours(3)), vec![1, 2]);

        let linked = graph.connect(4, 1).unwrap();
        assert_eq!(sorted(linked), vec![2, 3]);
        assert_eq!(sorted(graph.neighbours(4)), vec![1, 2, 3]);
        assert_eq!(graph.edge_count(), 6);
        assert!(graph.check_symmetry());
    }

    #[test]
    fn removing_a_handle_drops_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.connect(1u32, 2);
        graph.connect(1, 3);

        assert_eq!(sorted(graph.remove_handle(1)), vec![2, 3]);
        assert!(graph.neighbours(1).is_empty());
        assert_eq!(graph.neighbours(2), vec![3]);
        assert_eq!(graph.neighbours(3), vec![2]);
        assert!(graph.check_symmetry());

        assert!(graph.remove_handle(1).is_empty());
    }
}
