/// Mesh topology: raw adjacency claims, the effective (mutual) subgraph,
/// and next-hop route computation.
///
/// Pure data structure, no I/O. Nodes are value-typed strings.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Directed adjacency claims: node → the neighbors it announces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    adj: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a node's announced neighbor list. Returns whether anything
    /// changed, so callers can skip recomputation on duplicate MSAs.
    pub fn set_neighbors(&mut self, node: &str, neighbors: impl IntoIterator<Item = String>) -> bool {
        let next: BTreeSet<String> = neighbors.into_iter().collect();
        match self.adj.get(node) {
            Some(current) if *current == next => false,
            _ => {
                self.adj.insert(node.to_string(), next);
                true
            }
        }
    }

    /// Drop a node and every claim it made.
    pub fn remove_node(&mut self, node: &str) {
        self.adj.remove(node);
    }

    /// Merge a handshake snapshot into this topology.
    pub fn merge(&mut self, other: &Topology) -> bool {
        let mut changed = false;
        for (node, neighbors) in &other.adj {
            changed |= self.set_neighbors(node, neighbors.iter().cloned());
        }
        changed
    }

    pub fn neighbors(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.adj.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.adj.keys()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.adj.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.adj.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    /// The effective network: keep edge (a, b) iff both a claims b and
    /// b claims a. Routing runs only on this subgraph.
    pub fn effective(&self) -> Topology {
        let mut effective = Topology::new();
        for (node, neighbors) in &self.adj {
            let mutual: BTreeSet<String> = neighbors
                .iter()
                .filter(|n| {
                    self.adj
                        .get(*n)
                        .map(|back| back.contains(node))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            effective.adj.insert(node.clone(), mutual);
        }
        effective
    }

    /// Nodes reachable from `source` in this topology (BFS).
    pub fn reachable_from(&self, source: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        seen.insert(source.to_string());
        queue.push_back(source.to_string());
        while let Some(node) = queue.pop_front() {
            if let Some(neighbors) = self.adj.get(&node) {
                for next in neighbors {
                    if seen.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// Shortest-path first hops from `source`: destination → next hop.
    /// BFS over the effective graph; the source itself has no entry.
    pub fn routes_from(&self, source: &str) -> HashMap<String, String> {
        let mut routes = HashMap::new();
        let mut queue = VecDeque::new();

        if let Some(direct) = self.adj.get(source) {
            for neighbor in direct {
                routes.insert(neighbor.clone(), neighbor.clone());
                queue.push_back(neighbor.clone());
            }
        }

        while let Some(node) = queue.pop_front() {
            let via = match routes.get(&node) {
                Some(hop) => hop.clone(),
                None => continue,
            };
            if let Some(neighbors) = self.adj.get(&node) {
                for next in neighbors {
                    if next != source && !routes.contains_key(next) {
                        routes.insert(next.clone(), via.clone());
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_abc() -> Topology {
        // a - b - c, all claims mutual
        let mut topo = Topology::new();
        topo.set_neighbors("a", ["b".to_string()]);
        topo.set_neighbors("b", ["a".to_string(), "c".to_string()]);
        topo.set_neighbors("c", ["b".to_string()]);
        topo
    }

    #[test]
    fn effective_keeps_only_mutual_edges() {
        let mut topo = line_abc();
        // d claims b, but b does not claim d back
        topo.set_neighbors("d", ["b".to_string()]);

        let effective = topo.effective();
        assert!(effective.neighbors("d").unwrap().is_empty());
        assert!(effective.neighbors("b").unwrap().contains("a"));
        assert!(!effective.neighbors("b").unwrap().contains("d"));
    }

    #[test]
    fn effective_is_symmetric() {
        let mut topo = line_abc();
        topo.set_neighbors("d", ["a".to_string()]);
        let effective = topo.effective();
        for node in effective.nodes() {
            for neighbor in effective.neighbors(node).unwrap() {
                assert!(
                    effective.neighbors(neighbor).unwrap().contains(node),
                    "edge {node}→{neighbor} not mirrored"
                );
            }
        }
    }

    #[test]
    fn routes_pick_first_hop() {
        let routes = line_abc().effective().routes_from("a");
        assert_eq!(routes.get("b").map(String::as_str), Some("b"));
        assert_eq!(routes.get("c").map(String::as_str), Some("b"));
        assert!(!routes.contains_key("a"));
    }

    #[test]
    fn routes_are_acyclic() {
        // Diamond with a cycle: a-b, a-c, b-d, c-d, b-c
        let mut topo = Topology::new();
        topo.set_neighbors("a", ["b".to_string(), "c".to_string()]);
        topo.set_neighbors("b", ["a".to_string(), "c".to_string(), "d".to_string()]);
        topo.set_neighbors("c", ["a".to_string(), "b".to_string(), "d".to_string()]);
        topo.set_neighbors("d", ["b".to_string(), "c".to_string()]);

        let effective = topo.effective();
        // Walking next-hops from any source terminates at the destination.
        for source in ["a", "b", "c", "d"] {
            let routes = effective.routes_from(source);
            for dest in routes.keys() {
                let mut at = source.to_string();
                let mut hops = 0;
                while &at != dest {
                    at = effective.routes_from(&at)[dest].clone();
                    hops += 1;
                    assert!(hops <= 4, "routing loop from {source} to {dest}");
                }
            }
        }
    }

    #[test]
    fn partition_shrinks_and_heals() {
        let mut topo = line_abc();

        // Cut b-c: b stops claiming c.
        topo.set_neighbors("b", ["a".to_string()]);
        let effective = topo.effective();
        let routes = effective.routes_from("a");
        assert!(!routes.contains_key("c"));
        assert!(!effective.reachable_from("a").contains("c"));

        // Restore.
        topo.set_neighbors("b", ["a".to_string(), "c".to_string()]);
        let routes = topo.effective().routes_from("a");
        assert_eq!(routes.get("c").map(String::as_str), Some("b"));
    }

    #[test]
    fn duplicate_msa_is_a_noop() {
        let mut topo = line_abc();
        assert!(!topo.set_neighbors("b", ["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn merge_adopts_snapshot() {
        let mut topo = Topology::new();
        assert!(topo.merge(&line_abc()));
        assert!(topo.contains("c"));
        // Merging the same snapshot again changes nothing.
        assert!(!topo.merge(&line_abc()));
    }
}
