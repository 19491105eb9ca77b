//! Load-time cycle check over the point dependency graph
//!
//! An edge runs from a target point to every point whose stages listen to
//! it. Kahn's algorithm strips every node that is not downstream of a
//! cycle; a second pass in the reverse direction strips nodes that merely
//! hang off a cycle. What is left sits on (or between) cycles and must
//! not be registered, since synchronous fan-out around it would recurse
//! forever.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// Dependency graph built from point names and their listened-to targets
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Any name (primary or alias) to node index
    index: HashMap<String, usize>,
    /// Full point name per node
    nodes: Vec<String>,
    /// Unresolved dependency names per node
    dependencies: Vec<Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a point under its full name and aliases.
    ///
    /// A name already present keeps its first node.
    pub fn add_point(&mut self, full_name: &str, aliases: &[String], dependencies: Vec<String>) {
        if self.index.contains_key(full_name) {
            return;
        }
        let id = self.nodes.len();
        self.nodes.push(full_name.to_string());
        self.dependencies.push(dependencies);
        self.index.insert(full_name.to_string(), id);
        for alias in aliases {
            self.index.entry(alias.clone()).or_insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adjacency from target to dependents. Unknown targets are ignored;
    /// they are resolved later and can never close a cycle now.
    fn edges(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for (dependent, deps) in self.dependencies.iter().enumerate() {
            for dep in deps {
                if let Some(&target) = self.index.get(dep) {
                    if !adj[target].contains(&dependent) {
                        adj[target].push(dependent);
                    }
                }
            }
        }
        adj
    }

    /// Indices of nodes on or between cycles
    fn cyclic_nodes(&self, adj: &[Vec<usize>]) -> BTreeSet<usize> {
        let n = self.nodes.len();

        // Forward pass: remove sources
        let mut in_degree = vec![0usize; n];
        for targets in adj {
            for &t in targets {
                in_degree[t] += 1;
            }
        }
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut removed = vec![false; n];
        while let Some(node) = queue.pop_front() {
            removed[node] = true;
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        // Reverse pass over what is left: remove sinks
        let mut out_degree = vec![0usize; n];
        let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (from, targets) in adj.iter().enumerate() {
            if removed[from] {
                continue;
            }
            for &to in targets {
                if !removed[to] {
                    out_degree[from] += 1;
                    reverse[to].push(from);
                }
            }
        }
        let mut queue: VecDeque<usize> = (0..n)
            .filter(|&i| !removed[i] && out_degree[i] == 0)
            .collect();
        while let Some(node) = queue.pop_front() {
            removed[node] = true;
            for &prev in &reverse[node] {
                out_degree[prev] -= 1;
                if out_degree[prev] == 0 {
                    queue.push_back(prev);
                }
            }
        }

        (0..n).filter(|&i| !removed[i]).collect()
    }

    /// Full names of every point that sits on or between cycles, in the
    /// order they were added
    pub fn cyclic_points(&self) -> Vec<String> {
        let adj = self.edges();
        self.cyclic_nodes(&adj)
            .into_iter()
            .map(|i| self.nodes[i].clone())
            .collect()
    }

    /// One representative path per cycle, each closed by repeating its
    /// first point
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let adj = self.edges();
        let remaining = self.cyclic_nodes(&adj);
        let mut reported = BTreeSet::new();
        let mut cycles = Vec::new();

        for &start in &remaining {
            if reported.contains(&start) {
                continue;
            }
            // Every remaining node has a successor inside the remaining set,
            // so walking forward must revisit a node
            let mut path = vec![start];
            let mut seen = HashMap::from([(start, 0usize)]);
            let mut current = start;
            let loop_start = loop {
                let Some(&next) = adj[current].iter().find(|&&n| remaining.contains(&n)) else {
                    break None;
                };
                if let Some(&pos) = seen.get(&next) {
                    break Some(pos);
                }
                seen.insert(next, path.len());
                path.push(next);
                current = next;
            };

            let Some(pos) = loop_start else {
                continue;
            };
            let cycle: Vec<usize> = path[pos..].to_vec();
            if cycle.iter().any(|n| reported.contains(n)) {
                reported.insert(start);
                continue;
            }
            reported.extend(cycle.iter().copied());
            reported.insert(start);
            let mut names: Vec<String> = cycle.iter().map(|&i| self.nodes[i].clone()).collect();
            names.push(self.nodes[cycle[0]].clone());
            cycles.push(names);
        }

        cycles
    }
}
