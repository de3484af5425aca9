//! Dependency graph for checklist ordering.
//!
//! Synthesis output comes from a language model and cannot be trusted to
//! be acyclic or referentially consistent, so the builder must produce a
//! usable total order under any input: prerequisites referencing unknown
//! titles are dropped, and back-edges are skipped at the point of
//! detection rather than failing the run. The walk keeps an explicit
//! stack — input size is whatever the model emitted.

use std::collections::HashMap;

use waymark_shared::CandidateStep;

/// A directed graph of candidate steps keyed by title, with edges pointing
/// at prerequisites.
pub struct DependencyGraph {
    nodes: HashMap<String, CandidateStep>,
    /// title → its valid prerequisites.
    edges: HashMap<String, Vec<String>>,
    /// title → titles that depend on it.
    reverse_edges: HashMap<String, Vec<String>>,
    /// Titles in first-seen input order; drives deterministic emission.
    insertion_order: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph from candidate steps, validating prerequisite
    /// references. A prerequisite naming a non-existent title is logged
    /// and ignored.
    pub fn build(steps: &[CandidateStep]) -> Self {
        let mut nodes: HashMap<String, CandidateStep> = HashMap::new();
        let mut insertion_order = Vec::new();

        for step in steps {
            if !nodes.contains_key(&step.title) {
                insertion_order.push(step.title.clone());
            }
            nodes.insert(step.title.clone(), step.clone());
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse_edges: HashMap<String, Vec<String>> = HashMap::new();
        for title in &insertion_order {
            edges.entry(title.clone()).or_default();
            reverse_edges.entry(title.clone()).or_default();
        }

        for title in &insertion_order {
            let step = &nodes[title];
            let mut valid = Vec::new();
            for dep in &step.depends_on {
                if dep != title && nodes.contains_key(dep) {
                    valid.push(dep.clone());
                    reverse_edges
                        .entry(dep.clone())
                        .or_default()
                        .push(title.clone());
                } else {
                    tracing::warn!(
                        step = %title,
                        prerequisite = %dep,
                        "dropping prerequisite that references no known step"
                    );
                }
            }
            edges.insert(title.clone(), valid);
        }

        Self {
            nodes,
            edges,
            reverse_edges,
            insertion_order,
        }
    }

    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }

    /// Depth-first topological sort: every step's (non-cyclic)
    /// prerequisites are emitted before the step itself. On a back-edge,
    /// the cycle is broken at that edge and the walk continues, so every
    /// input step appears exactly once and the sort always terminates.
    pub fn topological_sort(&self) -> Vec<CandidateStep> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Visited,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut sorted: Vec<CandidateStep> = Vec::with_capacity(self.insertion_order.len());

        for start in &self.insertion_order {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            // (title, index of the next prerequisite to consider)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some((title, next)) = stack.last_mut() {
                let deps = &self.edges[*title];
                if *next < deps.len() {
                    let dep = deps[*next].as_str();
                    *next += 1;
                    match marks.get(dep) {
                        Some(Mark::Visited) => {}
                        Some(Mark::Visiting) => {
                            tracing::warn!(
                                step = %title,
                                prerequisite = %dep,
                                "circular dependency detected, breaking cycle at this edge"
                            );
                        }
                        None => {
                            marks.insert(dep, Mark::Visiting);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    let finished = *title;
                    stack.pop();
                    marks.insert(finished, Mark::Visited);
                    sorted.push(self.nodes[finished].clone());
                }
            }
        }

        sorted
    }

    /// Steps with no prerequisites, in input order.
    pub fn entry_points(&self) -> Vec<&CandidateStep> {
        self.insertion_order
            .iter()
            .filter(|title| self.edges[*title].is_empty())
            .map(|title| &self.nodes[title])
            .collect()
    }

    /// Steps nothing depends on, in input order.
    pub fn exit_points(&self) -> Vec<&CandidateStep> {
        self.insertion_order
            .iter()
            .filter(|title| self.reverse_edges[*title].is_empty())
            .map(|title| &self.nodes[title])
            .collect()
    }

    /// The longest prerequisite chain, entry first. Computed over the
    /// cycle-broken topological order, so it terminates on any input.
    pub fn critical_path(&self) -> Vec<CandidateStep> {
        let order = self.topological_sort();
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, step)| (step.title.as_str(), i))
            .collect();

        let mut chain_len: HashMap<&str, usize> = HashMap::new();
        let mut best_prev: HashMap<&str, Option<&str>> = HashMap::new();

        for step in &order {
            let title = step.title.as_str();
            let mut longest = 0;
            let mut prev = None;
            for dep in &self.edges[title] {
                // Edges forward in the emitted order were cycle-broken.
                if position[dep.as_str()] < position[title]
                    && chain_len[dep.as_str()] > longest
                {
                    longest = chain_len[dep.as_str()];
                    prev = Some(dep.as_str());
                }
            }
            chain_len.insert(title, longest + 1);
            best_prev.insert(title, prev);
        }

        let mut best: Option<(&str, usize)> = None;
        for step in &order {
            let title = step.title.as_str();
            if best.is_none_or(|(_, len)| chain_len[title] > len) {
                best = Some((title, chain_len[title]));
            }
        }
        let Some((mut cursor, _)) = best else {
            return Vec::new();
        };

        let mut path = vec![self.nodes[cursor].clone()];
        while let Some(Some(prev)) = best_prev.get(cursor) {
            path.push(self.nodes[*prev].clone());
            cursor = *prev;
        }
        path.reverse();
        path
    }

    /// List every cycle reachable in the graph, as title sequences.
    /// Diagnostic only — the sort tolerates cycles regardless.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Visited,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut cycles = Vec::new();

        for start in &self.insertion_order {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some((title, next)) = stack.last_mut() {
                let deps = &self.edges[*title];
                if *next < deps.len() {
                    let dep = deps[*next].as_str();
                    *next += 1;
                    match marks.get(dep) {
                        Some(Mark::Visited) => {}
                        Some(Mark::Visiting) => {
                            // The stack holds the path; the cycle runs from
                            // the earlier occurrence of `dep` to the top.
                            if let Some(pos) =
                                stack.iter().position(|(t, _)| *t == dep)
                            {
                                cycles.push(
                                    stack[pos..]
                                        .iter()
                                        .map(|(t, _)| t.to_string())
                                        .collect(),
                                );
                            }
                        }
                        None => {
                            marks.insert(dep, Mark::Visiting);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    let finished = *title;
                    stack.pop();
                    marks.insert(finished, Mark::Visited);
                }
            }
        }

        cycles
    }
}
