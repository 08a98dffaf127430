//! Acyclic dependency graphs and the priority scheduler over them.
//!
//! Anything that can name its direct dependencies gets a deterministic
//! topological ordering: dependencies are visited in declared order and a
//! node is emitted after all of its dependencies. The [`Scheduler`] wraps a
//! graph walk with per-node bookkeeping so a worker pool can drain it in
//! longest-path-first order.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    hash::Hash,
};

/// A node that knows its direct dependencies.
pub trait Dag: Clone + Eq + Hash {
    fn dependencies(&self) -> Vec<Self>;
}

/// Dependencies-first ordering of `root` and everything reachable from it.
pub fn topological_sort<N: Dag>(root: &N) -> Vec<N> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut visited, &mut order);
    order
}

fn visit<N: Dag>(node: &N, visited: &mut HashSet<N>, order: &mut Vec<N>) {
    if !visited.insert(node.clone()) {
        return;
    }
    for dependency in node.dependencies() {
        visit(&dependency, visited, order);
    }
    order.push(node.clone());
}

/// Like [`topological_sort`] but reports a cycle instead of looping forever.
/// The error names the node that closed the cycle via `describe`.
pub fn topological_sort_checked<N: Dag>(
    root: &N,
    describe: impl Fn(&N) -> String,
) -> Result<Vec<N>, String> {
    fn check<N: Dag>(
        node: &N,
        visiting: &mut HashSet<N>,
        visited: &mut HashSet<N>,
        order: &mut Vec<N>,
        describe: &impl Fn(&N) -> String,
    ) -> Result<(), String> {
        if visited.contains(node) {
            return Ok(());
        }
        if !visiting.insert(node.clone()) {
            return Err(format!("dependency cycle involving {}", describe(node)));
        }
        for dependency in node.dependencies() {
            check(&dependency, visiting, visited, order, describe)?;
        }
        visiting.remove(node);
        visited.insert(node.clone());
        order.push(node.clone());
        Ok(())
    }

    let mut order = Vec::new();
    check(root, &mut HashSet::new(), &mut HashSet::new(), &mut order, &describe)?;
    Ok(order)
}

struct Ready<N> {
    path_cost: u64,
    sequence: u64,
    node: N,
}

impl<N> PartialEq for Ready<N> {
    fn eq(&self, other: &Self) -> bool {
        self.path_cost == other.path_cost && self.sequence == other.sequence
    }
}
impl<N> Eq for Ready<N> {}
impl<N> PartialOrd for Ready<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<N> Ord for Ready<N> {
    // max-heap on path cost; earlier insertion wins ties
    fn cmp(&self, other: &Self) -> Ordering {
        self.path_cost
            .cmp(&other.path_cost)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Drains a DAG in dependency order, highest path cost first.
///
/// Path cost of a node is its own cost plus the maximum path cost over the
/// nodes depending on it, computed once at setup; nodes far from the root
/// are scheduled eagerly so the critical path stays busy.
pub struct Scheduler<N: Dag> {
    remaining: HashMap<N, HashSet<N>>,
    reverse: HashMap<N, Vec<N>>,
    path_costs: HashMap<N, u64>,
    ready: BinaryHeap<Ready<N>>,
    sequence: u64,
    failures: Vec<(N, String)>,
}

impl<N: Dag> Scheduler<N> {
    pub fn new(root: &N, cost: impl Fn(&N) -> u64) -> Self {
        let order = topological_sort(root);

        let mut reverse: HashMap<N, Vec<N>> = HashMap::new();
        let mut remaining: HashMap<N, HashSet<N>> = HashMap::new();
        for node in &order {
            let dependencies = node.dependencies();
            for dependency in &dependencies {
                reverse.entry(dependency.clone()).or_default().push(node.clone());
            }
            if !dependencies.is_empty() {
                remaining.insert(node.clone(), dependencies.into_iter().collect());
            }
        }

        // dependents appear later in `order`, so walking it back to front
        // sees every reverse dependency's cost before the node itself
        let mut path_costs: HashMap<N, u64> = HashMap::new();
        for node in order.iter().rev() {
            let above = reverse
                .get(node)
                .into_iter()
                .flatten()
                .filter_map(|dependent| path_costs.get(dependent))
                .max()
                .copied()
                .unwrap_or(0);
            path_costs.insert(node.clone(), cost(node) + above);
        }

        let mut scheduler = Scheduler {
            remaining,
            reverse,
            path_costs,
            ready: BinaryHeap::new(),
            sequence: 0,
            failures: Vec::new(),
        };
        for node in order {
            if !scheduler.remaining.contains_key(&node) {
                scheduler.push_ready(node);
            }
        }
        scheduler
    }

    fn push_ready(&mut self, node: N) {
        let path_cost = self.path_costs.get(&node).copied().unwrap_or(0);
        self.ready.push(Ready { path_cost, sequence: self.sequence, node });
        self.sequence += 1;
    }

    /// Pops up to `max` ready nodes in descending path-cost order.
    ///
    /// When the scheduler has pending work and nothing is in flight, this is
    /// guaranteed to return at least one node.
    pub fn next(&mut self, max: usize) -> Vec<N> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.ready.pop() {
                Some(ready) => batch.push(ready.node),
                None => break,
            }
        }
        batch
    }

    /// Records the outcome of a node handed out by [`Scheduler::next`].
    ///
    /// Success promotes dependents whose remaining dependencies empty out;
    /// failure records the error and evicts every transitive dependent.
    pub fn complete(&mut self, node: &N, result: Option<String>) {
        match result {
            None => {
                for dependent in self.reverse.get(node).cloned().unwrap_or_default() {
                    let empty = match self.remaining.get_mut(&dependent) {
                        Some(waiting) => {
                            waiting.remove(node);
                            waiting.is_empty()
                        }
                        None => false,
                    };
                    if empty {
                        self.remaining.remove(&dependent);
                        self.push_ready(dependent);
                    }
                }
            }
            Some(message) => {
                self.failures.push((node.clone(), message));
                self.evict_dependents(node);
            }
        }
    }

    fn evict_dependents(&mut self, node: &N) {
        for dependent in self.reverse.get(node).cloned().unwrap_or_default() {
            if self.remaining.remove(&dependent).is_some() {
                self.evict_dependents(&dependent);
            }
        }
    }

    /// True while anything is ready or still waiting on dependencies.
    pub fn has_pending(&self) -> bool {
        !self.ready.is_empty() || !self.remaining.is_empty()
    }

    /// Failures accumulated so far, in completion order.
    pub fn failures(&self) -> &[(N, String)] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<(N, String)> {
        self.failures
    }

    #[cfg(test)]
    pub(crate) fn path_cost(&self, node: &N) -> u64 {
        self.path_costs.get(node).copied().unwrap_or(0)
    }
}
