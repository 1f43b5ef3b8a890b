//! Constrained bipartite assignment on top of max-flow / min-cost max-flow.
//!
//! Every solver in this module builds the same layered network:
//!
//! ```text
//! source -> left nodes -> right nodes -> [group nodes] -> sink
//! ```
//!
//! - source to each left node: left capacity (default 1)
//! - left to right: capacity 1, cost `matrix[left][right]`, omitted when the
//!   pair is unlinked (or not in the left node's link list)
//! - right node to its group node, or straight to the sink: right capacity
//! - group node to sink: group capacity
//!
//! The result maps each left position to the value of the right node it was
//! matched with, or `None` when no feasible match exists under the given
//! capacities and limits. `None` is an expected outcome, not an error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ============================================================================
// Constants
// ============================================================================

/// Float costs are scaled by this factor and rounded to integers.
pub const COST_SCALE: f64 = 1000.0;

const INF: i64 = i64::MAX / 4;

/// Allowed or forbidden right positions, keyed by left position.
pub type LinkLimits = BTreeMap<usize, Vec<usize>>;

/// A set of right positions sharing one capacity.
pub type GroupCapacity = (BTreeSet<usize>, usize);

fn to_capacity(value: usize) -> i64 {
    i64::try_from(value).map_or(INF, |v| v.min(INF))
}

fn to_cost(value: f64) -> i64 {
    if value.is_finite() {
        (value * COST_SCALE).round() as i64
    } else {
        INF / 1024
    }
}

// ============================================================================
// Flow Graph
// ============================================================================

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    capacity: i64,
    cost: i64,
    flow: i64,
}

/// Residual flow graph with paired forward/backward edges.
///
/// Edge `e ^ 1` is always the reverse of edge `e`.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    edges: Vec<Edge>,
    adj: Vec<Vec<usize>>,
    left_count: usize,
    right_count: usize,
    source: usize,
    sink: usize,
}

impl FlowGraph {
    fn new(left_count: usize, right_count: usize, group_count: usize) -> Self {
        let total = left_count + right_count + group_count + 2;
        Self {
            edges: Vec::new(),
            adj: vec![Vec::new(); total],
            left_count,
            right_count,
            source: total - 2,
            sink: total - 1,
        }
    }

    fn right_node(&self, pos: usize) -> usize {
        self.left_count + pos
    }

    fn group_node(&self, gid: usize) -> usize {
        self.left_count + self.right_count + gid
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: i64, cost: i64) {
        self.adj[from].push(self.edges.len());
        self.edges.push(Edge { from, to, capacity, cost, flow: 0 });
        self.adj[to].push(self.edges.len());
        self.edges.push(Edge { from: to, to: from, capacity: 0, cost: -cost, flow: 0 });
    }

    /// Edmonds-Karp: augment along BFS paths until none remain.
    fn run_max_flow(&mut self) {
        let total = self.adj.len();
        let mut previous = vec![0usize; total];
        loop {
            let mut augment = vec![0i64; total];
            augment[self.source] = INF;
            let mut queue = VecDeque::from([self.source]);

            while let Some(from) = queue.pop_front() {
                for &eid in &self.adj[from] {
                    let e = &self.edges[eid];
                    if augment[e.to] == 0 && e.to != self.source && e.capacity > e.flow {
                        previous[e.to] = eid;
                        augment[e.to] = augment[from].min(e.capacity - e.flow);
                        queue.push_back(e.to);
                    }
                }
                if augment[self.sink] != 0 {
                    break;
                }
            }

            let pushed = augment[self.sink];
            if pushed == 0 {
                break;
            }
            self.push_along(&previous, pushed);
        }
    }

    /// Successive shortest paths with SPFA (Bellman-Ford queue variant).
    fn run_min_cost_max_flow(&mut self) {
        let total = self.adj.len();
        loop {
            let mut dist = vec![INF; total];
            let mut bottleneck = vec![INF; total];
            let mut previous = vec![0usize; total];
            let mut in_queue = vec![false; total];
            let mut queue = VecDeque::from([self.source]);
            dist[self.source] = 0;
            in_queue[self.source] = true;

            while let Some(at) = queue.pop_front() {
                in_queue[at] = false;
                for &eid in &self.adj[at] {
                    let e = &self.edges[eid];
                    if e.flow < e.capacity && dist[e.to] > dist[at] + e.cost {
                        dist[e.to] = dist[at] + e.cost;
                        previous[e.to] = eid;
                        bottleneck[e.to] = bottleneck[at].min(e.capacity - e.flow);
                        if !in_queue[e.to] {
                            queue.push_back(e.to);
                            in_queue[e.to] = true;
                        }
                    }
                }
            }

            if dist[self.sink] == INF {
                break;
            }
            let pushed = bottleneck[self.sink];
            self.push_along(&previous, pushed);
        }
    }

    fn push_along(&mut self, previous: &[usize], amount: i64) {
        let mut at = self.sink;
        while at != self.source {
            let eid = previous[at];
            self.edges[eid].flow += amount;
            self.edges[eid ^ 1].flow -= amount;
            at = self.edges[eid].from;
        }
    }

    /// Right position matched to each left position.
    fn matched_positions(&self) -> Vec<Option<usize>> {
        let right_range = self.left_count..self.left_count + self.right_count;
        (0..self.left_count)
            .map(|u| {
                self.adj[u]
                    .iter()
                    .map(|&eid| &self.edges[eid])
                    .filter(|e| e.flow > 0 && right_range.contains(&e.to))
                    .map(|e| e.to - self.left_count)
                    .last()
            })
            .collect()
    }
}

// ============================================================================
// Network Description
// ============================================================================

/// Description of a constrained bipartite assignment problem.
///
/// `left` and `right` hold node values (indices into the cost matrix);
/// limits and capacities are expressed by position in those lists.
#[derive(Debug, Clone, Default)]
pub struct BipartiteNetwork {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    /// Left position -> the only right positions it may link to.
    pub link_limits: LinkLimits,
    /// Left position -> right positions it must never link to.
    pub unlink_limits: LinkLimits,
    /// Empty means capacity 1 for every left node.
    pub left_capacity: Vec<usize>,
    /// Empty means capacity 1 for every right node.
    pub right_capacity: Vec<usize>,
    pub group_capacity: Vec<GroupCapacity>,
}

impl BipartiteNetwork {
    pub fn new(left: Vec<usize>, right: Vec<usize>) -> Self {
        Self {
            left,
            right,
            ..Default::default()
        }
    }

    pub fn with_link_limits(mut self, limits: LinkLimits) -> Self {
        self.link_limits = limits;
        self
    }

    pub fn with_unlink_limits(mut self, limits: LinkLimits) -> Self {
        self.unlink_limits = limits;
        self
    }

    pub fn with_left_capacity(mut self, capacity: Vec<usize>) -> Self {
        self.left_capacity = capacity;
        self
    }

    pub fn with_right_capacity(mut self, capacity: Vec<usize>) -> Self {
        self.right_capacity = capacity;
        self
    }

    pub fn with_group_capacity(mut self, capacity: Vec<GroupCapacity>) -> Self {
        self.group_capacity = capacity;
        self
    }

    /// Right positions left position `l` may be linked to.
    fn allowed_right(&self, l: usize) -> Vec<usize> {
        if let Some(allowed) = self.link_limits.get(&l) {
            return allowed.iter().copied().filter(|&r| r < self.right.len()).collect();
        }
        let forbidden = self.unlink_limits.get(&l);
        (0..self.right.len())
            .filter(|r| forbidden.map_or(true, |f| !f.contains(r)))
            .collect()
    }

    fn build_graph<F>(&self, cost_of: F) -> FlowGraph
    where
        F: Fn(usize, usize) -> i64,
    {
        debug_assert!(self.left_capacity.is_empty() || self.left_capacity.len() == self.left.len());
        debug_assert!(self.right_capacity.is_empty() || self.right_capacity.len() == self.right.len());

        let mut graph = FlowGraph::new(self.left.len(), self.right.len(), self.group_capacity.len());

        let mut right_target = vec![graph.sink; self.right.len()];
        for (gid, (members, _)) in self.group_capacity.iter().enumerate() {
            for &r in members {
                if let Some(target) = right_target.get_mut(r) {
                    *target = graph.group_node(gid);
                }
            }
        }

        for l in 0..self.left.len() {
            let capacity = self.left_capacity.get(l).copied().unwrap_or(1);
            graph.add_edge(graph.source, l, to_capacity(capacity), 0);
        }
        for (r, &target) in right_target.iter().enumerate() {
            let capacity = self.right_capacity.get(r).copied().unwrap_or(1);
            let node = graph.right_node(r);
            graph.add_edge(node, target, to_capacity(capacity), 0);
        }
        for (gid, (_, capacity)) in self.group_capacity.iter().enumerate() {
            let node = graph.group_node(gid);
            graph.add_edge(node, graph.sink, to_capacity(*capacity), 0);
        }
        for l in 0..self.left.len() {
            for r in self.allowed_right(l) {
                let node = graph.right_node(r);
                graph.add_edge(l, node, 1, cost_of(l, r));
            }
        }
        graph
    }

    fn to_values(&self, positions: Vec<Option<usize>>) -> Vec<Option<usize>> {
        positions
            .into_iter()
            .map(|p| p.and_then(|r| self.right.get(r).copied()))
            .collect()
    }
}

// ============================================================================
// Solvers
// ============================================================================

/// A bipartite assignment strategy.
///
/// Returns, for each left position, the matched right node value or `None`.
pub trait AssignmentSolver {
    fn solve(&self) -> Vec<Option<usize>>;
}

/// Feasibility only: any maximum matching that honours the limits.
#[derive(Debug, Clone)]
pub struct MaxFlowSolver {
    network: BipartiteNetwork,
}

impl MaxFlowSolver {
    pub fn new(network: BipartiteNetwork) -> Self {
        Self { network }
    }
}

impl AssignmentSolver for MaxFlowSolver {
    fn solve(&self) -> Vec<Option<usize>> {
        let mut graph = self.network.build_graph(|_, _| 0);
        graph.run_max_flow();
        self.network.to_values(graph.matched_positions())
    }
}

/// Minimum cost maximum matching with node and group capacities.
#[derive(Debug, Clone)]
pub struct MinFlushFlowSolver<'a> {
    network: BipartiteNetwork,
    matrix: &'a [Vec<f64>],
}

impl<'a> MinFlushFlowSolver<'a> {
    /// `matrix[left value][right value]` is the cost of a link.
    pub fn new(network: BipartiteNetwork, matrix: &'a [Vec<f64>]) -> Self {
        Self { network, matrix }
    }
}

fn matrix_cost(matrix: &[Vec<f64>], network: &BipartiteNetwork, l: usize, r: usize) -> i64 {
    let value = matrix
        .get(network.left[l])
        .and_then(|row| row.get(network.right[r]))
        .copied();
    debug_assert!(value.is_some(), "cost matrix does not cover ({}, {})", l, r);
    to_cost(value.unwrap_or(0.0))
}

impl AssignmentSolver for MinFlushFlowSolver<'_> {
    fn solve(&self) -> Vec<Option<usize>> {
        let mut graph = self
            .network
            .build_graph(|l, r| matrix_cost(self.matrix, &self.network, l, r));
        graph.run_min_cost_max_flow();
        self.network.to_values(graph.matched_positions())
    }
}

/// Minimum cost matching of filaments to loaded materials.
///
/// Every right node gets its own capacity; there are no link lists or group
/// capacities.
#[derive(Debug, Clone)]
pub struct MatchModeGroupSolver<'a> {
    inner: MinFlushFlowSolver<'a>,
}

impl<'a> MatchModeGroupSolver<'a> {
    pub fn new(
        matrix: &'a [Vec<f64>],
        left: Vec<usize>,
        right: Vec<usize>,
        right_capacity: Vec<usize>,
        unlink_limits: LinkLimits,
    ) -> Self {
        debug_assert_eq!(right.len(), right_capacity.len());
        let network = BipartiteNetwork::new(left, right)
            .with_right_capacity(right_capacity)
            .with_unlink_limits(unlink_limits);
        Self {
            inner: MinFlushFlowSolver::new(network, matrix),
        }
    }
}

impl AssignmentSolver for MatchModeGroupSolver<'_> {
    fn solve(&self) -> Vec<Option<usize>> {
        self.inner.solve()
    }
}

// ============================================================================
// Tests
// ============================================================================
