//! Per-layer filament ordering used as the flush cost oracle.
//!
//! Every candidate grouping is priced by walking the layers of the print and
//! sequencing, independently on each extruder, the filaments that extruder
//! has to print in that layer. The purge volume of the cheapest sequence is
//! the cost of the grouping.
//!
//! ## Ordering strategies
//!
//! - Both the current and next layer use at most [`MAX_FORECAST_FILAMENTS`]
//!   filaments: exhaustive search over both layers, so the order chosen for
//!   this layer also leaves a cheap start for the next one.
//! - Up to [`MAX_EXACT_FILAMENTS`] filaments: shortest Hamiltonian path via
//!   dynamic programming over subsets.
//! - Otherwise: greedy nearest neighbour.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// Constants
// ============================================================================

/// Layers using at most this many filaments are ordered with a one layer
/// forecast.
pub const MAX_FORECAST_FILAMENTS: usize = 5;

/// Largest layer ordered exactly with the subset DP.
pub const MAX_EXACT_FILAMENTS: usize = 20;

/// Volume reported for lookups outside the matrix (mm³).
const DEFAULT_FLUSH_VOLUME: f32 = 140.0;

/// Caller supplied print sequence for a layer, as 1-based filament ids.
///
/// Returning `None` (or an empty list) lets the optimizer order the layer.
pub type CustomSequenceFn = dyn Fn(usize) -> Option<Vec<usize>>;

// ============================================================================
// Flush Matrix
// ============================================================================

/// Square matrix of purge volumes, indexed `[from][to]` by filament index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlushMatrix {
    volumes: Vec<Vec<f32>>,
}

impl FlushMatrix {
    /// Create a matrix filled with `default_volume` and a zero diagonal.
    pub fn new(size: usize, default_volume: f32) -> Self {
        let mut volumes = vec![vec![default_volume; size]; size];
        for (i, row) in volumes.iter_mut().enumerate() {
            row[i] = 0.0;
        }
        Self { volumes }
    }

    /// Create from a flat row-major slice of `size * size` values.
    pub fn from_flat(size: usize, values: &[f32]) -> Self {
        debug_assert!(values.len() >= size * size);
        let volumes = (0..size)
            .map(|i| {
                (0..size)
                    .map(|j| values.get(i * size + j).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        Self { volumes }
    }

    /// Create from explicit rows.
    pub fn from_rows(volumes: Vec<Vec<f32>>) -> Self {
        Self { volumes }
    }

    /// Flush volume when switching from `from` to `to`.
    pub fn get(&self, from: usize, to: usize) -> f32 {
        match self.volumes.get(from).and_then(|row| row.get(to)) {
            Some(volume) => *volume,
            None => {
                debug_assert!(false, "flush lookup ({}, {}) out of range", from, to);
                DEFAULT_FLUSH_VOLUME
            }
        }
    }

    pub fn set(&mut self, from: usize, to: usize, volume: f32) {
        if let Some(cell) = self.volumes.get_mut(from).and_then(|row| row.get_mut(to)) {
            *cell = volume;
        }
    }

    /// Number of filaments covered.
    pub fn size(&self) -> usize {
        self.volumes.len()
    }

    /// Whether every row has `size()` columns.
    pub fn is_square(&self) -> bool {
        let n = self.volumes.len();
        self.volumes.iter().all(|row| row.len() == n)
    }

    /// Total flush for printing `sequence` in order, starting from `start`.
    pub fn total_flush_for_sequence(&self, start: Option<usize>, sequence: &[usize]) -> f64 {
        let mut prev = start;
        let mut total = 0.0;
        for &filament in sequence {
            if let Some(p) = prev {
                total += self.get(p, filament) as f64;
            }
            prev = Some(filament);
        }
        total
    }
}

// ============================================================================
// Single Layer Ordering
// ============================================================================

/// Best print order of the filaments of one layer on a single nozzle.
///
/// Returns the order and its flush cost, counting the switch from `start`
/// into the first filament.
pub fn get_extruders_order(
    flush: &FlushMatrix,
    curr_layer: &[usize],
    next_layer: &[usize],
    start: Option<usize>,
    use_forecast: bool,
) -> (Vec<usize>, f64) {
    match curr_layer.len() {
        0 => (Vec::new(), 0.0),
        1 => {
            let cost = start.map_or(0.0, |s| flush.get(s, curr_layer[0]) as f64);
            (curr_layer.to_vec(), cost)
        }
        _ if use_forecast => order_with_forecast(flush, curr_layer, next_layer, start),
        n if n <= MAX_EXACT_FILAMENTS => order_exact(flush, curr_layer, start),
        _ => order_greedy(flush, curr_layer, start),
    }
}

/// All permutations of `items`, in lexicographic order of positions.
pub fn generate_all_orderings(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }

    let mut result = Vec::new();
    for (i, &first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut perm in generate_all_orderings(&rest) {
            let mut ordering = vec![first];
            ordering.append(&mut perm);
            result.push(ordering);
        }
    }
    result
}

fn change_count(start: Option<usize>, curr: &[usize], next: &[usize]) -> usize {
    let mut prev = start;
    let mut count = 0;
    for &f in curr.iter().chain(next.iter()) {
        if prev.is_some_and(|p| p != f) {
            count += 1;
        }
        prev = Some(f);
    }
    count
}

fn order_with_forecast(
    flush: &FlushMatrix,
    curr_layer: &[usize],
    next_layer: &[usize],
    start: Option<usize>,
) -> (Vec<usize>, f64) {
    let mut curr_sorted = curr_layer.to_vec();
    curr_sorted.sort_unstable();
    let mut next_sorted = next_layer.to_vec();
    next_sorted.sort_unstable();
    let next_orderings = generate_all_orderings(&next_sorted);

    let mut best_cost = f64::MAX;
    let mut best_changes = usize::MAX;
    let mut best_seq = curr_sorted.clone();

    for curr in generate_all_orderings(&curr_sorted) {
        let curr_cost = flush.total_flush_for_sequence(start, &curr);
        if curr_cost > best_cost {
            continue;
        }
        let last = curr.last().copied();
        for next in &next_orderings {
            let total = curr_cost + flush.total_flush_for_sequence(last, next);
            let changes = change_count(start, &curr, next);
            if total < best_cost || (total == best_cost && changes < best_changes) {
                best_cost = total;
                best_changes = changes;
                best_seq = curr.clone();
            }
        }
    }

    let cost = flush.total_flush_for_sequence(start, &best_seq);
    (best_seq, cost)
}

/// Shortest Hamiltonian path through the layer, anchored at `start`.
fn order_exact(
    flush: &FlushMatrix,
    curr_layer: &[usize],
    start: Option<usize>,
) -> (Vec<usize>, f64) {
    let mut nodes = curr_layer.to_vec();
    let mut start_added = false;
    let start_id = match start {
        Some(s) => {
            match nodes.iter().position(|&f| f == s) {
                Some(pos) => nodes.swap(0, pos),
                None => {
                    nodes.insert(0, s);
                    start_added = true;
                }
            }
            s
        }
        None => nodes[0],
    };

    let n = nodes.len();
    let states = 1usize << n;
    let full = states - 1;
    let mut cache = vec![vec![f64::INFINITY; n]; states];
    let mut prev: Vec<Vec<Option<usize>>> = vec![vec![None; n]; states];
    cache[1][0] = 0.0;

    for state in (1..states).filter(|s| s & 1 == 1) {
        for target in (0..n).filter(|t| state >> t & 1 == 1) {
            let without = state - (1 << target);
            for mid in (0..n).filter(|m| state >> m & 1 == 1) {
                let candidate = cache[without][mid] + flush.get(nodes[mid], nodes[target]) as f64;
                if cache[state][target] > candidate {
                    cache[state][target] = candidate;
                    prev[state][target] = Some(mid);
                }
            }
        }
    }

    let mut cost = f64::MAX;
    let mut final_dst = 0;
    for dst in 0..n {
        if nodes[dst] != start_id && cost > cache[full][dst] {
            cost = cache[full][dst];
            final_dst = dst;
        }
    }

    let mut path = Vec::with_capacity(n);
    let mut state = full;
    let mut point = Some(final_dst);
    while let Some(p) = point {
        path.push(nodes[p]);
        point = prev[state][p];
        state -= 1 << p;
    }
    if start_added {
        path.pop();
    }
    path.reverse();
    (path, cost)
}

fn order_greedy(
    flush: &FlushMatrix,
    curr_layer: &[usize],
    start: Option<usize>,
) -> (Vec<usize>, f64) {
    let mut visited = vec![false; curr_layer.len()];
    let mut sequence = Vec::with_capacity(curr_layer.len());
    let mut prev = start.unwrap_or(curr_layer[0]);
    let mut cost = 0.0;

    for _ in 0..curr_layer.len() {
        let mut target: Option<(usize, f32)> = None;
        for (k, &f) in curr_layer.iter().enumerate() {
            if visited[k] {
                continue;
            }
            let volume = flush.get(prev, f);
            let better = match target {
                None => true,
                Some((_, best)) => volume < best || (volume == best && prev == f),
            };
            if better {
                target = Some((k, volume));
            }
        }
        let Some((k, volume)) = target else { break };
        visited[k] = true;
        cost += volume as f64;
        sequence.push(curr_layer[k]);
        prev = curr_layer[k];
    }
    (sequence, cost)
}

// ============================================================================
// Whole Print Reordering
// ============================================================================

/// Resolve a caller supplied 1-based sequence into filaments of `layer`.
fn resolve_custom_sequence(layer: &[usize], custom: &[usize]) -> Vec<usize> {
    custom
        .iter()
        .filter_map(|&id| id.checked_sub(1))
        .filter(|f| layer.contains(f))
        .collect()
}

fn filter_in_group(group: &HashSet<usize>, layer: &[usize]) -> Vec<usize> {
    layer.iter().copied().filter(|f| group.contains(f)).collect()
}

type OrderCacheKey = (Vec<usize>, Vec<usize>, Option<usize>);

/// Total flush volume of a grouping over the whole print.
///
/// `filaments[i]` is assigned to extruder `filament_maps[i]`; each extruder is
/// sequenced independently using `flush_matrices[extruder]`. Layers for
/// which `custom_sequence` yields an order are printed in that order.
pub fn reorder_filaments_for_minimum_flush_volume(
    filaments: &[usize],
    filament_maps: &[usize],
    layer_filaments: &[Vec<usize>],
    flush_matrices: &[FlushMatrix],
    custom_sequence: Option<&CustomSequenceFn>,
) -> f64 {
    debug_assert_eq!(filaments.len(), filament_maps.len());

    let mut groups: Vec<HashSet<usize>> = vec![HashSet::new(); flush_matrices.len()];
    for (&filament, &extruder) in filaments.iter().zip(filament_maps) {
        if let Some(group) = groups.get_mut(extruder) {
            group.insert(filament);
        }
    }

    let custom_layers: HashMap<usize, Vec<usize>> = match custom_sequence {
        Some(get_sequence) => layer_filaments
            .iter()
            .enumerate()
            .filter_map(|(layer, lf)| {
                let custom = get_sequence(layer)?;
                let resolved = resolve_custom_sequence(lf, &custom);
                (!resolved.is_empty()).then_some((layer, resolved))
            })
            .collect(),
        None => HashMap::new(),
    };

    let mut cost = 0.0;
    for (extruder, group) in groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let flush = &flush_matrices[extruder];
        let mut current: Option<usize> = None;
        let mut cache: HashMap<OrderCacheKey, (Vec<usize>, f64)> = HashMap::new();

        for (layer, lf) in layer_filaments.iter().enumerate() {
            if let Some(custom) = custom_layers.get(&layer) {
                let in_group = filter_in_group(group, custom);
                cost += flush.total_flush_for_sequence(current, &in_group);
                if let Some(&last) = in_group.last() {
                    current = Some(last);
                }
                continue;
            }

            let used = filter_in_group(group, lf);
            let used_next = layer_filaments
                .get(layer + 1)
                .map(|next| filter_in_group(group, next))
                .unwrap_or_default();
            let use_forecast =
                used.len() <= MAX_FORECAST_FILAMENTS && used_next.len() <= MAX_FORECAST_FILAMENTS;

            let mut key_curr = used.clone();
            key_curr.sort_unstable();
            let mut key_next = if use_forecast { used_next.clone() } else { Vec::new() };
            key_next.sort_unstable();
            let key = (key_curr, key_next, current);

            let (sequence, layer_cost) = match cache.get(&key) {
                Some(hit) => hit.clone(),
                None => {
                    let computed = get_extruders_order(flush, &used, &used_next, current, use_forecast);
                    cache.insert(key, computed.clone());
                    computed
                }
            };

            if let Some(&last) = sequence.last() {
                current = Some(last);
            }
            cost += layer_cost;
        }
    }

    cost
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cluster_matrix() -> FlushMatrix {
        // {0,1} and {2,3} are cheap within, expensive across
        let mut m = FlushMatrix::new(4, 500.0);
        m.set(0, 1, 10.0);
        m.set(1, 0, 10.0);
        m.set(2, 3, 10.0);
        m.set(3, 2, 10.0);
        m
    }

    #[test]
    fn test_flush_matrix() {
        let mut matrix = FlushMatrix::new(4, 100.0);
        assert_eq!(matrix.get(0, 1), 100.0);
        assert_eq!(matrix.get(2, 2), 0.0);

        matrix.set(0, 1, 150.0);
        assert_eq!(matrix.get(0, 1), 150.0);
        assert_eq!(matrix.size(), 4);
        assert!(matrix.is_square());
    }

    #[test]
    fn test_flush_matrix_from_flat() {
        let values = vec![0.0, 100.0, 150.0, 100.0, 0.0, 120.0, 150.0, 120.0, 0.0];
        let matrix = FlushMatrix::from_flat(3, &values);
        assert_eq!(matrix.get(0, 1), 100.0);
        assert_eq!(matrix.get(1, 2), 120.0);
        assert_eq!(matrix.get(2, 0), 150.0);
    }

    #[test]
    fn test_flush_matrix_serde_is_nested_rows() {
        let matrix = FlushMatrix::from_rows(vec![vec![0.0, 1.5], vec![2.0, 0.0]]);
        let json = serde_json::to_string(&matrix).unwrap();
        assert_eq!(json, "[[0.0,1.5],[2.0,0.0]]");
        let back: FlushMatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, matrix);
    }

    #[test]
    fn test_total_flush_for_sequence() {
        let m = two_cluster_matrix();
        assert_eq!(m.total_flush_for_sequence(None, &[0, 1]), 10.0);
        assert_eq!(m.total_flush_for_sequence(Some(2), &[0, 1]), 510.0);
        assert_eq!(m.total_flush_for_sequence(Some(2), &[]), 0.0);
    }

    #[test]
    fn test_generate_all_orderings() {
        let orderings = generate_all_orderings(&[1, 2, 3]);
        assert_eq!(orderings.len(), 6);
        assert_eq!(orderings[0], vec![1, 2, 3]);
        assert_eq!(orderings[5], vec![3, 2, 1]);
    }

    #[test]
    fn test_order_trivial_layers() {
        let m = two_cluster_matrix();
        assert_eq!(get_extruders_order(&m, &[], &[], Some(0), true), (vec![], 0.0));
        assert_eq!(get_extruders_order(&m, &[2], &[], Some(0), true), (vec![2], 500.0));
        assert_eq!(get_extruders_order(&m, &[2], &[], None, true), (vec![2], 0.0));
    }

    #[test]
    fn test_exact_order_follows_cheap_edges() {
        let m = two_cluster_matrix();
        let (seq, cost) = get_extruders_order(&m, &[2, 0, 3, 1], &[], Some(1), false);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0], 1);
        assert_eq!(seq[1], 0);
        // 1->0 (10) + 0->{2|3} (500) + inside {2,3} (10)
        assert_eq!(cost, 520.0);
    }

    #[test]
    fn test_exact_order_with_outside_start() {
        let m = two_cluster_matrix();
        let (seq, cost) = get_extruders_order(&m, &[1, 0], &[], Some(3), false);
        assert_eq!(seq.len(), 2);
        assert!(!seq.contains(&3));
        assert_eq!(cost, 510.0);
    }

    #[test]
    fn test_forecast_matches_exact_cost() {
        let m = two_cluster_matrix();
        let (seq, cost) = get_extruders_order(&m, &[3, 0, 1], &[2], Some(0), true);
        assert_eq!(seq[0], 0);
        // 0->1 (10), 1->3 (500), next layer 3->2 (10)
        assert_eq!(seq, vec![0, 1, 3]);
        assert_eq!(cost, 510.0);
    }

    #[test]
    fn test_greedy_order() {
        let m = two_cluster_matrix();
        let (seq, cost) = order_greedy(&m, &[2, 3, 0, 1], Some(0));
        assert_eq!(seq, vec![0, 1, 2, 3]);
        assert_eq!(cost, 520.0);
    }

    #[test]
    fn test_reorder_separates_clusters() {
        let m = two_cluster_matrix();
        let matrices = vec![m.clone(), m];
        let layers = vec![vec![0, 1, 2, 3]; 3];
        let filaments = [0, 1, 2, 3];

        let split = reorder_filaments_for_minimum_flush_volume(
            &filaments,
            &[0, 0, 1, 1],
            &layers,
            &matrices,
            None,
        );
        let mixed = reorder_filaments_for_minimum_flush_volume(
            &filaments,
            &[0, 1, 0, 1],
            &layers,
            &matrices,
            None,
        );
        assert!(split < mixed, "split {} should beat mixed {}", split, mixed);
    }

    #[test]
    fn test_reorder_honours_custom_sequence() {
        let m = two_cluster_matrix();
        let matrices = vec![m];
        let layers = vec![vec![0, 1, 2]];
        let custom = |layer: usize| (layer == 0).then(|| vec![1, 3, 2]);

        let cost = reorder_filaments_for_minimum_flush_volume(
            &[0, 1, 2],
            &[0, 0, 0],
            &layers,
            &matrices,
            Some(&custom),
        );
        // 0 -> 2 -> 1 as forced
        assert_eq!(cost, 1000.0);
    }
}
