//! Partitioning Around Medoids for filament grouping.
//!
//! [`KMedoids2`] splits used filaments between two extruders by trying every
//! ordered medoid pair. [`KMedoids`] handles an arbitrary number of clusters
//! (nozzles) with seeded random restarts and a swap search, delegating label
//! assignment to the min-cost flow solver so capacities and placement limits
//! are honoured.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::context::{FilamentGroupContext, GroupStrategy, DEFAULT_CLUSTER_SIZE};
use super::distance::{evaluate_score, FlushDistanceEvaluator};
use super::memory::{MemoryedGroup, MemoryedGroups, ABSOLUTE_FLUSH_GAP_TOLERANCE};
use super::utils::{UnplaceableLimits, UnplaceableSets};
use crate::flow_network::{
    AssignmentSolver, BipartiteNetwork, GroupCapacity, MaxFlowSolver, MinFlushFlowSolver,
};
use crate::nozzle::{estimate_extruder_filament_change_count, MultiNozzleGroupResult, NozzleVolumeType};

/// Prefer level used for every candidate found by the medoid searches.
const SEARCH_PREFER_LEVEL: i64 = 1;

const WEIGHT_FOR_PLACEABLE: i64 = 10_000;
const WEIGHT_FOR_EXTRUDER_FILAMENTS: i64 = 100;
const WEIGHT_FOR_NOZZLE_TYPE: i64 = 1;

fn other_cluster(gid: usize) -> usize {
    debug_assert!(gid < 2, "two-way clustering got cluster {}", gid);
    if gid == 0 {
        1
    } else {
        0
    }
}

// ============================================================================
// Two-way Clustering
// ============================================================================

/// Two-cluster PAM over used filaments.
#[derive(Debug, Clone)]
pub struct KMedoids2<'a> {
    evaluator: &'a FlushDistanceEvaluator,
    elem_count: usize,
    default_group: usize,
    max_cluster_size: Vec<usize>,
    /// Element -> the cluster it may not join.
    unplaceable_limits: UnplaceableLimits,
    memoryed_groups: MemoryedGroups,
    cluster_labels: Vec<usize>,
}

impl<'a> KMedoids2<'a> {
    pub fn new(elem_count: usize, evaluator: &'a FlushDistanceEvaluator, default_group: usize) -> Self {
        Self {
            evaluator,
            elem_count,
            default_group,
            max_cluster_size: vec![DEFAULT_CLUSTER_SIZE; 2],
            unplaceable_limits: UnplaceableLimits::new(),
            memoryed_groups: MemoryedGroups::new(0.0),
            cluster_labels: Vec::new(),
        }
    }

    pub fn with_max_cluster_size(mut self, sizes: Vec<usize>) -> Self {
        self.max_cluster_size = sizes;
        self
    }

    pub fn with_unplaceable_limits(mut self, limits: UnplaceableLimits) -> Self {
        self.unplaceable_limits = limits;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memoryed_groups = MemoryedGroups::new(threshold);
        self
    }

    pub fn cluster_labels(&self) -> &[usize] {
        &self.cluster_labels
    }

    pub fn memoryed_groups(&self) -> &MemoryedGroups {
        &self.memoryed_groups
    }

    fn cluster_size(&self, gid: usize) -> usize {
        self.max_cluster_size.get(gid).copied().unwrap_or(DEFAULT_CLUSTER_SIZE)
    }

    fn forbidden(&self, elem: usize) -> Option<usize> {
        self.unplaceable_limits.get(&elem).copied()
    }

    /// Limited elements go to their allowed cluster, the rest fill clusters
    /// in order while room is left.
    fn cluster_small_data(&self) -> Vec<usize> {
        let mut sizes = [self.cluster_size(0), self.cluster_size(1)];
        let mut labels: Vec<Option<usize>> = vec![None; self.elem_count];

        for (&elem, &forbidden) in &self.unplaceable_limits {
            if let Some(label @ None) = labels.get_mut(elem) {
                let gid = other_cluster(forbidden);
                *label = Some(gid);
                sizes[gid] = sizes[gid].saturating_sub(1);
            }
        }

        labels
            .into_iter()
            .map(|label| {
                label.unwrap_or_else(|| match sizes.iter().position(|&s| s > 0) {
                    Some(gid) => {
                        sizes[gid] -= 1;
                        gid
                    }
                    None => self.default_group,
                })
            })
            .collect()
    }

    fn assign_cluster_label(&self, centers: [usize; 2], strategy: GroupStrategy) -> Vec<usize> {
        let mut sizes = [self.cluster_size(0), self.cluster_size(1)];
        let mut groups: [BTreeSet<usize>; 2] = [BTreeSet::new(), BTreeSet::new()];
        // (elem, distance to center 0 minus distance to center 1)
        let mut gaps: Vec<(usize, f64)> = Vec::with_capacity(self.elem_count);

        for i in 0..self.elem_count {
            if let Some(forbidden) = self.forbidden(i) {
                let gid = other_cluster(forbidden);
                groups[gid].insert(i);
                sizes[gid] = sizes[gid].saturating_sub(1);
                continue;
            }
            let d0 = self.evaluator.distance(i, centers[0], 0);
            let d1 = self.evaluator.distance(i, centers[1], 1);
            gaps.push((i, d0 - d1));
        }
        gaps.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let enough = gaps.len() <= sizes[0].saturating_add(sizes[1]);
        for (elem, gap) in gaps {
            let closer = if gap <= 0.0 { 0 } else { 1 };
            let gid = if enough || strategy == GroupStrategy::BestFit {
                let (full0, full1) = (groups[0].len() >= sizes[0], groups[1].len() >= sizes[1]);
                if !full0 && (gap <= 0.0 || full1) {
                    0
                } else if !full1 && (gap > 0.0 || full0) {
                    1
                } else {
                    closer
                }
            } else {
                closer
            };
            groups[gid].insert(elem);
        }

        let mut labels = vec![0; self.elem_count];
        for &f in &groups[1] {
            labels[f] = 1;
        }
        labels
    }

    fn calc_cost(&self, labels: &[usize], medoids: [usize; 2]) -> f64 {
        labels
            .iter()
            .enumerate()
            .map(|(i, &label)| self.evaluator.distance(i, medoids[label], label))
            .sum()
    }

    /// Run the search until every medoid pair was tried or `timeout` passed.
    #[instrument(skip(self), fields(elements = self.elem_count))]
    pub fn do_clustering(&mut self, strategy: GroupStrategy, timeout: Duration) {
        let start = Instant::now();

        let mut best: Option<(f64, Vec<usize>)> = None;
        if self.elem_count >= 2 {
            'outer: for center_0 in 0..self.elem_count {
                if self.forbidden(center_0) == Some(0) {
                    continue;
                }
                for center_1 in 0..self.elem_count {
                    if center_0 == center_1 || self.forbidden(center_1) == Some(1) {
                        continue;
                    }
                    let centers = [center_0, center_1];
                    let labels = self.assign_cluster_label(centers, strategy);
                    let cost = self.calc_cost(&labels, centers);

                    if best.as_ref().map_or(true, |(best_cost, _)| cost < *best_cost) {
                        best = Some((cost, labels.clone()));
                    }
                    self.memoryed_groups
                        .update(MemoryedGroup::new(labels, cost, SEARCH_PREFER_LEVEL));

                    if start.elapsed() > timeout {
                        debug!("medoid pair search timed out");
                        break 'outer;
                    }
                }
            }
        }

        self.cluster_labels = match best {
            Some((cost, labels)) => {
                debug!(cost, "two-way clustering finished");
                labels
            }
            None => {
                let labels = self.cluster_small_data();
                let mut centers = [None, None];
                for (idx, &label) in labels.iter().enumerate() {
                    if let Some(center @ None) = centers.get_mut(label) {
                        *center = Some(idx);
                    }
                }
                let cost = labels
                    .iter()
                    .enumerate()
                    .map(|(i, &label)| match centers.get(label).copied().flatten() {
                        Some(center) => self.evaluator.distance(i, center, label),
                        None => 0.0,
                    })
                    .sum();
                self.memoryed_groups
                    .update(MemoryedGroup::new(labels.clone(), cost, SEARCH_PREFER_LEVEL));
                labels
            }
        };
    }
}

// ============================================================================
// K-way Clustering
// ============================================================================

/// K-cluster PAM with per-cluster and per-extruder capacities.
#[derive(Debug, Clone)]
pub struct KMedoids<'a> {
    k: usize,
    elem_count: usize,
    evaluator: &'a FlushDistanceEvaluator,
    default_group: usize,
    max_cluster_size: Vec<usize>,
    /// Clusters sharing one extruder and its capacity.
    cluster_group_size: Vec<GroupCapacity>,
    cluster_to_extruder: Vec<usize>,
    /// Element -> the only clusters it may join.
    placeable_limits: UnplaceableSets,
    /// Element -> clusters it may not join.
    unplaceable_limits: UnplaceableSets,
    memoryed_groups: MemoryedGroups,
    cluster_labels: Vec<usize>,
}

impl<'a> KMedoids<'a> {
    pub fn new(k: usize, elem_count: usize, evaluator: &'a FlushDistanceEvaluator, default_group: usize) -> Self {
        Self {
            k,
            elem_count,
            evaluator,
            default_group,
            max_cluster_size: vec![DEFAULT_CLUSTER_SIZE; k],
            cluster_group_size: Vec::new(),
            cluster_to_extruder: vec![0; k],
            placeable_limits: UnplaceableSets::new(),
            unplaceable_limits: UnplaceableSets::new(),
            memoryed_groups: MemoryedGroups::new(0.0),
            cluster_labels: Vec::new(),
        }
    }

    pub fn with_max_cluster_size(mut self, sizes: Vec<usize>) -> Self {
        self.max_cluster_size = sizes;
        self
    }

    /// Group clusters by extruder; group `i` is extruder `i`.
    pub fn with_cluster_group_size(mut self, groups: Vec<GroupCapacity>) -> Self {
        self.cluster_to_extruder = vec![0; self.k];
        for (extruder, (clusters, _)) in groups.iter().enumerate() {
            for &c in clusters {
                if let Some(slot) = self.cluster_to_extruder.get_mut(c) {
                    *slot = extruder;
                }
            }
        }
        self.cluster_group_size = groups;
        self
    }

    pub fn with_placeable_limits(mut self, limits: UnplaceableSets) -> Self {
        self.placeable_limits = limits;
        self
    }

    pub fn with_unplaceable_limits(mut self, limits: UnplaceableSets) -> Self {
        self.unplaceable_limits = limits;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memoryed_groups = MemoryedGroups::new(threshold);
        self
    }

    pub fn cluster_labels(&self) -> &[usize] {
        &self.cluster_labels
    }

    pub fn memoryed_groups(&self) -> &MemoryedGroups {
        &self.memoryed_groups
    }

    fn extruder_of(&self, cluster: usize) -> usize {
        self.cluster_to_extruder.get(cluster).copied().unwrap_or(0)
    }

    fn can_place(&self, elem: usize, cluster: usize) -> bool {
        let allowed = self.placeable_limits.get(&elem).map_or(true, |c| c.contains(&cluster));
        let forbidden = self.unplaceable_limits.get(&elem).map_or(false, |c| c.contains(&cluster));
        allowed && !forbidden
    }

    fn have_enough_size(&self) -> bool {
        let cluster_ok = self.max_cluster_size.is_empty()
            || self.max_cluster_size.iter().fold(0usize, |acc, &s| acc.saturating_add(s)) >= self.elem_count;
        let group_ok = self.cluster_group_size.is_empty()
            || self
                .cluster_group_size
                .iter()
                .fold(0usize, |acc, (_, s)| acc.saturating_add(*s))
                >= self.elem_count;
        cluster_ok && group_ok
    }

    /// Average pairwise distance inside each cluster, scaled by its size.
    fn calc_cost(&self, labels: &[usize], centers: &[Option<usize>]) -> f64 {
        let mut total = 0.0;
        for (cluster, center) in centers.iter().enumerate() {
            if center.is_none() {
                continue;
            }
            let members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == cluster).collect();
            if members.len() < 2 {
                continue;
            }
            let extruder = self.extruder_of(cluster);
            let mut sum = 0.0;
            for (a, &i) in members.iter().enumerate() {
                for &j in &members[a + 1..] {
                    sum += self.evaluator.distance(i, j, extruder);
                }
            }
            let pairs = (members.len() * (members.len() - 1) / 2) as f64;
            if sum > 0.0 {
                total += sum / pairs * (members.len() - 1) as f64;
            }
        }
        total
    }

    /// Pick at most one seed element per cluster, honouring the limits.
    fn init_cluster_center(&self, seed: u64) -> Vec<Option<usize>> {
        let mut order: Vec<usize> = (0..self.elem_count).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let remap = |limits: &UnplaceableSets| -> BTreeMap<usize, Vec<usize>> {
            order
                .iter()
                .enumerate()
                .filter_map(|(pos, elem)| limits.get(elem).map(|c| (pos, c.clone())))
                .collect()
        };
        let network = BipartiteNetwork::new(order.clone(), (0..self.k).collect())
            .with_link_limits(remap(&self.placeable_limits))
            .with_unlink_limits(remap(&self.unplaceable_limits));
        let matched = MaxFlowSolver::new(network).solve();

        let mut centers = vec![None; self.k];
        for (pos, cluster) in matched.into_iter().enumerate() {
            if let Some(center) = cluster.and_then(|c| centers.get_mut(c)) {
                *center = Some(order[pos]);
            }
        }
        centers
    }

    fn assign_cluster_label(&self, centers: &[Option<usize>]) -> Vec<usize> {
        let matrix: Vec<Vec<f64>> = (0..self.elem_count)
            .map(|i| {
                centers
                    .iter()
                    .enumerate()
                    .map(|(cluster, center)| match center {
                        Some(c) => self.evaluator.distance(i, *c, self.extruder_of(cluster)),
                        None => 0.0,
                    })
                    .collect()
            })
            .collect();

        let mut network = BipartiteNetwork::new((0..self.elem_count).collect(), (0..self.k).collect())
            .with_link_limits(self.placeable_limits.clone())
            .with_unlink_limits(self.unplaceable_limits.clone());
        network = if self.have_enough_size() {
            network
                .with_right_capacity(self.max_cluster_size.clone())
                .with_group_capacity(self.cluster_group_size.clone())
        } else {
            network.with_right_capacity(vec![self.elem_count; self.k])
        };

        MinFlushFlowSolver::new(network, &matrix)
            .solve()
            .into_iter()
            .map(|label| label.unwrap_or(self.default_group))
            .collect()
    }

    /// Exhaustive enumeration for at most `k` elements.
    ///
    /// Candidates are ranked by how many elements respect their limits, how
    /// evenly extruders fill their nozzles and how uniform the nozzle volume
    /// types are. Assignments equivalent up to identical nozzles are scored
    /// once.
    fn cluster_small_data(&mut self, ctx: &FilamentGroupContext, used_filaments: &[usize]) -> Option<Vec<usize>> {
        let k = self.k;
        let n = self.elem_count;
        let total = u32::try_from(n).ok().and_then(|n| k.checked_pow(n))?;
        let nozzles = &ctx.nozzle_info.nozzle_list;
        let extruder_count = self.cluster_group_size.len().max(1);
        let extruder_nozzle_num: Vec<usize> = (0..extruder_count)
            .map(|e| self.cluster_group_size.get(e).map_or(0, |(c, _)| c.len()))
            .collect();
        let all_centers = vec![Some(0); k];
        let master = ctx.machine_info.master_extruder_id;

        let mut seen: BTreeSet<Vec<(NozzleVolumeType, usize, Vec<usize>)>> = BTreeSet::new();
        self.memoryed_groups = MemoryedGroups::new(self.memoryed_groups.gap_threshold());

        for mask in 0..total {
            let mut num = mask;
            let mut labels = vec![0usize; n];
            let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            let mut extruder_filaments = vec![0usize; extruder_count];
            let mut used_types: Vec<BTreeMap<NozzleVolumeType, BTreeSet<usize>>> =
                vec![BTreeMap::new(); extruder_count];
            let mut placeable = 0i64;

            for (i, label) in labels.iter_mut().enumerate() {
                let cluster = num % k;
                num /= k;
                *label = cluster;
                members.entry(cluster).or_default().push(i);
                let extruder = self.extruder_of(cluster).min(extruder_count - 1);
                extruder_filaments[extruder] += 1;
                let volume = nozzles.get(cluster).map(|nz| nz.volume_type).unwrap_or_default();
                used_types[extruder].entry(volume).or_default().insert(cluster);
                if self.can_place(i, cluster) {
                    placeable += 1;
                }
            }

            let filled: usize = extruder_filaments
                .iter()
                .zip(&extruder_nozzle_num)
                .map(|(&f, &nz)| f.min(nz))
                .sum();
            let mut uniform = 0i64;
            let mut uniform_types: BTreeSet<NozzleVolumeType> = BTreeSet::new();
            for (extruder, types) in used_types.iter().enumerate() {
                if let Some((volume, set)) = types.iter().next() {
                    if types.len() == 1 && set.len() == extruder_filaments[extruder] {
                        uniform += 1;
                        uniform_types.insert(*volume);
                    }
                }
            }
            if uniform_types.len() == 1 {
                uniform += 1;
            }
            let prefer_level = placeable * WEIGHT_FOR_PLACEABLE
                + filled as i64 * WEIGHT_FOR_EXTRUDER_FILAMENTS
                + uniform * WEIGHT_FOR_NOZZLE_TYPE;

            let mut signature: Vec<(NozzleVolumeType, usize, Vec<usize>)> = members
                .iter()
                .map(|(&cluster, elems)| {
                    let volume = nozzles.get(cluster).map(|nz| nz.volume_type).unwrap_or_default();
                    (volume, self.extruder_of(cluster), elems.clone())
                })
                .collect();
            signature.sort();
            if !seen.insert(signature) {
                continue;
            }

            let mut filament_map = vec![0usize; ctx.group_info.total_filament_num];
            for (idx, &label) in labels.iter().enumerate() {
                if let Some(slot) = used_filaments.get(idx).and_then(|&f| filament_map.get_mut(f)) {
                    *slot = label;
                }
            }
            let result = MultiNozzleGroupResult::for_filaments(&filament_map, nozzles, used_filaments);
            let (extruder_changes, filament_changes) =
                estimate_extruder_filament_change_count(&ctx.model_info.layer_filaments, &result);
            let flush = self.calc_cost(&labels, &all_centers);
            let time = extruder_changes as f64 * ctx.speed_info.extruder_change_time
                + filament_changes as f64 * ctx.speed_info.filament_change_time;
            let mut score = evaluate_score(flush, time, true);
            if extruder_filaments.get(master).map_or(false, |&c| c < (n + 1) / 2) {
                score += ABSOLUTE_FLUSH_GAP_TOLERANCE;
            }

            self.memoryed_groups
                .update(MemoryedGroup::new(labels, score, prefer_level));
        }

        self.memoryed_groups.best().map(|best| best.group.clone())
    }

    /// Cluster the elements.
    ///
    /// With at most `k` elements every assignment is enumerated. Otherwise
    /// `retries` seeded restarts run a best-swap medoid search until no swap
    /// improves the cost or `timeout` passes.
    #[instrument(skip(self, ctx, used_filaments), fields(k = self.k, elements = self.elem_count))]
    pub fn do_clustering(
        &mut self,
        ctx: &FilamentGroupContext,
        used_filaments: &[usize],
        timeout: Duration,
        retries: usize,
    ) {
        let start = Instant::now();

        if self.elem_count <= self.k {
            if let Some(labels) = self.cluster_small_data(ctx, used_filaments) {
                self.cluster_labels = labels;
                return;
            }
        }

        let mut best_labels = vec![self.default_group; self.elem_count];
        let mut best_cost = f64::INFINITY;

        for retry in 0..retries {
            if start.elapsed() >= timeout {
                break;
            }
            let mut centers = self.init_cluster_center(retry as u64);
            let mut labels = self.assign_cluster_label(&centers);
            let mut cost = self.calc_cost(&labels, &centers);
            self.memoryed_groups
                .update(MemoryedGroup::new(labels.clone(), cost, SEARCH_PREFER_LEVEL));

            let mut changed = true;
            while changed && start.elapsed() < timeout {
                changed = false;
                let mut best_swap: Option<(usize, usize)> = None;
                let mut best_swap_cost = cost;

                for cluster in 0..self.k {
                    if centers[cluster].is_none() {
                        continue;
                    }
                    for elem in 0..self.elem_count {
                        if centers.contains(&Some(elem)) || !self.can_place(elem, cluster) {
                            continue;
                        }
                        let mut candidate = centers.clone();
                        candidate[cluster] = Some(elem);
                        let candidate_labels = self.assign_cluster_label(&candidate);
                        let candidate_cost = self.calc_cost(&candidate_labels, &candidate);
                        if candidate_cost < best_swap_cost {
                            best_swap_cost = candidate_cost;
                            best_swap = Some((cluster, elem));
                        }
                    }
                }

                if let Some((cluster, elem)) = best_swap {
                    changed = true;
                    centers[cluster] = Some(elem);
                    labels = self.assign_cluster_label(&centers);
                    cost = self.calc_cost(&labels, &centers);
                    self.memoryed_groups
                        .update(MemoryedGroup::new(labels.clone(), cost, SEARCH_PREFER_LEVEL));
                }
            }

            debug!(retry, cost, "medoid restart finished");
            if cost < best_cost {
                best_cost = cost;
                best_labels = labels;
            }
        }

        self.cluster_labels = best_labels;
    }
}
