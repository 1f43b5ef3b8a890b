//! Grouping entry points.
//!
//! [`FilamentGroup`] assigns filaments to the extruders of a printer with one
//! nozzle per extruder, either by matching loaded materials or by minimizing
//! flush. [`FilamentGroupMultiNozzle`] refines an extruder split down to
//! individual nozzles when extruders carry several of them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::context::{FilamentGroupContext, FilamentUsageType, GroupMode, GroupStrategy};
use super::distance::{evaluate_score, FlushDistanceEvaluator, TimeEvaluator};
use super::error::{FilamentGroupError, FilamentGroupResult};
use super::kmedoids::{KMedoids, KMedoids2};
use super::matching;
use super::memory::{MemoryedGroup, MemoryedGroups, ABSOLUTE_FLUSH_GAP_TOLERANCE};
use super::selector::{select_best_group_for_ams, DEFAULT_COLOR_THRESHOLD};
use super::utils::{
    check_printable, collect_sorted_used_filaments, collect_unprintable_everywhere, extract_unprintable_limit_indices,
    extract_unprintable_limit_sets, rebuild_unprintables, UnplaceableLimits, UnplaceableSets,
};
use super::{ENUM_THRESHOLD, MULTI_NOZZLE_PAM_RETRIES, MULTI_NOZZLE_PAM_TIMEOUT, PAM_TIMEOUT};
use crate::flow_network::{AssignmentSolver, GroupCapacity, LinkLimits, MatchModeGroupSolver};
use crate::nozzle::NozzleVolumeType;
use crate::tool_order::{reorder_filaments_for_minimum_flush_volume, CustomSequenceFn};

const UNPLACEABLE_LIMIT_REWARD: i64 = 10_000;
const MAX_SIZE_LIMIT_REWARD: i64 = 5_000;
const SUPPORT_PREFER_REWARD: i64 = 100;
const BEST_FIT_LIMIT_REWARD: i64 = 10;

/// Print time factor for extruders carrying a TPU high-flow nozzle.
const TPU_HIGH_FLOW_TIME_FACTOR: f64 = 0.9;

/// Result of a grouping run.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    /// Extruder id per filament.
    pub filament_map: Vec<usize>,
    /// Nozzle id per filament, present when extruders carry several nozzles.
    pub nozzle_map: Option<Vec<usize>>,
    /// Flush volume of the best flush grouping, when one was computed.
    pub cost: Option<f64>,
}

/// Labels of used filaments written back onto a full filament map. Unused
/// filaments get `fill`.
fn expand_labels(labels: &[usize], used_filaments: &[usize], total: usize, fill: usize) -> Vec<usize> {
    let mut map = vec![fill; total];
    for (&f, &label) in used_filaments.iter().zip(labels) {
        if let Some(slot) = map.get_mut(f) {
            *slot = label;
        }
    }
    map
}

// ============================================================================
// Single-nozzle Grouping
// ============================================================================

/// Filament to extruder grouping for one nozzle per extruder.
pub struct FilamentGroup {
    ctx: FilamentGroupContext,
    memoryed_groups: Vec<Vec<usize>>,
    custom_sequence: Option<Box<CustomSequenceFn>>,
}

impl FilamentGroup {
    /// Validate `ctx` and prepare a grouping run.
    pub fn new(ctx: FilamentGroupContext) -> FilamentGroupResult<Self> {
        ctx.validate()?;
        Ok(Self {
            ctx,
            memoryed_groups: Vec::new(),
            custom_sequence: None,
        })
    }

    /// Use a fixed print order for the layers the callback answers.
    pub fn with_custom_sequence(mut self, sequence: Box<CustomSequenceFn>) -> Self {
        self.custom_sequence = Some(sequence);
        self
    }

    pub fn context(&self) -> &FilamentGroupContext {
        &self.ctx
    }

    /// Near-optimal filament maps kept by the last flush run, best first.
    pub fn memoryed_groups(&self) -> &[Vec<usize>] {
        &self.memoryed_groups
    }

    /// Group every filament of the context.
    ///
    /// Match mode falls back to flush mode when nothing is loaded in the
    /// printer. Multi-nozzle printers are refined to nozzle ids.
    #[instrument(skip(self), fields(mode = ?self.ctx.group_info.mode))]
    pub fn calc_filament_group(&mut self) -> GroupOutcome {
        if self.ctx.is_multi_nozzle() {
            return self.calc_multi_nozzle_group();
        }

        if self.ctx.group_info.mode == GroupMode::Match {
            match self.calc_filament_group_for_match() {
                Ok(filament_map) => {
                    return GroupOutcome {
                        filament_map,
                        nozzle_map: None,
                        cost: None,
                    }
                }
                Err(err) => warn!(%err, "match grouping failed, falling back to flush grouping"),
            }
        }

        let merged = self.try_merge_filaments();
        let original = self.rebuild_context(&merged);
        let (filament_map, cost) = self.calc_filament_group_for_flush();
        if let Some(ctx) = original {
            self.ctx = ctx;
        }
        GroupOutcome {
            filament_map: Self::separate_merged_filaments(&filament_map, &merged),
            nozzle_map: None,
            cost: Some(cost),
        }
    }

    fn calc_multi_nozzle_group(&mut self) -> GroupOutcome {
        let matched = if self.ctx.group_info.mode == GroupMode::Match {
            match calc_filament_group_for_match_multi_nozzle(&self.ctx) {
                Ok(map) => Some(map),
                Err(err) => {
                    warn!(%err, "match grouping failed, falling back to flush grouping");
                    None
                }
            }
        } else {
            None
        };
        let flushed = matched.is_none();
        let nozzle_map =
            matched.unwrap_or_else(|| FilamentGroupMultiNozzle::new(self.ctx.clone()).calc_filament_group_by_mcmf());

        let nozzles = &self.ctx.nozzle_info.nozzle_list;
        let master = self.ctx.machine_info.master_extruder_id;
        let filament_map: Vec<usize> = nozzle_map
            .iter()
            .map(|&n| nozzles.get(n).map_or(master, |nozzle| nozzle.extruder_id))
            .collect();
        let cost = flushed.then(|| {
            let used_filaments = collect_sorted_used_filaments(&self.ctx.model_info.layer_filaments);
            let labels: Vec<usize> = used_filaments
                .iter()
                .map(|&f| filament_map.get(f).copied().unwrap_or(master))
                .collect();
            self.flush_cost(&used_filaments, &labels)
        });
        GroupOutcome {
            filament_map,
            nozzle_map: Some(nozzle_map),
            cost,
        }
    }

    /// Assign filaments to the loaded materials they resemble most.
    pub fn calc_filament_group_for_match(&self) -> FilamentGroupResult<Vec<usize>> {
        matching::calc_filament_group_for_match(&self.ctx)
    }

    /// Minimum flush grouping, re-ranked by how well the near-optimal
    /// candidates match the loaded materials. Returns the map and the flush
    /// volume of the best flush grouping.
    pub fn calc_filament_group_for_flush(&mut self) -> (Vec<usize>, f64) {
        let used_filaments = collect_sorted_used_filaments(&self.ctx.model_info.layer_filaments);
        let (best, cost) = self.calc_min_flush_group();

        if self.ctx.extruder_count() != 2 {
            return (best, cost);
        }

        let mut candidates = Vec::with_capacity(self.memoryed_groups.len() + 1);
        candidates.push(best.clone());
        candidates.extend(self.memoryed_groups.iter().cloned());

        let used_filament_info: Vec<_> = used_filaments
            .iter()
            .filter_map(|&f| self.ctx.model_info.filament_info.get(f).cloned())
            .collect();
        let label_extruders: Vec<usize> = (0..self.ctx.extruder_count()).collect();

        let selected = select_best_group_for_ams(
            &candidates,
            &label_extruders,
            &used_filaments,
            &used_filament_info,
            &self.ctx.machine_info.machine_filament_info,
            DEFAULT_COLOR_THRESHOLD,
        )
        .unwrap_or(best);
        (selected, cost)
    }

    /// Minimum flush grouping by enumeration for few filaments, by
    /// clustering otherwise.
    ///
    /// Filaments that no extruder can print end up on the master extruder.
    pub fn calc_min_flush_group(&mut self) -> (Vec<usize>, f64) {
        let used_filaments = collect_sorted_used_filaments(&self.ctx.model_info.layer_filaments);
        let (map, cost) = self.solve_min_flush_group(&used_filaments);
        self.pin_unprintable_to_master(&used_filaments, map, cost)
    }

    fn solve_min_flush_group(&mut self, used_filaments: &[usize]) -> (Vec<usize>, f64) {
        let master = self.ctx.machine_info.master_extruder_id;
        let total = self.ctx.group_info.total_filament_num;
        self.memoryed_groups.clear();

        if used_filaments.is_empty() || self.ctx.extruder_count() < 2 {
            return (vec![master; total], 0.0);
        }
        if self.ctx.extruder_count() > 2 {
            // one cluster per extruder
            let nozzle_map = FilamentGroupMultiNozzle::new(self.ctx.clone()).calc_filament_group_by_pam();
            let nozzles = &self.ctx.nozzle_info.nozzle_list;
            let map: Vec<usize> = nozzle_map
                .iter()
                .map(|&n| nozzles.get(n).map_or(master, |nozzle| nozzle.extruder_id))
                .collect();
            let labels: Vec<usize> = used_filaments.iter().map(|&f| map[f]).collect();
            let cost = self.flush_cost(used_filaments, &labels);
            return (map, cost);
        }

        if used_filaments.len() < ENUM_THRESHOLD {
            self.calc_min_flush_group_by_enum(used_filaments)
        } else {
            self.calc_min_flush_group_by_pam2(used_filaments, PAM_TIMEOUT)
        }
    }

    fn pin_unprintable_to_master(
        &mut self,
        used_filaments: &[usize],
        mut map: Vec<usize>,
        cost: f64,
    ) -> (Vec<usize>, f64) {
        let pinned = collect_unprintable_everywhere(
            &self.ctx.model_info.unprintable_filaments,
            self.ctx.extruder_count(),
            used_filaments,
        );
        if pinned.is_empty() {
            return (map, cost);
        }

        let master = self.ctx.machine_info.master_extruder_id;
        warn!(?pinned, master, "filaments unprintable on every extruder go to the master extruder");
        let pin = |candidate: &mut Vec<usize>| {
            for &f in &pinned {
                if let Some(slot) = candidate.get_mut(f) {
                    *slot = master;
                }
            }
        };
        pin(&mut map);
        let mut seen = BTreeSet::new();
        let mut memoryed = std::mem::take(&mut self.memoryed_groups);
        memoryed.iter_mut().for_each(pin);
        memoryed.retain(|candidate| seen.insert(candidate.clone()));
        self.memoryed_groups = memoryed;

        let labels: Vec<usize> = used_filaments
            .iter()
            .map(|&f| map.get(f).copied().unwrap_or(master))
            .collect();
        let cost = self.flush_cost(used_filaments, &labels);
        (map, cost)
    }

    fn flush_cost(&self, used_filaments: &[usize], labels: &[usize]) -> f64 {
        reorder_filaments_for_minimum_flush_volume(
            used_filaments,
            labels,
            &self.ctx.model_info.layer_filaments,
            &self.ctx.model_info.flush_matrix,
            self.custom_sequence.as_deref(),
        )
    }

    fn unplaceable_limits(&self, used_filaments: &[usize]) -> UnplaceableLimits {
        let limits = extract_unprintable_limit_indices(&self.ctx.model_info.unprintable_filaments, used_filaments);
        rebuild_unprintables(
            used_filaments,
            &limits,
            &self.ctx.model_info.unprintable_volumes,
            &self.ctx.nozzle_info.nozzle_list,
        )
    }

    /// Score every split of the used filaments over two extruders.
    ///
    /// Splits are ranked by prefer level (limits respected, capacities
    /// respected, support filaments on the preferred extruder) and then by
    /// flush volume, optionally combined with print time.
    #[instrument(skip_all, fields(filaments = used_filaments.len()))]
    pub fn calc_min_flush_group_by_enum(&mut self, used_filaments: &[usize]) -> (Vec<usize>, f64) {
        let ctx = &self.ctx;
        let n = used_filaments.len();
        let master = ctx.machine_info.master_extruder_id;
        let total = ctx.group_info.total_filament_num;
        let limits = self.unplaceable_limits(used_filaments);
        let time_evaluator = TimeEvaluator::new(&ctx.speed_info.filament_print_time);
        let mut memory = MemoryedGroups::new(ctx.group_info.max_gap_threshold);

        // (labels, flush, score, prefer level)
        let mut best: Option<(Vec<usize>, f64, f64, i64)> = None;

        for mask in 0u64..(1u64 << n) {
            let labels: Vec<usize> = (0..n).map(|j| ((mask >> j) & 1) as usize).collect();
            let mut groups = vec![BTreeSet::new(), BTreeSet::new()];
            for (j, &label) in labels.iter().enumerate() {
                groups[label].insert(j);
            }

            let mut prefer_level = 0;
            if check_printable(&groups, &limits) {
                prefer_level += UNPLACEABLE_LIMIT_REWARD;
            }
            let within = |gid: usize| groups[gid].len() <= ctx.machine_info.group_size(gid);
            if within(0) && within(1) {
                prefer_level += MAX_SIZE_LIMIT_REWARD;
            }
            let filled = |gid: usize| groups[gid].len() >= ctx.machine_info.group_size(gid);
            if ctx.group_info.strategy == GroupStrategy::BestFit && filled(0) && filled(1) {
                prefer_level += BEST_FIT_LIMIT_REWARD;
            }
            for (gid, group) in groups.iter().enumerate() {
                if !ctx.machine_info.prefers_non_model(gid) {
                    continue;
                }
                let support_only = group
                    .iter()
                    .filter(|&&j| {
                        ctx.model_info
                            .filament_info
                            .get(used_filaments[j])
                            .is_some_and(|info| info.usage_type == FilamentUsageType::SupportOnly)
                    })
                    .count();
                prefer_level += support_only as i64 * SUPPORT_PREFER_REWARD;
            }

            let mut flush = self.flush_cost(used_filaments, &labels);
            if groups[master.min(1)].len() < (n + 1) / 2 {
                flush += ABSOLUTE_FLUSH_GAP_TOLERANCE;
            }

            let map = expand_labels(&labels, used_filaments, total, master);
            let time = time_evaluator.estimated_time(&map);
            let score = evaluate_score(flush, time, ctx.speed_info.group_with_time);
            debug!(mask, score, flush, time, prefer_level, "evaluated filament split");

            let improves = best
                .as_ref()
                .map_or(true, |(_, _, s, p)| prefer_level > *p || (prefer_level == *p && score < *s));
            memory.update(MemoryedGroup::new(labels.clone(), score, prefer_level));
            if improves {
                best = Some((labels, flush, score, prefer_level));
            }
        }

        self.memoryed_groups = memory
            .into_sorted_vec()
            .into_iter()
            .map(|g| expand_labels(&g.group, used_filaments, total, master))
            .collect();

        match best {
            Some((labels, flush, score, prefer_level)) => {
                info!(flush, score, prefer_level, "enumerated filament grouping");
                (expand_labels(&labels, used_filaments, total, master), flush)
            }
            None => (vec![master; total], 0.0),
        }
    }

    /// Two-way medoid clustering for larger instances.
    #[instrument(skip_all, fields(filaments = used_filaments.len()))]
    pub fn calc_min_flush_group_by_pam2(&mut self, used_filaments: &[usize], timeout: Duration) -> (Vec<usize>, f64) {
        let master = self.ctx.machine_info.master_extruder_id;
        let total = self.ctx.group_info.total_filament_num;
        let limits = self.unplaceable_limits(used_filaments);
        let evaluator = FlushDistanceEvaluator::new(
            &self.ctx.model_info.flush_matrix,
            used_filaments,
            &self.ctx.model_info.layer_filaments,
        );

        let mut pam = KMedoids2::new(used_filaments.len(), &evaluator, master)
            .with_max_cluster_size(self.ctx.machine_info.max_group_size.clone())
            .with_unplaceable_limits(limits)
            .with_memory_threshold(self.ctx.group_info.max_gap_threshold);
        pam.do_clustering(self.ctx.group_info.strategy, timeout);

        let labels = pam.cluster_labels().to_vec();
        let memoryed = pam.memoryed_groups().clone();
        self.memoryed_groups = memoryed
            .into_sorted_vec()
            .into_iter()
            .map(|g| expand_labels(&g.group, used_filaments, total, master))
            .collect();

        let cost = self.flush_cost(used_filaments, &labels);
        info!(cost, "clustered filament grouping");
        (expand_labels(&labels, used_filaments, total, master), cost)
    }

    /// Place filaments by print time alone, favouring extruders with a TPU
    /// high-flow nozzle.
    pub fn calc_filament_group_for_tpu(&self) -> Vec<usize> {
        let ctx = &self.ctx;
        let used_filaments = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
        let master = ctx.machine_info.master_extruder_id;
        let extruders = ctx.extruder_count();

        let has_tpu_nozzle: Vec<bool> = (0..extruders)
            .map(|e| {
                ctx.nozzle_info
                    .nozzle_list
                    .iter()
                    .any(|n| n.extruder_id == e && n.volume_type == NozzleVolumeType::TpuHighFlow)
            })
            .collect();
        let print_time: Vec<Vec<f64>> = used_filaments
            .iter()
            .map(|f| {
                (0..extruders)
                    .map(|e| {
                        let time = ctx
                            .speed_info
                            .filament_print_time
                            .get(f)
                            .and_then(|times| times.get(&e))
                            .copied()
                            .unwrap_or(0.0);
                        if has_tpu_nozzle[e] {
                            time * TPU_HIGH_FLOW_TIME_FACTOR
                        } else {
                            time
                        }
                    })
                    .collect()
            })
            .collect();

        let unlink: LinkLimits = self
            .unplaceable_limits(&used_filaments)
            .into_iter()
            .filter(|&(_, extruder)| extruder < extruders)
            .map(|(idx, extruder)| (idx, vec![extruder]))
            .collect();

        let solver = MatchModeGroupSolver::new(
            &print_time,
            (0..used_filaments.len()).collect(),
            (0..extruders).collect(),
            vec![used_filaments.len(); extruders],
            unlink,
        );
        let labels: Vec<usize> = solver.solve().into_iter().map(|e| e.unwrap_or(master)).collect();
        expand_labels(&labels, &used_filaments, ctx.group_info.total_filament_num, master)
    }

    /// Representative filament -> all filaments sharing its id, color and
    /// unprintable extruders. Only groups of two or more are listed.
    pub fn try_merge_filaments(&self) -> BTreeMap<usize, Vec<usize>> {
        let model = &self.ctx.model_info;
        let mut by_key: BTreeMap<(String, String, Vec<usize>), Vec<usize>> = BTreeMap::new();

        for idx in 0..self.ctx.group_info.total_filament_num {
            let (Some(id), Some(info)) = (model.filament_ids.get(idx), model.filament_info.get(idx)) else {
                continue;
            };
            let unprintable: Vec<usize> = model
                .unprintable_filaments
                .iter()
                .enumerate()
                .filter(|(_, set)| set.contains(&idx))
                .map(|(e, _)| e)
                .collect();
            by_key
                .entry((id.clone(), info.color.to_hex_str(true), unprintable))
                .or_default()
                .push(idx);
        }

        by_key
            .into_values()
            .filter(|members| members.len() > 1)
            .map(|members| (members[0], members))
            .collect()
    }

    /// Give every merged filament the label of its representative.
    pub fn separate_merged_filaments(filament_map: &[usize], merged: &BTreeMap<usize, Vec<usize>>) -> Vec<usize> {
        let mut map = filament_map.to_vec();
        for (&src, members) in merged {
            let Some(&label) = filament_map.get(src) else {
                continue;
            };
            for &f in members {
                if let Some(slot) = map.get_mut(f) {
                    *slot = label;
                }
            }
        }
        map
    }

    /// Replace merged filaments by their representative in the layers and
    /// limits. Returns the previous context when anything changed.
    fn rebuild_context(&mut self, merged: &BTreeMap<usize, Vec<usize>>) -> Option<FilamentGroupContext> {
        if merged.is_empty() {
            return None;
        }
        let representative: BTreeMap<usize, usize> = merged
            .iter()
            .flat_map(|(&src, members)| members.iter().map(move |&f| (f, src)))
            .collect();
        let remap = |f: usize| representative.get(&f).copied().unwrap_or(f);

        let mut ctx = self.ctx.clone();
        for layer in &mut ctx.model_info.layer_filaments {
            let mut seen = BTreeSet::new();
            *layer = layer.iter().map(|&f| remap(f)).filter(|&f| seen.insert(f)).collect();
        }
        for set in &mut ctx.model_info.unprintable_filaments {
            *set = set.iter().map(|&f| remap(f)).collect();
        }
        debug!(groups = merged.len(), "merged identical filaments");
        Some(std::mem::replace(&mut self.ctx, ctx))
    }
}

// ============================================================================
// Multi-nozzle Grouping
// ============================================================================

/// Filament to nozzle grouping for extruders carrying several nozzles.
#[derive(Debug, Clone)]
pub struct FilamentGroupMultiNozzle {
    ctx: FilamentGroupContext,
    /// Filament -> the only extruder it may use.
    forced_extruders: BTreeMap<usize, usize>,
}

impl FilamentGroupMultiNozzle {
    pub fn new(ctx: FilamentGroupContext) -> Self {
        Self {
            ctx,
            forced_extruders: BTreeMap::new(),
        }
    }

    /// Pin filaments to extruders; only the nozzle within it is searched.
    pub fn with_forced_extruders(mut self, forced: BTreeMap<usize, usize>) -> Self {
        self.forced_extruders = forced;
        self
    }

    fn default_nozzle(&self) -> usize {
        self.ctx
            .nozzle_info
            .extruder_nozzle_list
            .get(&self.ctx.machine_info.master_extruder_id)
            .and_then(|ids| ids.first())
            .copied()
            .unwrap_or(0)
    }

    /// Nozzles each used filament may not use: those on unprintable
    /// extruders, of an unexpected or unprintable volume type, or off its
    /// forced extruder.
    fn rebuild_nozzle_unprintables(&self, used_filaments: &[usize]) -> UnplaceableSets {
        let model = &self.ctx.model_info;
        let extruder_limits = extract_unprintable_limit_sets(&model.unprintable_filaments, used_filaments);

        let mut ret = UnplaceableSets::new();
        for (idx, f) in used_filaments.iter().enumerate() {
            let blocked_extruders = extruder_limits.get(&idx).map_or(&[][..], |e| e.as_slice());
            let expected = self
                .ctx
                .group_info
                .filament_volume_map
                .get(*f)
                .copied()
                .filter(|&v| v != NozzleVolumeType::Hybrid);
            let volumes = model.unprintable_volumes.get(f);
            let forced = self.forced_extruders.get(f).copied();

            let nozzles: Vec<usize> = self
                .ctx
                .nozzle_info
                .nozzle_list
                .iter()
                .enumerate()
                .filter(|(_, nozzle)| {
                    blocked_extruders.contains(&nozzle.extruder_id)
                        || expected.is_some_and(|v| v != nozzle.volume_type)
                        || volumes.is_some_and(|v| v.contains(&nozzle.volume_type))
                        || forced.is_some_and(|e| e != nozzle.extruder_id)
                })
                .map(|(id, _)| id)
                .collect();
            if !nozzles.is_empty() {
                ret.insert(idx, nozzles);
            }
        }
        ret
    }

    /// Split filaments over extruders first, then refine to nozzles.
    ///
    /// The first pass sizes the extruders by their nozzle count to decide
    /// which filaments get a nozzle of their own; those are pinned for a
    /// second pass under the regular capacities.
    #[instrument(skip(self))]
    pub fn calc_filament_group_by_mcmf(&self) -> Vec<usize> {
        let ctx = &self.ctx;
        if ctx.extruder_count() != 2 {
            return self.calc_filament_group_by_pam();
        }

        let used_filaments = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
        if used_filaments.is_empty() {
            return vec![self.default_nozzle(); ctx.group_info.total_filament_num];
        }
        let master = ctx.machine_info.master_extruder_id;
        let limits = extract_unprintable_limit_indices(&ctx.model_info.unprintable_filaments, &used_filaments);
        let evaluator =
            FlushDistanceEvaluator::new(&ctx.model_info.flush_matrix, &used_filaments, &ctx.model_info.layer_filaments);
        let nozzle_counts: Vec<usize> = (0..2)
            .map(|e| ctx.nozzle_info.extruder_nozzle_list.get(&e).map_or(0, Vec::len))
            .collect();

        let mut first = KMedoids2::new(used_filaments.len(), &evaluator, master)
            .with_max_cluster_size(nozzle_counts.clone())
            .with_unplaceable_limits(limits.clone());
        first.do_clustering(GroupStrategy::BestFit, PAM_TIMEOUT);
        let first_labels = first.cluster_labels().to_vec();

        let labels = if ctx.nozzle_info.nozzle_list.len() > used_filaments.len() {
            first_labels
        } else {
            let mut groups: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); 2];
            for (idx, &gid) in first_labels.iter().enumerate() {
                if limits.contains_key(&idx) {
                    groups[gid].insert(idx);
                }
            }
            for (idx, &gid) in first_labels.iter().enumerate() {
                if groups[gid].len() < nozzle_counts[gid] {
                    groups[gid].insert(idx);
                }
            }

            let mut pinned = UnplaceableLimits::new();
            for (gid, group) in groups.iter().enumerate() {
                for &idx in group {
                    pinned.insert(idx, 1 - gid);
                }
            }
            for (&idx, &forbidden) in &limits {
                pinned.entry(idx).or_insert(forbidden);
            }

            let mut second = KMedoids2::new(used_filaments.len(), &evaluator, master)
                .with_max_cluster_size(ctx.machine_info.max_group_size.clone())
                .with_unplaceable_limits(pinned);
            second.do_clustering(GroupStrategy::BestFit, PAM_TIMEOUT);
            second.cluster_labels().to_vec()
        };

        let forced: BTreeMap<usize, usize> = used_filaments.iter().copied().zip(labels).collect();
        refine_to_nozzles(ctx, forced)
    }

    /// K-way medoid clustering with one cluster per nozzle, re-ranked by how
    /// well the candidates match the loaded materials.
    #[instrument(skip(self))]
    pub fn calc_filament_group_by_pam(&self) -> Vec<usize> {
        let ctx = &self.ctx;
        let used_filaments = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
        let total = ctx.group_info.total_filament_num;
        let default_nozzle = self.default_nozzle();
        if used_filaments.is_empty() {
            return vec![default_nozzle; total];
        }

        let limits = self.rebuild_nozzle_unprintables(&used_filaments);
        let evaluator =
            FlushDistanceEvaluator::new(&ctx.model_info.flush_matrix, &used_filaments, &ctx.model_info.layer_filaments);
        let cluster_groups: Vec<GroupCapacity> = (0..ctx.extruder_count())
            .map(|e| {
                let nozzles: BTreeSet<usize> = ctx
                    .nozzle_info
                    .extruder_nozzle_list
                    .get(&e)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();
                (nozzles, ctx.machine_info.group_size(e))
            })
            .collect();

        let k = ctx.nozzle_info.nozzle_list.len();
        let mut pam = KMedoids::new(k, used_filaments.len(), &evaluator, default_nozzle)
            .with_unplaceable_limits(limits)
            .with_cluster_group_size(cluster_groups)
            .with_memory_threshold(ctx.group_info.max_gap_threshold);
        pam.do_clustering(ctx, &used_filaments, MULTI_NOZZLE_PAM_TIMEOUT, MULTI_NOZZLE_PAM_RETRIES);

        let mut candidates = vec![expand_labels(pam.cluster_labels(), &used_filaments, total, default_nozzle)];
        candidates.extend(pam.memoryed_groups().to_filament_maps(total, &used_filaments, default_nozzle));

        let used_filament_info: Vec<_> = used_filaments
            .iter()
            .filter_map(|&f| ctx.model_info.filament_info.get(f).cloned())
            .collect();
        let label_extruders: Vec<usize> = ctx.nozzle_info.nozzle_list.iter().map(|n| n.extruder_id).collect();

        select_best_group_for_ams(
            &candidates,
            &label_extruders,
            &used_filaments,
            &used_filament_info,
            &ctx.machine_info.machine_filament_info,
            DEFAULT_COLOR_THRESHOLD,
        )
        .unwrap_or_else(|| candidates.swap_remove(0))
    }
}

/// Refine a filament -> extruder assignment down to nozzle ids.
fn refine_to_nozzles(ctx: &FilamentGroupContext, forced: BTreeMap<usize, usize>) -> Vec<usize> {
    let mut ctx = ctx.clone();
    let extruders = ctx.machine_info.max_group_size.len();
    ctx.machine_info.max_group_size = vec![usize::MAX; extruders];
    FilamentGroupMultiNozzle::new(ctx)
        .with_forced_extruders(forced)
        .calc_filament_group_by_pam()
}

/// Match loaded materials to pick extruders, then choose nozzles by flush.
pub fn calc_filament_group_for_match_multi_nozzle(ctx: &FilamentGroupContext) -> FilamentGroupResult<Vec<usize>> {
    let extruder_map = matching::calc_filament_group_for_match(ctx)?;
    calc_filament_group_for_manual_multi_nozzle(&extruder_map, ctx)
}

/// Keep a user-chosen filament -> extruder map and choose nozzles by flush.
pub fn calc_filament_group_for_manual_multi_nozzle(
    filament_map_manual: &[usize],
    ctx: &FilamentGroupContext,
) -> FilamentGroupResult<Vec<usize>> {
    let total = ctx.group_info.total_filament_num;
    if filament_map_manual.len() < total {
        return Err(FilamentGroupError::InvalidContext(format!(
            "manual map covers {} of {} filaments",
            filament_map_manual.len(),
            total
        )));
    }
    if let Some(e) = filament_map_manual.iter().find(|&&e| e >= ctx.extruder_count()) {
        return Err(FilamentGroupError::InvalidContext(format!("manual map uses unknown extruder {}", e)));
    }

    let used_filaments = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
    check_manual_limits(filament_map_manual, &used_filaments, ctx)?;
    let forced = used_filaments.iter().map(|&f| (f, filament_map_manual[f])).collect();
    Ok(refine_to_nozzles(ctx, forced))
}

/// Reject manual placements on an extruder that cannot print the filament
/// while another extruder could.
fn check_manual_limits(
    filament_map_manual: &[usize],
    used_filaments: &[usize],
    ctx: &FilamentGroupContext,
) -> FilamentGroupResult<()> {
    let unprintable = &ctx.model_info.unprintable_filaments;
    let everywhere = collect_unprintable_everywhere(unprintable, ctx.extruder_count(), used_filaments);
    let volume_fits = |f: usize, extruder: usize| {
        let forbidden = ctx.model_info.unprintable_volumes.get(&f);
        let nozzles: Vec<_> = ctx
            .nozzle_info
            .nozzle_list
            .iter()
            .filter(|n| n.extruder_id == extruder)
            .collect();
        nozzles.is_empty()
            || nozzles
                .iter()
                .any(|n| forbidden.map_or(true, |types| !types.contains(&n.volume_type)))
    };

    for &f in used_filaments {
        if everywhere.contains(&f) {
            continue;
        }
        let extruder = filament_map_manual[f];
        if unprintable.get(extruder).is_some_and(|set| set.contains(&f)) {
            return Err(FilamentGroupError::ConflictLimits(format!(
                "filament {} is unprintable on extruder {}",
                f, extruder
            )));
        }
        if !volume_fits(f, extruder) {
            return Err(FilamentGroupError::ConflictLimits(format!(
                "no nozzle of extruder {} can print filament {}",
                extruder, f
            )));
        }
    }
    Ok(())
}
