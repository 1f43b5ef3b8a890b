//! Match mode: place each filament on the extruder that already holds the
//! closest loaded material.

use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::context::{FilamentGroupContext, FilamentInfo, FilamentUsageType, MachineFilamentInfo};
use super::error::{FilamentGroupError, FilamentGroupResult};
use super::utils::{collect_sorted_used_filaments, extract_unprintable_limit_indices, rebuild_unprintables, UnplaceableLimits};
use crate::color::{color_distance, Color};
use crate::flow_network::{AssignmentSolver, LinkLimits, MatchModeGroupSolver};

/// Bonus for moving a support-only filament onto an extruder that prefers
/// non-model material.
const SUPPORT_PREFER_SCORE: i32 = 3;

type SlotSignature = (Color, String, bool);

fn signature_of(slot: &MachineFilamentInfo) -> SlotSignature {
    let (color, filament_type, is_support) = slot.signature();
    (color, filament_type.to_string(), is_support)
}

struct Matcher<'a> {
    ctx: &'a FilamentGroupContext,
    used_filaments: Vec<usize>,
    used_info: Vec<&'a FilamentInfo>,
    slots: Vec<&'a MachineFilamentInfo>,
    /// Slot signature -> every slot index sharing it.
    equivalent_slots: BTreeMap<SlotSignature, Vec<usize>>,
    unprintable: UnplaceableLimits,
    distances: Vec<Vec<f64>>,
    extruder_filament_count: Vec<usize>,
}

impl<'a> Matcher<'a> {
    fn new(ctx: &'a FilamentGroupContext) -> FilamentGroupResult<Self> {
        let used_filaments = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
        let used_info: Vec<&FilamentInfo> = used_filaments
            .iter()
            .filter_map(|&f| ctx.model_info.filament_info.get(f))
            .collect();

        let slots: Vec<&MachineFilamentInfo> = ctx.machine_info.machine_filament_info.iter().flatten().collect();
        if slots.is_empty() {
            return Err(FilamentGroupError::EmptyAmsFilaments);
        }
        let mut equivalent_slots: BTreeMap<SlotSignature, Vec<usize>> = BTreeMap::new();
        for (idx, slot) in slots.iter().enumerate() {
            equivalent_slots.entry(signature_of(slot)).or_default().push(idx);
        }

        let limits = extract_unprintable_limit_indices(&ctx.model_info.unprintable_filaments, &used_filaments);
        let unprintable = rebuild_unprintables(
            &used_filaments,
            &limits,
            &ctx.model_info.unprintable_volumes,
            &ctx.nozzle_info.nozzle_list,
        );

        let distances: Vec<Vec<f64>> = used_info
            .iter()
            .map(|info| slots.iter().map(|slot| color_distance(&info.color, &slot.color)).collect())
            .collect();
        let extruder_count = ctx.extruder_count().max(2);

        Ok(Self {
            ctx,
            used_filaments,
            used_info,
            slots,
            equivalent_slots,
            unprintable,
            distances,
            extruder_filament_count: vec![0; extruder_count],
        })
    }

    fn extruder_compatible(&self, filament: usize, extruder: usize) -> bool {
        self.unprintable.get(&filament) != Some(&extruder)
    }

    fn unlink_limits<F>(&self, filaments: &[usize], can_link: F) -> LinkLimits
    where
        F: Fn(usize, &MachineFilamentInfo) -> bool,
    {
        filaments
            .iter()
            .enumerate()
            .filter_map(|(pos, &f)| {
                let blocked: Vec<usize> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|&(_, slot)| !can_link(f, *slot))
                    .map(|(idx, _)| idx)
                    .collect();
                (!blocked.is_empty()).then_some((pos, blocked))
            })
            .collect()
    }

    fn assign(&mut self, filament: usize, slot: usize, group: &mut [usize]) {
        let extruder = self.slots[slot].extruder_id;
        if let Some(target) = group.get_mut(self.used_filaments[filament]) {
            *target = extruder;
        }
        if let Some(count) = self.extruder_filament_count.get_mut(extruder) {
            *count += 1;
        }
    }

    fn unassign(&mut self, slot: usize) {
        let extruder = self.slots[slot].extruder_id;
        if let Some(count) = self.extruder_filament_count.get_mut(extruder) {
            *count = count.saturating_sub(1);
        }
    }

    /// `|count[e] + 1 - count[other]|`, with `other` the least loaded other extruder.
    fn balance_gap(&self, extruder: usize) -> usize {
        let own = self.extruder_filament_count.get(extruder).copied().unwrap_or(0) + 1;
        let other = self
            .extruder_filament_count
            .iter()
            .enumerate()
            .filter(|(e, _)| *e != extruder)
            .map(|(_, &c)| c)
            .min()
            .unwrap_or(own);
        own.abs_diff(other)
    }

    /// Solve one relaxation stage over `filaments` and apply it. Returns the
    /// filaments left without a slot.
    fn run_stage(&mut self, filaments: &[usize], unlink: LinkLimits, group: &mut [usize]) -> Vec<usize> {
        let capacity = vec![self.used_filaments.len(); self.slots.len()];
        let matches = MatchModeGroupSolver::new(
            &self.distances,
            filaments.to_vec(),
            (0..self.slots.len()).collect(),
            capacity,
            unlink,
        )
        .solve();

        let mut ungrouped = Vec::new();
        let mut to_optimize = Vec::new();
        for (pos, slot) in matches.iter().enumerate() {
            let filament = filaments[pos];
            let Some(slot) = *slot else {
                ungrouped.push(filament);
                continue;
            };
            let equivalents = self.equivalent_slots.get(&signature_of(self.slots[slot])).map_or(0, Vec::len);
            if equivalents > 1 && !self.unprintable.contains_key(&filament) {
                to_optimize.push((filament, slot));
            }
            self.assign(filament, slot, group);
        }

        for (filament, old_slot) in to_optimize {
            self.unassign(old_slot);
            let is_support_only = self.used_info[filament].usage_type == FilamentUsageType::SupportOnly;
            let candidates: Vec<(usize, i32)> = self
                .equivalent_slots
                .get(&signature_of(self.slots[old_slot]))
                .map(|slots| {
                    slots
                        .iter()
                        .map(|&slot| {
                            let extruder = self.slots[slot].extruder_id;
                            let prefers = self.ctx.machine_info.prefers_non_model(extruder);
                            let score = if is_support_only && prefers { SUPPORT_PREFER_SCORE } else { 0 };
                            (slot, score)
                        })
                        .collect()
                })
                .unwrap_or_default();

            let best_score = candidates.iter().map(|&(_, s)| s).max().unwrap_or(0);
            let chosen = candidates
                .iter()
                .filter(|&&(_, s)| s == best_score)
                .min_by_key(|&&(slot, _)| self.balance_gap(self.slots[slot].extruder_id))
                .map_or(old_slot, |&(slot, _)| slot);
            self.assign(filament, chosen, group);
        }

        ungrouped
    }
}

/// Group filaments by the materials loaded in the printer.
///
/// Runs up to three matching stages, each over the filaments the previous
/// one left unmatched: first requiring equal type and support flag and a
/// printable extruder, then only a printable extruder, then nothing. Unused
/// filaments are placed on the master extruder.
#[instrument(skip_all, fields(filaments = ctx.group_info.total_filament_num))]
pub fn calc_filament_group_for_match(ctx: &FilamentGroupContext) -> FilamentGroupResult<Vec<usize>> {
    let mut matcher = Matcher::new(ctx)?;
    let mut group = vec![ctx.machine_info.master_extruder_id; ctx.group_info.total_filament_num];
    let all: Vec<usize> = (0..matcher.used_filaments.len()).collect();

    let strict = matcher.unlink_limits(&all, |f, slot| {
        let info = matcher.used_info[f];
        info.filament_type == slot.filament_type
            && info.is_support == slot.is_support
            && matcher.extruder_compatible(f, slot.extruder_id)
    });
    let ungrouped = matcher.run_stage(&all, strict, &mut group);
    if ungrouped.is_empty() {
        return Ok(group);
    }
    debug!(count = ungrouped.len(), "relaxing material type for match");

    let relaxed = matcher.unlink_limits(&ungrouped, |f, slot| matcher.extruder_compatible(f, slot.extruder_id));
    let ungrouped = matcher.run_stage(&ungrouped, relaxed, &mut group);
    if ungrouped.is_empty() {
        return Ok(group);
    }
    debug!(count = ungrouped.len(), "dropping all limits for match");

    matcher.run_stage(&ungrouped, LinkLimits::new(), &mut group);
    Ok(group)
}
