//! Choosing among near-optimal groupings by how well they fit the materials
//! already loaded in the printer.

use tracing::debug;

use super::context::{FilamentInfo, MachineFilamentInfo};
use crate::color::color_distance;
use crate::flow_network::{AssignmentSolver, LinkLimits, MatchModeGroupSolver};

/// Colors further apart than this do not count as a match.
pub const DEFAULT_COLOR_THRESHOLD: f64 = 20.0;

/// Cost charged for a filament that finds no matching loaded material.
pub const FAIL_COST: f64 = 9999.0;

/// Pick the candidate map whose per-extruder filaments best match the loaded
/// materials.
///
/// `label_extruders[label]` is the extruder of a map label (a nozzle id in
/// multi-nozzle mode); labels outside it are taken as extruder ids.
/// `used_filament_info[i]` describes `used_filaments[i]`. Ties keep the
/// earlier candidate. Returns `None` only when there is no candidate.
pub fn select_best_group_for_ams(
    candidates: &[Vec<usize>],
    label_extruders: &[usize],
    used_filaments: &[usize],
    used_filament_info: &[FilamentInfo],
    machine_filament_info: &[Vec<MachineFilamentInfo>],
    color_threshold: f64,
) -> Option<Vec<usize>> {
    let mut best: Option<(f64, &Vec<usize>)> = None;

    for candidate in candidates {
        let cost = group_cost(
            candidate,
            label_extruders,
            used_filaments,
            used_filament_info,
            machine_filament_info,
            color_threshold,
        );
        if best.map_or(true, |(best_cost, _)| cost < best_cost) {
            best = Some((cost, candidate));
        }
    }

    best.map(|(cost, map)| {
        debug!(cost, candidates = candidates.len(), "selected grouping for loaded materials");
        map.clone()
    })
}

fn group_cost(
    candidate: &[usize],
    label_extruders: &[usize],
    used_filaments: &[usize],
    used_filament_info: &[FilamentInfo],
    machine_filament_info: &[Vec<MachineFilamentInfo>],
    color_threshold: f64,
) -> f64 {
    let extruder_count = machine_filament_info.len().max(2);
    let mut extruder_filaments: Vec<Vec<usize>> = vec![Vec::new(); extruder_count];
    for (idx, f) in used_filaments.iter().enumerate() {
        let label = candidate.get(*f).copied().unwrap_or(0);
        let extruder = label_extruders.get(label).copied().unwrap_or(label);
        if let Some(group) = extruder_filaments.get_mut(extruder) {
            group.push(idx);
        }
    }

    let mut cost = 0.0;
    for (extruder, filaments) in extruder_filaments.iter().enumerate() {
        if filaments.is_empty() {
            continue;
        }
        let machine = machine_filament_info.get(extruder).map_or(&[][..], |m| m.as_slice());
        if machine.is_empty() {
            cost += filaments.len() as f64 * FAIL_COST;
            continue;
        }

        let distances: Vec<Vec<f64>> = filaments
            .iter()
            .map(|&i| machine.iter().map(|m| color_distance(&used_filament_info[i].color, &m.color)).collect())
            .collect();
        let unlink: LinkLimits = filaments
            .iter()
            .enumerate()
            .filter_map(|(from, &i)| {
                let info = &used_filament_info[i];
                let blocked: Vec<usize> = machine
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.filament_type != info.filament_type || m.is_support != info.is_support)
                    .map(|(to, _)| to)
                    .collect();
                (!blocked.is_empty()).then_some((from, blocked))
            })
            .collect();

        let solver = MatchModeGroupSolver::new(
            &distances,
            (0..filaments.len()).collect(),
            (0..machine.len()).collect(),
            vec![filaments.len(); machine.len()],
            unlink,
        );
        for (from, slot) in solver.solve().into_iter().enumerate() {
            cost += match slot.map(|to| distances[from][to]) {
                Some(d) if d <= color_threshold => d,
                _ => FAIL_COST,
            };
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;

    const RED: Color = Color::rgb(255, 0, 0);
    const BLUE: Color = Color::rgb(0, 0, 255);

    fn loaded() -> Vec<Vec<MachineFilamentInfo>> {
        vec![
            vec![MachineFilamentInfo::new(RED, "PLA", 0)],
            vec![MachineFilamentInfo::new(BLUE, "PLA", 1)],
        ]
    }

    fn used() -> Vec<FilamentInfo> {
        vec![FilamentInfo::new(RED, "PLA"), FilamentInfo::new(BLUE, "PLA")]
    }

    #[test]
    fn test_prefers_map_matching_loaded_colors() {
        let candidates = vec![vec![1, 0], vec![0, 1]];
        let best = select_best_group_for_ams(&candidates, &[0, 1], &[0, 1], &used(), &loaded(), DEFAULT_COLOR_THRESHOLD);
        assert_eq!(best, Some(vec![0, 1]));
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        let candidates = vec![vec![1, 1], vec![0, 0]];
        let empty = vec![Vec::new(), Vec::new()];
        let best = select_best_group_for_ams(&candidates, &[0, 1], &[0, 1], &used(), &empty, DEFAULT_COLOR_THRESHOLD);
        assert_eq!(best, Some(vec![1, 1]));
    }

    #[test]
    fn test_type_mismatch_fails_the_match() {
        let machine = vec![vec![MachineFilamentInfo::new(RED, "PETG", 0)], Vec::new()];
        let cost = group_cost(&[0], &[0, 1], &[0], &used()[..1], &machine, DEFAULT_COLOR_THRESHOLD);
        assert_eq!(cost, FAIL_COST);
    }

    #[test]
    fn test_nozzle_labels_map_to_extruders() {
        // nozzles 0 and 1 sit on extruder 0, nozzle 2 on extruder 1
        let candidates = vec![vec![2, 1], vec![1, 2]];
        let best = select_best_group_for_ams(&candidates, &[0, 0, 1], &[0, 1], &used(), &loaded(), DEFAULT_COLOR_THRESHOLD);
        assert_eq!(best, Some(vec![1, 2]));
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(
            select_best_group_for_ams(&[], &[], &[], &[], &loaded(), DEFAULT_COLOR_THRESHOLD),
            None
        );
    }
}
