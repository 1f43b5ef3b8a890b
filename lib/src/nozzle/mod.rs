//! Nozzle topology and per-layer usage counting.
//!
//! A printer exposes an ordered list of nozzles. Each nozzle belongs to one
//! physical extruder and carries a unique id (its index in the list). In
//! multi-nozzle mode filaments are assigned to nozzle ids; the extruder is
//! derived from the nozzle.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Flow class of a nozzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NozzleVolumeType {
    #[default]
    Standard,
    HighFlow,
    /// Accepts filaments expecting any volume type.
    Hybrid,
    TpuHighFlow,
}

impl fmt::Display for NozzleVolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standard => "Standard",
            Self::HighFlow => "High Flow",
            Self::Hybrid => "Hybrid",
            Self::TpuHighFlow => "TPU High Flow",
        };
        write!(f, "{}", name)
    }
}

/// A single physical nozzle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NozzleInfo {
    pub diameter: f64,
    pub volume_type: NozzleVolumeType,
    pub extruder_id: usize,
    /// Unique nozzle id, equal to the nozzle's index in the nozzle list.
    pub group_id: usize,
}

impl NozzleInfo {
    pub fn new(diameter: f64, volume_type: NozzleVolumeType, extruder_id: usize, group_id: usize) -> Self {
        Self {
            diameter,
            volume_type,
            extruder_id,
            group_id,
        }
    }
}

/// Map each extruder to the sorted ids of its nozzles.
pub fn build_extruder_nozzle_list(nozzles: &[NozzleInfo]) -> BTreeMap<usize, Vec<usize>> {
    let mut ret: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for nozzle in nozzles {
        ret.entry(nozzle.extruder_id).or_default().push(nozzle.group_id);
    }
    for ids in ret.values_mut() {
        ids.sort_unstable();
    }
    ret
}

// ============================================================================
// Group Result
// ============================================================================

/// A filament -> nozzle assignment with extruder lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiNozzleGroupResult {
    filament_nozzles: BTreeMap<usize, NozzleInfo>,
}

impl MultiNozzleGroupResult {
    /// Register every filament of `filament_nozzle_map`.
    pub fn new(filament_nozzle_map: &[usize], nozzles: &[NozzleInfo]) -> Self {
        let all: Vec<usize> = (0..filament_nozzle_map.len()).collect();
        Self::for_filaments(filament_nozzle_map, nozzles, &all)
    }

    /// Register only `filaments`; ids outside the nozzle list are skipped.
    pub fn for_filaments(filament_nozzle_map: &[usize], nozzles: &[NozzleInfo], filaments: &[usize]) -> Self {
        let filament_nozzles = filaments
            .iter()
            .filter_map(|&f| {
                let nozzle = nozzles.get(*filament_nozzle_map.get(f)?)?;
                Some((f, nozzle.clone()))
            })
            .collect();
        Self { filament_nozzles }
    }

    pub fn nozzle_for_filament(&self, filament: usize) -> Option<&NozzleInfo> {
        self.filament_nozzles.get(&filament)
    }

    pub fn extruder_id(&self, filament: usize) -> Option<usize> {
        self.nozzle_for_filament(filament).map(|n| n.extruder_id)
    }

    pub fn are_filaments_same_extruder(&self, a: usize, b: usize) -> bool {
        matches!((self.extruder_id(a), self.extruder_id(b)), (Some(x), Some(y)) if x == y)
    }

    pub fn are_filaments_same_nozzle(&self, a: usize, b: usize) -> bool {
        match (self.nozzle_for_filament(a), self.nozzle_for_filament(b)) {
            (Some(x), Some(y)) => x.group_id == y.group_id,
            _ => false,
        }
    }

    /// Sorted extruders holding at least one filament.
    pub fn extruder_list(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self.filament_nozzles.values().map(|n| n.extruder_id).collect();
        set.into_iter().collect()
    }

    pub fn extruder_count(&self) -> usize {
        self.extruder_list().len()
    }

    /// Distinct nozzles in use, optionally restricted to one extruder.
    pub fn nozzle_count(&self, extruder: Option<usize>) -> usize {
        self.filament_nozzles
            .values()
            .filter(|n| extruder.map_or(true, |e| n.extruder_id == e))
            .map(|n| n.group_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Sorted extruders touched by `filaments`.
    pub fn used_extruders(&self, filaments: &[usize]) -> Vec<usize> {
        let set: BTreeSet<usize> = filaments.iter().filter_map(|&f| self.extruder_id(f)).collect();
        set.into_iter().collect()
    }

    /// Nozzles touched by `filaments`, ordered by id, optionally restricted to
    /// one extruder.
    pub fn used_nozzles(&self, filaments: &[usize], extruder: Option<usize>) -> Vec<NozzleInfo> {
        let mut by_id: BTreeMap<usize, &NozzleInfo> = BTreeMap::new();
        for nozzle in filaments.iter().filter_map(|&f| self.nozzle_for_filament(f)) {
            if extruder.map_or(true, |e| nozzle.extruder_id == e) {
                by_id.insert(nozzle.group_id, nozzle);
            }
        }
        by_id.into_values().cloned().collect()
    }

    /// `(extruders, nozzles)` touched by `filaments`.
    pub fn used_extruders_nozzles_count(&self, filaments: &[usize]) -> (usize, usize) {
        (self.used_extruders(filaments).len(), self.used_nozzles(filaments, None).len())
    }
}

// ============================================================================
// Change Estimates
// ============================================================================

/// Extruder switches implied by `result`, one per extra extruder per layer.
pub fn estimate_extruder_change_count(layers: &[Vec<usize>], result: &MultiNozzleGroupResult) -> usize {
    layers
        .iter()
        .map(|layer| result.used_extruders(layer).len().saturating_sub(1))
        .sum()
}

/// Nozzle switches within an extruder implied by `result`.
pub fn estimate_nozzle_change_count(layers: &[Vec<usize>], result: &MultiNozzleGroupResult) -> usize {
    let extruders = result.extruder_list();
    layers
        .iter()
        .map(|layer| {
            extruders
                .iter()
                .map(|&e| result.used_nozzles(layer, Some(e)).len().saturating_sub(1))
                .sum::<usize>()
        })
        .sum()
}

/// `(extruder changes, filament changes)` over all layers.
///
/// A layer touching `e` extruders costs `e - 1` extruder changes and
/// `filaments - e` filament changes. Empty layers cost nothing.
pub fn estimate_extruder_filament_change_count(
    layers: &[Vec<usize>],
    result: &MultiNozzleGroupResult,
) -> (usize, usize) {
    layers.iter().fold((0, 0), |(extruder_changes, filament_changes), layer| {
        let extruders = result.used_extruders(layer).len();
        (
            extruder_changes + extruders.saturating_sub(1),
            filament_changes + layer.len().saturating_sub(extruders),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nozzles() -> Vec<NozzleInfo> {
        vec![
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 0, 0),
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 1, 1),
            NozzleInfo::new(0.4, NozzleVolumeType::HighFlow, 1, 2),
        ]
    }

    #[test]
    fn test_build_extruder_nozzle_list() {
        let mut list = nozzles();
        list.swap(1, 2);
        let map = build_extruder_nozzle_list(&list);
        assert_eq!(map.get(&0), Some(&vec![0]));
        assert_eq!(map.get(&1), Some(&vec![1, 2]));
    }

    #[test]
    fn test_group_result_lookups() {
        let result = MultiNozzleGroupResult::new(&[0, 1, 2, 2], &nozzles());
        assert_eq!(result.extruder_id(0), Some(0));
        assert_eq!(result.extruder_id(2), Some(1));
        assert_eq!(result.extruder_id(9), None);
        assert!(result.are_filaments_same_extruder(1, 2));
        assert!(!result.are_filaments_same_nozzle(1, 2));
        assert!(result.are_filaments_same_nozzle(2, 3));
        assert!(!result.are_filaments_same_extruder(0, 9));
        assert_eq!(result.extruder_list(), vec![0, 1]);
        assert_eq!(result.extruder_count(), 2);
        assert_eq!(result.nozzle_count(None), 3);
        assert_eq!(result.nozzle_count(Some(1)), 2);
    }

    #[test]
    fn test_group_result_restricted_filaments() {
        let result = MultiNozzleGroupResult::for_filaments(&[0, 1, 2], &nozzles(), &[0, 2]);
        assert_eq!(result.extruder_id(1), None);
        assert_eq!(result.used_extruders(&[0, 1, 2]), vec![0, 1]);
    }

    #[test]
    fn test_used_nozzles() {
        let result = MultiNozzleGroupResult::new(&[0, 1, 2, 2], &nozzles());
        let used = result.used_nozzles(&[3, 1, 2], Some(1));
        let ids: Vec<usize> = used.iter().map(|n| n.group_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(result.used_nozzles(&[0, 3], Some(0)).len(), 1);
        assert_eq!(result.used_extruders_nozzles_count(&[0, 1, 2, 3]), (2, 3));
    }

    #[test]
    fn test_change_estimates() {
        let result = MultiNozzleGroupResult::new(&[0, 1, 2, 2], &nozzles());
        let layers = vec![vec![0, 1, 2], vec![3], vec![], vec![1, 2, 3]];
        assert_eq!(estimate_extruder_change_count(&layers, &result), 1);
        assert_eq!(estimate_nozzle_change_count(&layers, &result), 2);
        // layer 0: 2 extruders, 3 filaments; layer 1: 1/1; layer 3: 1/3
        assert_eq!(estimate_extruder_filament_change_count(&layers, &result), (1, 3));
    }

    #[test]
    fn test_volume_type_serde() {
        let json = serde_json::to_string(&NozzleVolumeType::TpuHighFlow).unwrap();
        assert_eq!(json, "\"tpu_high_flow\"");
        assert_eq!(NozzleVolumeType::HighFlow.to_string(), "High Flow");
    }
}
