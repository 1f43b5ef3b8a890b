//! Helpers shared by the grouping entry points.
//!
//! Most of these translate between filament ids (indices into the project's
//! filament list) and used-filament indices (positions in the sorted list of
//! filaments that actually appear on some layer).

use std::collections::{BTreeMap, BTreeSet};

use super::context::{FilamentUsageType, MachineFilamentInfo};
use crate::color::Color;
use crate::nozzle::{NozzleInfo, NozzleVolumeType};

/// Element -> the one cluster it may not join.
pub type UnplaceableLimits = BTreeMap<usize, usize>;

/// Element -> the clusters it may not join.
pub type UnplaceableSets = BTreeMap<usize, Vec<usize>>;

/// Distinct filaments over all layers, ascending.
pub fn collect_sorted_used_filaments(layer_filaments: &[Vec<usize>]) -> Vec<usize> {
    let set: BTreeSet<usize> = layer_filaments.iter().flatten().copied().collect();
    set.into_iter().collect()
}

/// Remove the common elements of `a` and `b` from both. Returns whether any
/// element was removed.
pub fn remove_intersection(a: &mut BTreeSet<usize>, b: &mut BTreeSet<usize>) -> bool {
    let common: Vec<usize> = a.intersection(b).copied().collect();
    for item in &common {
        a.remove(item);
        b.remove(item);
    }
    !common.is_empty()
}

/// Translate per-group filament sets into per-group used-filament indices,
/// dropping filaments that are not used.
fn extract_indices(used_filaments: &[usize], unprintable: &[BTreeSet<usize>]) -> Vec<BTreeSet<usize>> {
    unprintable
        .iter()
        .map(|group| {
            group
                .iter()
                .filter_map(|f| used_filaments.iter().position(|u| u == f))
                .collect()
        })
        .collect()
}

/// Map per-extruder unprintable filament sets onto used indices.
///
/// Filaments unprintable on both of the first two extruders are dropped since
/// no placement could satisfy them. When a filament is still listed for
/// several groups the lowest group wins.
pub fn extract_unprintable_limit_indices(
    unprintable: &[BTreeSet<usize>],
    used_filaments: &[usize],
) -> UnplaceableLimits {
    let mut idxs = extract_indices(used_filaments, unprintable);
    if let [first, second, ..] = idxs.as_mut_slice() {
        remove_intersection(first, second);
    }

    let mut limits = UnplaceableLimits::new();
    for (gid, group) in idxs.iter().enumerate() {
        for &f in group {
            limits.entry(f).or_insert(gid);
        }
    }
    limits
}

/// Like [`extract_unprintable_limit_indices`] but keeps every forbidden group.
pub fn extract_unprintable_limit_sets(
    unprintable: &[BTreeSet<usize>],
    used_filaments: &[usize],
) -> UnplaceableSets {
    let mut idxs = extract_indices(used_filaments, unprintable);
    if let [first, second, ..] = idxs.as_mut_slice() {
        remove_intersection(first, second);
    }

    let mut limits = UnplaceableSets::new();
    for (gid, group) in idxs.iter().enumerate() {
        for &f in group {
            limits.entry(f).or_default().push(gid);
        }
    }
    for groups in limits.values_mut() {
        groups.sort_unstable();
        groups.dedup();
    }
    limits
}

/// Used filaments that no extruder among the first `extruder_count` can
/// print.
pub fn collect_unprintable_everywhere(
    unprintable: &[BTreeSet<usize>],
    extruder_count: usize,
    used_filaments: &[usize],
) -> Vec<usize> {
    if extruder_count == 0 || unprintable.len() < extruder_count {
        return Vec::new();
    }
    used_filaments
        .iter()
        .copied()
        .filter(|f| unprintable[..extruder_count].iter().all(|set| set.contains(f)))
        .collect()
}

/// Whether no group holds a filament that is unprintable on it.
pub fn check_printable(groups: &[BTreeSet<usize>], unprintable: &UnplaceableLimits) -> bool {
    groups.iter().enumerate().all(|(gid, group)| {
        group
            .iter()
            .all(|f| unprintable.get(f).map_or(true, |&forbidden| forbidden != gid))
    })
}

/// Merge physical and geometric unprintable limits of a two-extruder machine.
///
/// Returns the merged per-extruder sets and whether the inputs were free of
/// conflicts. A filament unprintable on both extruders by the same kind of
/// limit is dropped. When the two kinds disagree, the first seen wins.
pub fn collect_unprintable_limits(
    physical: &[BTreeSet<usize>],
    geometric: &[BTreeSet<usize>],
) -> (Vec<BTreeSet<usize>>, bool) {
    let resized = |sets: &[BTreeSet<usize>]| {
        let mut ret: Vec<BTreeSet<usize>> = sets.iter().take(2).cloned().collect();
        ret.resize(2, BTreeSet::new());
        ret
    };
    let mut physical = resized(physical);
    let mut geometric = resized(geometric);

    let mut conflict = false;
    {
        let (a, b) = physical.split_at_mut(1);
        conflict |= remove_intersection(&mut a[0], &mut b[0]);
    }
    {
        let (a, b) = geometric.split_at_mut(1);
        conflict |= remove_intersection(&mut a[0], &mut b[0]);
    }

    let mut filament_extruder: BTreeMap<usize, usize> = BTreeMap::new();
    for sets in [&physical, &geometric] {
        for (eid, set) in sets.iter().enumerate() {
            for &f in set {
                match filament_extruder.get(&f) {
                    Some(&prev) if prev != eid => conflict = true,
                    _ => {
                        filament_extruder.insert(f, eid);
                    }
                }
            }
        }
    }

    let mut limits = vec![BTreeSet::new(); 2];
    for (f, eid) in filament_extruder {
        limits[eid].insert(f);
    }
    (limits, !conflict)
}

/// Filament capacity per extruder from its AMS units.
///
/// `ams_counts[e]` maps slots-per-unit to number of units. An extruder
/// without AMS still has the external spool unless `ignore_ext_filament`.
pub fn calc_max_group_size(ams_counts: &[BTreeMap<usize, usize>], ignore_ext_filament: bool) -> Vec<usize> {
    let mut sizes = vec![0usize; ams_counts.len().max(2)];
    for (size, counts) in sizes.iter_mut().zip(ams_counts) {
        *size = counts.iter().map(|(slots, units)| slots * units).sum();
    }
    if !ignore_ext_filament {
        for size in sizes.iter_mut().filter(|s| **s == 0) {
            *size = 1;
        }
    }
    sizes
}

// ============================================================================
// Machine Filaments
// ============================================================================

/// Raw description of one printer tray as reported by the machine.
#[derive(Debug, Clone, Default)]
pub struct MachineSlotConfig {
    pub color: String,
    pub filament_type: String,
    pub tray_name: String,
    pub is_support: bool,
}

/// Name of the external spool tray.
const EXT_TRAY_NAME: &str = "Ext";

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Strip support decorations from a reported filament type.
///
/// `Sup.PLA` and `PLA-S` both normalize to `PLA`.
pub fn normalize_filament_type(reported: &str) -> &str {
    if let Some(rest) = reported.strip_prefix("Sup") {
        let mut chars = rest.chars();
        if chars.next().is_some() && is_word(chars.as_str()) {
            return chars.as_str();
        }
    }
    if let Some(base) = reported.strip_suffix("-S") {
        if is_word(base) {
            return base;
        }
    }
    reported
}

/// Loaded materials per extruder.
///
/// Trays with a missing color, type or name are skipped. External spools are
/// used only when the extruder has no AMS material and `ignore_ext_filament`
/// is off.
pub fn build_machine_filaments(
    slot_configs: &[Vec<MachineSlotConfig>],
    ignore_ext_filament: bool,
) -> Vec<Vec<MachineFilamentInfo>> {
    let mut machine = vec![Vec::new(); slot_configs.len().max(2)];
    for (extruder, slots) in slot_configs.iter().enumerate() {
        let full: Vec<MachineFilamentInfo> = slots
            .iter()
            .filter(|s| !s.color.is_empty() && !s.filament_type.is_empty() && !s.tray_name.is_empty())
            .filter_map(|s| {
                let color = Color::from_hex(&s.color).ok()?;
                Some(MachineFilamentInfo {
                    color,
                    filament_type: normalize_filament_type(&s.filament_type).to_string(),
                    is_support: s.is_support,
                    extruder_id: extruder,
                    is_extended: s.tray_name == EXT_TRAY_NAME,
                })
            })
            .collect();

        let (ext, ams): (Vec<_>, Vec<_>) = full.into_iter().partition(|m| m.is_extended);
        machine[extruder] = if ams.is_empty() && !ignore_ext_filament { ext } else { ams };
    }
    machine
}

// ============================================================================
// Usage
// ============================================================================

/// The filaments one printed object uses.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilamentUsage {
    pub model_filaments: Vec<usize>,
    pub support_filament: Option<usize>,
    pub support_interface_filament: Option<usize>,
}

/// Usage type per filament.
///
/// Filaments flagged as support material are support-only. Otherwise the
/// usage follows what the objects print with the filament.
pub fn build_filament_usage_types(
    filament_is_support: &[bool],
    objects: &[ObjectFilamentUsage],
) -> Vec<FilamentUsageType> {
    filament_is_support
        .iter()
        .enumerate()
        .map(|(idx, &flagged)| {
            if flagged {
                return FilamentUsageType::SupportOnly;
            }
            let is_model = objects.iter().any(|o| o.model_filaments.contains(&idx));
            let is_support = objects
                .iter()
                .any(|o| o.support_filament == Some(idx) || o.support_interface_filament == Some(idx));
            match (is_model, is_support) {
                (true, true) => FilamentUsageType::Hybrid,
                (false, true) => FilamentUsageType::SupportOnly,
                _ => FilamentUsageType::ModelOnly,
            }
        })
        .collect()
}

/// Copy `new_values` into `old_values` at the used filament positions.
pub fn update_used_filament_values(old_values: &[usize], new_values: &[usize], used_filaments: &[usize]) -> Vec<usize> {
    let mut ret = old_values.to_vec();
    for &f in used_filaments {
        if let (Some(slot), Some(&value)) = (ret.get_mut(f), new_values.get(f)) {
            *slot = value;
        }
    }
    ret
}

/// Fold nozzle volume-type restrictions into the used-index limits.
///
/// A filament that cannot be printed with the volume type of some nozzle is
/// kept off that nozzle's extruder. When the restrictions point at more than
/// one extruder the filament is left unrestricted.
pub fn rebuild_unprintables(
    used_filaments: &[usize],
    extruder_unprintables: &UnplaceableLimits,
    unprintable_volumes: &BTreeMap<usize, BTreeSet<NozzleVolumeType>>,
    nozzle_list: &[NozzleInfo],
) -> UnplaceableLimits {
    let mut ret = UnplaceableLimits::new();
    for (idx, filament) in used_filaments.iter().enumerate() {
        let mut blocked = extruder_unprintables.get(&idx).copied();
        let mut multiple = false;
        if let Some(volumes) = unprintable_volumes.get(filament) {
            for nozzle in nozzle_list.iter().filter(|n| volumes.contains(&n.volume_type)) {
                match blocked {
                    None => blocked = Some(nozzle.extruder_id),
                    Some(e) if e != nozzle.extruder_id => multiple = true,
                    Some(_) => {}
                }
            }
        }
        if let (Some(extruder), false) = (blocked, multiple) {
            ret.insert(idx, extruder);
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[usize]) -> BTreeSet<usize> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_collect_unprintable_everywhere() {
        let unprintable = vec![set(&[1, 2]), set(&[2, 3]), set(&[2])];
        assert_eq!(collect_unprintable_everywhere(&unprintable, 2, &[0, 1, 2, 3]), vec![2]);
        assert_eq!(collect_unprintable_everywhere(&unprintable, 3, &[0, 1, 3]), Vec::<usize>::new());
        assert!(collect_unprintable_everywhere(&unprintable[..1], 2, &[2]).is_empty());
    }

    #[test]
    fn test_collect_sorted_used_filaments() {
        let layers = vec![vec![3, 1], vec![], vec![1, 0, 3]];
        assert_eq!(collect_sorted_used_filaments(&layers), vec![0, 1, 3]);
    }

    #[test]
    fn test_remove_intersection() {
        let mut a = set(&[1, 2, 3]);
        let mut b = set(&[3, 4]);
        assert!(remove_intersection(&mut a, &mut b));
        assert_eq!(a, set(&[1, 2]));
        assert_eq!(b, set(&[4]));
        assert!(!remove_intersection(&mut a, &mut b));
    }

    #[test]
    fn test_extract_unprintable_limit_indices() {
        // filament 5 is unused, filament 2 is unprintable everywhere
        let unprintable = vec![set(&[2, 5, 7]), set(&[2, 3])];
        let used = vec![2, 3, 7];
        let limits = extract_unprintable_limit_indices(&unprintable, &used);
        assert_eq!(limits, BTreeMap::from([(1, 1), (2, 0)]));

        let sets = extract_unprintable_limit_sets(&unprintable, &used);
        assert_eq!(sets, BTreeMap::from([(1, vec![1]), (2, vec![0])]));
    }

    #[test]
    fn test_check_printable() {
        let limits = BTreeMap::from([(0, 1)]);
        assert!(check_printable(&[set(&[0]), set(&[1])], &limits));
        assert!(!check_printable(&[set(&[1]), set(&[0])], &limits));
    }

    #[test]
    fn test_collect_unprintable_limits() {
        let (limits, ok) = collect_unprintable_limits(&[set(&[1])], &[set(&[]), set(&[2])]);
        assert!(ok);
        assert_eq!(limits, vec![set(&[1]), set(&[2])]);

        let (limits, ok) = collect_unprintable_limits(&[set(&[1])], &[set(&[]), set(&[1])]);
        assert!(!ok);
        assert_eq!(limits, vec![set(&[1]), set(&[])]);

        let (limits, ok) = collect_unprintable_limits(&[set(&[4]), set(&[4])], &[]);
        assert!(!ok);
        assert!(limits.iter().all(|s| s.is_empty()));
    }

    #[test]
    fn test_calc_max_group_size() {
        let counts = vec![BTreeMap::from([(4, 2), (1, 1)]), BTreeMap::new()];
        assert_eq!(calc_max_group_size(&counts, false), vec![9, 1]);
        assert_eq!(calc_max_group_size(&counts, true), vec![9, 0]);
    }

    #[test]
    fn test_normalize_filament_type() {
        assert_eq!(normalize_filament_type("Sup.PLA"), "PLA");
        assert_eq!(normalize_filament_type("PETG-S"), "PETG");
        assert_eq!(normalize_filament_type("PLA"), "PLA");
        assert_eq!(normalize_filament_type("Sup."), "Sup.");
    }

    fn slot(color: &str, ty: &str, tray: &str) -> MachineSlotConfig {
        MachineSlotConfig {
            color: color.to_string(),
            filament_type: ty.to_string(),
            tray_name: tray.to_string(),
            is_support: false,
        }
    }

    #[test]
    fn test_build_machine_filaments() {
        let configs = vec![
            vec![slot("#FF0000", "Sup.PLA", "A1"), slot("#00FF00", "PLA", "Ext"), slot("", "PLA", "A2")],
            vec![slot("#0000FF", "PETG", "Ext")],
        ];
        let machine = build_machine_filaments(&configs, false);
        assert_eq!(machine.len(), 2);
        assert_eq!(machine[0].len(), 1);
        assert_eq!(machine[0][0].filament_type, "PLA");
        assert!(!machine[0][0].is_extended);
        assert_eq!(machine[1].len(), 1);
        assert!(machine[1][0].is_extended);
        assert_eq!(machine[1][0].extruder_id, 1);

        let machine = build_machine_filaments(&configs, true);
        assert!(machine[1].is_empty());
    }

    #[test]
    fn test_build_filament_usage_types() {
        let objects = vec![ObjectFilamentUsage {
            model_filaments: vec![0, 1],
            support_filament: Some(1),
            support_interface_filament: Some(2),
        }];
        let types = build_filament_usage_types(&[false, false, false, true, false], &objects);
        assert_eq!(
            types,
            vec![
                FilamentUsageType::ModelOnly,
                FilamentUsageType::Hybrid,
                FilamentUsageType::SupportOnly,
                FilamentUsageType::SupportOnly,
                FilamentUsageType::ModelOnly,
            ]
        );
    }

    #[test]
    fn test_update_used_filament_values() {
        assert_eq!(update_used_filament_values(&[0, 0, 0], &[1, 1, 1], &[0, 2]), vec![1, 0, 1]);
    }

    #[test]
    fn test_rebuild_unprintables() {
        let nozzles = vec![
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 0, 0),
            NozzleInfo::new(0.4, NozzleVolumeType::HighFlow, 1, 1),
        ];
        let volumes = BTreeMap::from([
            (10, BTreeSet::from([NozzleVolumeType::HighFlow])),
            (11, BTreeSet::from([NozzleVolumeType::HighFlow, NozzleVolumeType::Standard])),
            (12, BTreeSet::from([NozzleVolumeType::Standard])),
        ]);
        let used = vec![10, 11, 12, 13];
        let ret = rebuild_unprintables(&used, &BTreeMap::from([(3, 0)]), &volumes, &nozzles);
        assert_eq!(ret, BTreeMap::from([(0, 1), (2, 0), (3, 0)]));

        // the volume limit contradicts the extruder limit
        let ret = rebuild_unprintables(&used, &BTreeMap::from([(0, 0)]), &volumes, &nozzles);
        assert!(!ret.contains_key(&0));
    }
}
