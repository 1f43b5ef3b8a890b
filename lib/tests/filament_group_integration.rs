//! End-to-end filament grouping tests.
//!
//! These tests drive the public API the way a slicer does:
//! - Flush grouping by enumeration and by clustering
//! - Unprintable limits and capacities
//! - Match grouping against loaded materials
//! - Multi-nozzle refinement
//! - Context (de)serialization

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use filament_group::grouping::{
    collect_sorted_used_filaments, FlushDistanceEvaluator, MemoryedGroup, MemoryedGroups,
    ABSOLUTE_FLUSH_GAP_TOLERANCE, ENUM_THRESHOLD, PAM_TIMEOUT,
};
use filament_group::{
    calc_filament_group_for_manual_multi_nozzle, Color, FilamentGroup, FilamentGroupContext, FilamentInfo,
    FlushMatrix, GroupMode, MachineFilamentInfo, NozzleInfo, NozzleVolumeType,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const RED: Color = Color::rgb(255, 0, 0);
const GREEN: Color = Color::rgb(0, 200, 0);
const BLUE: Color = Color::rgb(0, 0, 255);

fn palette(n: usize) -> Vec<FilamentInfo> {
    (0..n)
        .map(|i| FilamentInfo::new(Color::rgb((i * 21) as u8, (255 - i * 17) as u8, 128), "PLA"))
        .collect()
}

/// Filaments `2k` and `2k + 1` are cheap to switch between, everything else
/// is expensive.
fn paired_flush(n: usize) -> FlushMatrix {
    let mut m = FlushMatrix::new(n, 600.0);
    for a in 0..n {
        for b in 0..n {
            if a != b && a / 2 == b / 2 {
                m.set(a, b, 15.0);
            }
        }
    }
    m
}

fn random_flush(rng: &mut StdRng, n: usize) -> FlushMatrix {
    let mut m = FlushMatrix::new(n, 0.0);
    for a in 0..n {
        for b in 0..n {
            if a != b {
                m.set(a, b, rng.random_range(10.0..700.0));
            }
        }
    }
    m
}

fn assert_complete(map: &[usize], total: usize, extruders: usize) {
    assert_eq!(map.len(), total);
    assert!(map.iter().all(|&e| e < extruders), "invalid label in {:?}", map);
}

/// Test the basic split of two cheap pairs
#[test]
fn test_four_filaments_split_into_cheap_pairs() {
    let flush = paired_flush(4);
    let layers = vec![vec![0, 1, 2, 3]; 5];
    let ctx = FilamentGroupContext::new(vec![flush.clone(), flush], layers, palette(4));

    let outcome = FilamentGroup::new(ctx).unwrap().calc_filament_group();
    let map = outcome.filament_map;

    assert_complete(&map, 4, 2);
    assert_eq!(map[0], map[1]);
    assert_eq!(map[2], map[3]);
    assert_ne!(map[0], map[2]);
    assert!(outcome.cost.unwrap() >= 0.0);
}

/// Test that an unprintable filament is moved off its extruder
#[test]
fn test_forced_placement_of_unprintable_filament() {
    // filament 2 would happily join 0 and 1 on extruder 0
    let mut flush = FlushMatrix::new(4, 20.0);
    for f in 0..3 {
        flush.set(3, f, 900.0);
        flush.set(f, 3, 900.0);
    }
    let layers = vec![vec![0, 1, 2, 3]; 3];
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], layers, palette(4));
    ctx.model_info.unprintable_filaments[0].insert(2);

    let map = FilamentGroup::new(ctx).unwrap().calc_filament_group().filament_map;
    assert_complete(&map, 4, 2);
    assert_eq!(map[2], 1);
}

/// Test that a filament no extruder can print lands on the master extruder
#[test]
fn test_unprintable_everywhere_lands_on_master() {
    let flush = paired_flush(4);
    let layers = vec![vec![0, 1, 2, 3]; 5];
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], layers, palette(4));
    ctx.model_info.unprintable_filaments[0].insert(2);
    ctx.model_info.unprintable_filaments[1].insert(2);
    ctx.machine_info.master_extruder_id = 1;

    let outcome = FilamentGroup::new(ctx).unwrap().calc_filament_group();
    assert_complete(&outcome.filament_map, 4, 2);
    assert_eq!(outcome.filament_map[2], 1);
    assert!(outcome.cost.is_some());
}

/// Test match mode with one filament left for the relaxed pass
#[test]
fn test_match_mode_partial_match() {
    let info = vec![
        FilamentInfo::new(RED, "PLA"),
        FilamentInfo::new(BLUE, "PLA"),
        FilamentInfo::new(GREEN, "PETG"),
    ];
    let flush = FlushMatrix::new(3, 200.0);
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2]], info);
    ctx.group_info.mode = GroupMode::Match;
    ctx.machine_info.machine_filament_info = vec![
        vec![MachineFilamentInfo::new(RED, "PLA", 0)],
        vec![
            MachineFilamentInfo::new(BLUE, "PLA", 1),
            MachineFilamentInfo::new(GREEN, "PLA", 1),
        ],
    ];

    let outcome = FilamentGroup::new(ctx).unwrap().calc_filament_group();
    assert_eq!(outcome.filament_map, vec![0, 1, 1]);
    assert_eq!(outcome.cost, None);
}

/// Test that match mode without loaded materials still groups by flush
#[test]
fn test_match_mode_without_materials_falls_back() {
    let flush = paired_flush(4);
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2, 3]], palette(4));
    ctx.group_info.mode = GroupMode::Match;

    let outcome = FilamentGroup::new(ctx).unwrap().calc_filament_group();
    assert_complete(&outcome.filament_map, 4, 2);
    assert!(outcome.cost.is_some());
}

/// Test that 12 filaments are clustered within the time budget
#[test]
fn test_oversized_instance_uses_clustering() {
    let n = 12;
    assert!(n >= ENUM_THRESHOLD);
    let flush = paired_flush(n);
    let layers: Vec<Vec<usize>> = (0..20).map(|l| (0..n).filter(|f| (f + l) % 3 != 0).collect()).collect();
    let ctx = FilamentGroupContext::new(vec![flush.clone(), flush], layers, palette(n));
    let used = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);
    let mut clustered = FilamentGroup::new(ctx.clone()).unwrap();
    let (expected_map, expected_cost) = clustered.calc_min_flush_group_by_pam2(&used, PAM_TIMEOUT);

    let mut fg = FilamentGroup::new(ctx).unwrap();
    let start = Instant::now();
    let outcome = fg.calc_filament_group();
    let elapsed = start.elapsed();

    assert_complete(&outcome.filament_map, n, 2);
    assert!(elapsed < PAM_TIMEOUT + Duration::from_millis(250), "took {:?}", elapsed);
    assert_eq!(outcome.filament_map, expected_map);
    assert_eq!(outcome.cost, Some(expected_cost));
}

/// Test completeness and limit soundness over random small projects
#[test]
fn test_random_projects_are_complete_and_sound() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let n = rng.random_range(2..8);
        let flush = vec![random_flush(&mut rng, n), random_flush(&mut rng, n)];
        let layers: Vec<Vec<usize>> = (0..6)
            .map(|_| (0..n).filter(|_| rng.random_bool(0.7)).collect())
            .collect();
        let mut ctx = FilamentGroupContext::new(flush, layers, palette(n));
        let mut forbidden = BTreeMap::new();
        for f in 0..n {
            if rng.random_bool(0.3) {
                let e = rng.random_range(0..2);
                ctx.model_info.unprintable_filaments[e].insert(f);
                forbidden.insert(f, e);
            }
        }
        let used = collect_sorted_used_filaments(&ctx.model_info.layer_filaments);

        let map = FilamentGroup::new(ctx).unwrap().calc_filament_group().filament_map;
        assert_complete(&map, n, 2);
        for f in used {
            if let Some(&e) = forbidden.get(&f) {
                assert_ne!(map[f], e, "filament {} placed on unprintable extruder", f);
            }
        }
    }
}

/// Test that merging identical filaments and expanding is stable
#[test]
fn test_merge_then_expand_is_idempotent() {
    let flush = paired_flush(5);
    let mut info = palette(5);
    info[3].color = info[1].color;
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2, 3, 4]], info);
    ctx.model_info.filament_ids = vec!["GFA00".into(), "GFA01".into(), "GFB00".into(), "GFA01".into(), "GFC00".into()];

    let mut fg = FilamentGroup::new(ctx).unwrap();
    let merged = fg.try_merge_filaments();
    assert_eq!(merged, BTreeMap::from([(1, vec![1, 3])]));

    let solved = fg.calc_filament_group().filament_map;
    assert_eq!(solved[1], solved[3]);
    assert_eq!(FilamentGroup::separate_merged_filaments(&solved, &merged), solved);
}

/// Test the retained candidate pool over a random update sequence
#[test]
fn test_retention_monotonicity() {
    let mut rng = StdRng::seed_from_u64(7);
    let gap = 0.05;
    let mut pool = MemoryedGroups::new(gap);
    let mut max_prefer = i64::MIN;

    for i in 0..200 {
        let prefer = rng.random_range(0..3);
        let cost = if rng.random_bool(0.05) { 0.0 } else { rng.random_range(0.0..1000.0) };
        max_prefer = max_prefer.max(prefer);
        pool.update(MemoryedGroup::new(vec![i % 2], cost, prefer));

        let best = pool.best().cloned().unwrap();
        assert_eq!(best.prefer_level, max_prefer);
        for g in pool.clone().into_sorted_vec() {
            assert_eq!(g.prefer_level, best.prefer_level);
            let diff = (g.cost - best.cost).abs();
            if best.cost == 0.0 {
                assert!(diff <= ABSOLUTE_FLUSH_GAP_TOLERANCE);
            } else {
                assert!(diff / best.cost <= gap + 1e-12);
            }
        }
    }
}

/// Test distance properties on random flush data
#[test]
fn test_distance_properties() {
    let mut rng = StdRng::seed_from_u64(3);
    let n = 6;
    let flush = vec![random_flush(&mut rng, n), random_flush(&mut rng, n)];
    let used: Vec<usize> = (0..n).collect();
    let layers = vec![vec![0, 1, 2], vec![2, 3, 4, 5], vec![0, 5]];
    let eval = FlushDistanceEvaluator::new(&flush, &used, &layers);

    for e in 0..2 {
        for i in 0..n {
            assert_eq!(eval.distance(i, i, e), 0.0);
            for j in 0..n {
                assert!(eval.distance(i, j, e) >= 0.0);
                assert_eq!(eval.distance(i, j, e), eval.distance(j, i, e));
            }
        }
    }
}

/// Test the user chosen extruders survive nozzle refinement
#[test]
fn test_manual_multi_nozzle_grouping() {
    let flush = paired_flush(5);
    let ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2, 3, 4]], palette(5))
        .with_nozzles(vec![
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 0, 0),
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 1, 1),
            NozzleInfo::new(0.4, NozzleVolumeType::HighFlow, 1, 2),
        ]);
    let manual = vec![1, 1, 0, 0, 1];

    let nozzles = calc_filament_group_for_manual_multi_nozzle(&manual, &ctx).unwrap();
    assert_complete(&nozzles, 5, 3);
    for (f, &n) in nozzles.iter().enumerate() {
        assert_eq!(ctx.nozzle_info.nozzle_list[n].extruder_id, manual[f]);
    }
}

/// Test nozzle volume types on a multi-nozzle printer
#[test]
fn test_multi_nozzle_respects_unprintable_volumes() {
    let flush = paired_flush(4);
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2, 3]], palette(4))
        .with_nozzles(vec![
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 0, 0),
            NozzleInfo::new(0.4, NozzleVolumeType::Standard, 1, 1),
            NozzleInfo::new(0.4, NozzleVolumeType::HighFlow, 1, 2),
        ]);
    ctx.model_info.unprintable_volumes = BTreeMap::from([(0, BTreeSet::from([NozzleVolumeType::HighFlow]))]);

    let outcome = FilamentGroup::new(ctx).unwrap().calc_filament_group();
    let nozzles = outcome.nozzle_map.unwrap();
    assert_complete(&nozzles, 4, 3);
    assert_complete(&outcome.filament_map, 4, 2);
    assert_ne!(nozzles[0], 2);
}

/// Test context JSON round trip
#[test]
fn test_context_json_round_trip() {
    let flush = paired_flush(3);
    let mut ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 2], vec![1]], palette(3));
    ctx.model_info.unprintable_filaments[1].insert(2);
    ctx.machine_info.machine_filament_info[0].push(MachineFilamentInfo::new(RED, "PLA", 0));

    let json = ctx.to_json().unwrap();
    let parsed = FilamentGroupContext::from_json(&json).unwrap();
    assert_eq!(parsed, ctx);
}

/// Test that malformed contexts are rejected
#[test]
fn test_context_validation() {
    let flush = paired_flush(3);
    let json = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 5]], palette(3))
        .to_json()
        .unwrap();
    assert!(FilamentGroupContext::from_json(&json).is_err());
}
