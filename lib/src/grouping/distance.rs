//! Pairwise filament distances and time estimates used to score groupings.

use std::collections::BTreeMap;

use crate::tool_order::FlushMatrix;

/// Default weight of the larger directional flush in a pair distance.
pub const DEFAULT_FLUSH_WEIGHT: f64 = 0.65;

const APPROX_DENSITY: f64 = 1.26; // g/cm^3
const APPROX_FLUSH_SPEED: f64 = 180.0; // s/g
const CORRECTION_FACTOR: f64 = 2.0;

/// Combine flush volume and print time into one score.
///
/// Without time the score is the flush volume itself. With time the volume
/// is first converted to an approximate purge duration.
pub fn evaluate_score(flush: f64, time: f64, with_time: bool) -> f64 {
    if !with_time {
        return flush;
    }
    let flush_score = flush * APPROX_DENSITY * APPROX_FLUSH_SPEED * CORRECTION_FACTOR / 1000.0;
    flush_score + time
}

/// Extruder-specific distance between used filaments.
///
/// The distance of two filaments blends both flush directions and is scaled by
/// the number of layers they share, so pairs that often print together are
/// pushed onto different extruders.
#[derive(Debug, Clone)]
pub struct FlushDistanceEvaluator {
    /// `[extruder][i][j]`, indexed by used-filament position.
    distances: Vec<Vec<Vec<f64>>>,
}

impl FlushDistanceEvaluator {
    pub fn new(flush_matrix: &[FlushMatrix], used_filaments: &[usize], layer_filaments: &[Vec<usize>]) -> Self {
        Self::with_weight(flush_matrix, used_filaments, layer_filaments, DEFAULT_FLUSH_WEIGHT)
    }

    pub fn with_weight(
        flush_matrix: &[FlushMatrix],
        used_filaments: &[usize],
        layer_filaments: &[Vec<usize>],
        p: f64,
    ) -> Self {
        let n = used_filaments.len();
        let position = |f: usize| used_filaments.iter().position(|&u| u == f);

        let mut counts = vec![vec![0usize; n]; n];
        for layer in layer_filaments {
            let idxs: Vec<usize> = layer.iter().filter_map(|&f| position(f)).collect();
            for (a, &i) in idxs.iter().enumerate() {
                for &j in &idxs[a + 1..] {
                    counts[i][j] += 1;
                    counts[j][i] += 1;
                }
            }
        }

        let distances = flush_matrix
            .iter()
            .map(|matrix| {
                (0..n)
                    .map(|i| {
                        (0..n)
                            .map(|j| {
                                if i == j {
                                    return 0.0;
                                }
                                let forward = f64::from(matrix.get(used_filaments[i], used_filaments[j]));
                                let backward = f64::from(matrix.get(used_filaments[j], used_filaments[i]));
                                let blended = forward.max(backward) * p + forward.min(backward) * (1.0 - p);
                                blended * counts[i][j].max(1) as f64
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();

        Self { distances }
    }

    /// Distance of used filaments `a` and `b` when both sit on `extruder`.
    pub fn distance(&self, a: usize, b: usize, extruder: usize) -> f64 {
        let value = self
            .distances
            .get(extruder)
            .and_then(|m| m.get(a))
            .and_then(|row| row.get(b))
            .copied();
        debug_assert!(value.is_some(), "distance ({}, {}) on extruder {} out of range", a, b, extruder);
        value.unwrap_or(0.0)
    }

    pub fn extruder_count(&self) -> usize {
        self.distances.len()
    }
}

/// Print time estimate of a grouping from per-extruder filament times.
#[derive(Debug, Clone, Copy)]
pub struct TimeEvaluator<'a> {
    filament_print_time: &'a BTreeMap<usize, BTreeMap<usize, f64>>,
}

impl<'a> TimeEvaluator<'a> {
    pub fn new(filament_print_time: &'a BTreeMap<usize, BTreeMap<usize, f64>>) -> Self {
        Self { filament_print_time }
    }

    /// Sum of each filament's time on the extruder it is mapped to.
    ///
    /// Filaments absent from the map or without a time for their extruder
    /// contribute nothing.
    pub fn estimated_time(&self, filament_map: &[usize]) -> f64 {
        self.filament_print_time
            .iter()
            .filter_map(|(filament, times)| times.get(filament_map.get(*filament)?))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> FlushMatrix {
        FlushMatrix::from_rows(vec![
            vec![0.0, 100.0, 50.0],
            vec![200.0, 0.0, 10.0],
            vec![50.0, 30.0, 0.0],
        ])
    }

    #[test]
    fn test_distance_blends_directions() {
        let eval = FlushDistanceEvaluator::new(&[matrix()], &[0, 1, 2], &[]);
        // 200 * 0.65 + 100 * 0.35
        assert!((eval.distance(0, 1, 0) - 165.0).abs() < 1e-9);
        assert_eq!(eval.distance(0, 1, 0), eval.distance(1, 0, 0));
        assert_eq!(eval.distance(2, 2, 0), 0.0);
        assert!(eval.distance(0, 2, 0) >= 0.0);
    }

    #[test]
    fn test_distance_scales_with_shared_layers() {
        let layers = vec![vec![0, 1], vec![0, 1, 2], vec![1, 0]];
        let eval = FlushDistanceEvaluator::new(&[matrix()], &[0, 1, 2], &layers);
        assert!((eval.distance(0, 1, 0) - 3.0 * 165.0).abs() < 1e-9);
        // shared only once, same as never shared
        let single = FlushDistanceEvaluator::new(&[matrix()], &[0, 1, 2], &[]);
        assert!((eval.distance(1, 2, 0) - single.distance(1, 2, 0)).abs() < 1e-9);
    }

    #[test]
    fn test_distance_uses_used_positions() {
        let eval = FlushDistanceEvaluator::new(&[matrix(), matrix()], &[1, 2], &[vec![1, 2]]);
        assert_eq!(eval.extruder_count(), 2);
        // 30 * 0.65 + 10 * 0.35
        assert!((eval.distance(0, 1, 1) - 23.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_evaluator() {
        let times = BTreeMap::from([
            (0, BTreeMap::from([(0, 10.0), (1, 12.0)])),
            (2, BTreeMap::from([(0, 5.0), (1, 4.0)])),
        ]);
        let eval = TimeEvaluator::new(&times);
        assert_eq!(eval.estimated_time(&[0, 0, 1]), 14.0);
        assert_eq!(eval.estimated_time(&[1, 0, 0]), 17.0);
        assert_eq!(eval.estimated_time(&[1]), 12.0);
    }

    #[test]
    fn test_evaluate_score() {
        assert_eq!(evaluate_score(100.0, 50.0, false), 100.0);
        let expected = 100.0 * 1.26 * 180.0 * 2.0 / 1000.0 + 50.0;
        assert!((evaluate_score(100.0, 50.0, true) - expected).abs() < 1e-9);
    }
}
