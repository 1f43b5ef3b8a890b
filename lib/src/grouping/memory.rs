//! Retention of near-optimal candidate groupings.
//!
//! While searching, every evaluated grouping is offered to a
//! [`MemoryedGroups`] pool. The pool only keeps candidates of the highest
//! prefer level seen so far whose cost is close to the best one. A later
//! selection step (e.g. matching against loaded materials) picks from it.

/// Cost difference accepted when the best cost is zero.
pub const ABSOLUTE_FLUSH_GAP_TOLERANCE: f64 = 10.0;

/// A candidate grouping with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryedGroup {
    /// Cluster label per element.
    pub group: Vec<usize>,
    pub cost: f64,
    /// Higher is better and dominates cost.
    pub prefer_level: i64,
}

impl MemoryedGroup {
    pub fn new(group: Vec<usize>, cost: f64, prefer_level: i64) -> Self {
        Self {
            group,
            cost,
            prefer_level,
        }
    }

    fn is_better_than(&self, other: &Self) -> bool {
        self.prefer_level > other.prefer_level || (self.prefer_level == other.prefer_level && self.cost < other.cost)
    }
}

/// Pool of retained candidates.
#[derive(Debug, Clone, Default)]
pub struct MemoryedGroups {
    groups: Vec<MemoryedGroup>,
    gap_threshold: f64,
}

impl MemoryedGroups {
    pub fn new(gap_threshold: f64) -> Self {
        Self {
            groups: Vec::new(),
            gap_threshold,
        }
    }

    pub fn gap_threshold(&self) -> f64 {
        self.gap_threshold
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The highest prefer level, lowest cost candidate.
    pub fn best(&self) -> Option<&MemoryedGroup> {
        self.groups.iter().reduce(|best, g| if g.is_better_than(best) { g } else { best })
    }

    fn acceptable(&self, elem: &MemoryedGroup, best: &MemoryedGroup) -> bool {
        let gap = (elem.cost - best.cost).abs();
        if best.cost == 0.0 {
            return gap <= ABSOLUTE_FLUSH_GAP_TOLERANCE;
        }
        gap / best.cost.abs() <= self.gap_threshold
    }

    /// Offer a candidate to the pool.
    pub fn update(&mut self, item: MemoryedGroup) {
        let Some(top) = self.best().cloned() else {
            self.groups.push(item);
            return;
        };

        if top.prefer_level > item.prefer_level {
            return;
        }
        if top.prefer_level < item.prefer_level {
            self.groups = vec![item];
            return;
        }
        if top.cost <= item.cost {
            if self.acceptable(&item, &top) {
                self.groups.push(item);
            }
            return;
        }

        // new best: keep only the old candidates close enough to it
        let old = std::mem::take(&mut self.groups);
        let kept: Vec<MemoryedGroup> = old.into_iter().filter(|g| self.acceptable(g, &item)).collect();
        self.groups.push(item);
        self.groups.extend(kept);
    }

    /// Candidates ordered from best to worst.
    pub fn into_sorted_vec(mut self) -> Vec<MemoryedGroup> {
        self.groups.sort_by(|a, b| {
            b.prefer_level
                .cmp(&a.prefer_level)
                .then(a.cost.total_cmp(&b.cost))
        });
        self.groups
    }

    /// Labels of each candidate expanded to full filament maps.
    ///
    /// Element `i` of a candidate is written to `used_filaments[i]`; unused
    /// filaments get `fill`.
    pub fn to_filament_maps(
        &self,
        total_filament_num: usize,
        used_filaments: &[usize],
        fill: usize,
    ) -> Vec<Vec<usize>> {
        self.clone()
            .into_sorted_vec()
            .into_iter()
            .map(|g| {
                let mut labels = vec![fill; total_filament_num];
                for (idx, &label) in g.group.iter().enumerate() {
                    if let Some(slot) = used_filaments.get(idx).and_then(|&f| labels.get_mut(f)) {
                        *slot = label;
                    }
                }
                labels
            })
            .collect()
    }
}
