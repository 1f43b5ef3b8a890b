//! # Filament Grouping
//!
//! Decides which extruder (and, on multi-nozzle printers, which nozzle) prints
//! each filament of a multi-material project.
//!
//! ## Modes
//!
//! - **Flush**: minimize the purge volume spent switching filaments on a
//!   shared nozzle. Fewer than [`ENUM_THRESHOLD`] used filaments are solved
//!   exactly by enumerating every two-way split; larger instances use
//!   medoid clustering bounded by [`PAM_TIMEOUT`].
//! - **Match**: follow the materials already loaded in the printer, pairing
//!   each filament with the loaded material of the closest color. Falls back
//!   to flush mode when nothing is loaded.
//!
//! Near-optimal flush candidates are retained and re-ranked by how well they
//! fit the loaded materials before one is returned.
//!
//! ## Example
//!
//! ```rust,ignore
//! use filament_group::grouping::{FilamentGroup, FilamentGroupContext};
//!
//! let ctx = FilamentGroupContext::from_file("plate_1.json")?;
//! let outcome = FilamentGroup::new(ctx)?.calc_filament_group();
//! println!("extruders: {:?}", outcome.filament_map);
//! ```

use std::time::Duration;

mod context;
mod distance;
mod error;
mod group;
mod kmedoids;
mod matching;
mod memory;
mod selector;
mod utils;

pub use context::{
    FilamentGroupContext, FilamentInfo, FilamentUsageType, GroupInfo, GroupMode, GroupStrategy, MachineFilamentInfo,
    MachineInfo, ModelInfo, NozzleLayout, SpeedInfo, DEFAULT_CLUSTER_SIZE, DEFAULT_GAP_THRESHOLD,
};
pub use distance::{evaluate_score, FlushDistanceEvaluator, TimeEvaluator, DEFAULT_FLUSH_WEIGHT};
pub use error::{FilamentGroupError, FilamentGroupResult};
pub use group::{
    calc_filament_group_for_manual_multi_nozzle, calc_filament_group_for_match_multi_nozzle, FilamentGroup,
    FilamentGroupMultiNozzle, GroupOutcome,
};
pub use kmedoids::{KMedoids, KMedoids2};
pub use matching::calc_filament_group_for_match;
pub use memory::{MemoryedGroup, MemoryedGroups, ABSOLUTE_FLUSH_GAP_TOLERANCE};
pub use selector::{select_best_group_for_ams, DEFAULT_COLOR_THRESHOLD, FAIL_COST};
pub use utils::{
    build_filament_usage_types, build_machine_filaments, calc_max_group_size, check_printable,
    collect_sorted_used_filaments, collect_unprintable_everywhere, collect_unprintable_limits,
    extract_unprintable_limit_indices, extract_unprintable_limit_sets, normalize_filament_type, rebuild_unprintables,
    remove_intersection, update_used_filament_values, MachineSlotConfig, ObjectFilamentUsage, UnplaceableLimits,
    UnplaceableSets,
};

/// Used filament count from which flush grouping switches from enumeration
/// to clustering.
pub const ENUM_THRESHOLD: usize = 10;

/// Time budget of the two-way medoid search.
pub const PAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Time budget of the per-nozzle medoid search.
pub const MULTI_NOZZLE_PAM_TIMEOUT: Duration = Duration::from_millis(1500);

/// Seeded restarts of the per-nozzle medoid search.
pub const MULTI_NOZZLE_PAM_RETRIES: usize = 10;
