//! The optimization input aggregate.
//!
//! A [`FilamentGroupContext`] is assembled by the caller, is read-only for
//! the duration of one grouping call and can be loaded from or saved to JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use super::error::{FilamentGroupError, FilamentGroupResult};
use crate::color::Color;
use crate::nozzle::{build_extruder_nozzle_list, NozzleInfo, NozzleVolumeType};
use crate::tool_order::FlushMatrix;

/// Default per-extruder filament capacity.
pub const DEFAULT_CLUSTER_SIZE: usize = 16;

/// Default relative gap for retaining near-optimal candidates.
pub const DEFAULT_GAP_THRESHOLD: f64 = 0.01;

// ============================================================================
// Filament Descriptions
// ============================================================================

/// Which part of the model a filament prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilamentUsageType {
    SupportOnly,
    #[default]
    ModelOnly,
    Hybrid,
}

/// A filament used by the print.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilamentInfo {
    pub color: Color,
    /// Material type, e.g. `PLA`.
    #[serde(rename = "type")]
    pub filament_type: String,
    #[serde(default)]
    pub is_support: bool,
    #[serde(default)]
    pub usage_type: FilamentUsageType,
}

impl FilamentInfo {
    pub fn new(color: Color, filament_type: impl Into<String>) -> Self {
        Self {
            color,
            filament_type: filament_type.into(),
            is_support: false,
            usage_type: FilamentUsageType::ModelOnly,
        }
    }

    pub fn support(mut self, usage_type: FilamentUsageType) -> Self {
        self.is_support = true;
        self.usage_type = usage_type;
        self
    }
}

/// A material physically loaded in the printer (AMS slot or external spool).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineFilamentInfo {
    pub color: Color,
    #[serde(rename = "type")]
    pub filament_type: String,
    #[serde(default)]
    pub is_support: bool,
    pub extruder_id: usize,
    /// Loaded on the external spool holder rather than in the AMS.
    #[serde(default)]
    pub is_extended: bool,
}

impl MachineFilamentInfo {
    pub fn new(color: Color, filament_type: impl Into<String>, extruder_id: usize) -> Self {
        Self {
            color,
            filament_type: filament_type.into(),
            is_support: false,
            extruder_id,
            is_extended: false,
        }
    }

    /// Slots sharing a signature hold interchangeable material.
    pub fn signature(&self) -> (Color, &str, bool) {
        (self.color, self.filament_type.as_str(), self.is_support)
    }
}

// ============================================================================
// Modes
// ============================================================================

/// What the grouping optimizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Minimize purge volume (and optionally time).
    #[default]
    Flush,
    /// Follow the materials loaded in the printer.
    Match,
}

/// How capacity limits are treated when they cannot all be met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    #[default]
    BestCost,
    /// Fill extruders up to their capacity even at some extra flush.
    BestFit,
}

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    /// One matrix per extruder, indexed `[from][to]` by filament.
    pub flush_matrix: Vec<FlushMatrix>,
    /// Filament indices printed on each layer.
    pub layer_filaments: Vec<Vec<usize>>,
    pub filament_info: Vec<FilamentInfo>,
    /// Preset ids; identical id and color marks duplicated filaments.
    #[serde(default)]
    pub filament_ids: Vec<String>,
    /// Per extruder, filaments it cannot print.
    #[serde(default)]
    pub unprintable_filaments: Vec<BTreeSet<usize>>,
    /// Per filament, nozzle volume types it cannot be printed with.
    #[serde(default)]
    pub unprintable_volumes: BTreeMap<usize, BTreeSet<NozzleVolumeType>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub total_filament_num: usize,
    #[serde(default = "default_gap_threshold")]
    pub max_gap_threshold: f64,
    #[serde(default)]
    pub mode: GroupMode,
    #[serde(default)]
    pub strategy: GroupStrategy,
    #[serde(default)]
    pub ignore_ext_filament: bool,
    /// Expected nozzle volume type per filament (multi-nozzle mode).
    #[serde(default)]
    pub filament_volume_map: Vec<NozzleVolumeType>,
}

fn default_gap_threshold() -> f64 {
    DEFAULT_GAP_THRESHOLD
}

impl Default for GroupInfo {
    fn default() -> Self {
        Self {
            total_filament_num: 0,
            max_gap_threshold: DEFAULT_GAP_THRESHOLD,
            mode: GroupMode::Flush,
            strategy: GroupStrategy::BestCost,
            ignore_ext_filament: false,
            filament_volume_map: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Filament capacity per extruder. `usize::MAX` means unbounded.
    pub max_group_size: Vec<usize>,
    /// Loaded materials per extruder.
    #[serde(default)]
    pub machine_filament_info: Vec<Vec<MachineFilamentInfo>>,
    #[serde(default)]
    pub prefer_non_model_filament: Vec<bool>,
    #[serde(default)]
    pub master_extruder_id: usize,
}

impl MachineInfo {
    pub fn prefers_non_model(&self, extruder: usize) -> bool {
        self.prefer_non_model_filament.get(extruder).copied().unwrap_or(false)
    }

    pub fn group_size(&self, extruder: usize) -> usize {
        self.max_group_size.get(extruder).copied().unwrap_or(DEFAULT_CLUSTER_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedInfo {
    /// filament -> extruder -> estimated print time (s).
    #[serde(default)]
    pub filament_print_time: BTreeMap<usize, BTreeMap<usize, f64>>,
    #[serde(default)]
    pub extruder_change_time: f64,
    #[serde(default)]
    pub filament_change_time: f64,
    /// Include print time in the enumeration score.
    #[serde(default)]
    pub group_with_time: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NozzleLayout {
    /// extruder -> sorted nozzle ids. Derived from `nozzle_list` when empty.
    #[serde(default)]
    pub extruder_nozzle_list: BTreeMap<usize, Vec<usize>>,
    #[serde(default)]
    pub nozzle_list: Vec<NozzleInfo>,
}

/// Everything the optimizer needs to know about one print.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilamentGroupContext {
    pub model_info: ModelInfo,
    pub group_info: GroupInfo,
    pub machine_info: MachineInfo,
    #[serde(default)]
    pub speed_info: SpeedInfo,
    #[serde(default)]
    pub nozzle_info: NozzleLayout,
}

impl FilamentGroupContext {
    /// Context for a plain printer with one nozzle per extruder.
    ///
    /// The extruder count is taken from `flush_matrix`. Filament ids default
    /// to the filament index, capacities to [`DEFAULT_CLUSTER_SIZE`].
    pub fn new(
        flush_matrix: Vec<FlushMatrix>,
        layer_filaments: Vec<Vec<usize>>,
        filament_info: Vec<FilamentInfo>,
    ) -> Self {
        let extruders = flush_matrix.len();
        let total = filament_info.len();
        let nozzle_list: Vec<NozzleInfo> = (0..extruders)
            .map(|e| NozzleInfo::new(0.4, NozzleVolumeType::Standard, e, e))
            .collect();

        Self {
            model_info: ModelInfo {
                flush_matrix,
                layer_filaments,
                filament_info,
                filament_ids: (0..total).map(|i| i.to_string()).collect(),
                unprintable_filaments: vec![BTreeSet::new(); extruders],
                unprintable_volumes: BTreeMap::new(),
            },
            group_info: GroupInfo {
                total_filament_num: total,
                ..Default::default()
            },
            machine_info: MachineInfo {
                max_group_size: vec![DEFAULT_CLUSTER_SIZE; extruders],
                machine_filament_info: vec![Vec::new(); extruders],
                prefer_non_model_filament: vec![false; extruders],
                master_extruder_id: 0,
            },
            speed_info: SpeedInfo::default(),
            nozzle_info: NozzleLayout {
                extruder_nozzle_list: build_extruder_nozzle_list(&nozzle_list),
                nozzle_list,
            },
        }
    }

    /// Replace the nozzle list and rebuild the extruder -> nozzle map.
    pub fn with_nozzles(mut self, nozzles: Vec<NozzleInfo>) -> Self {
        self.nozzle_info.extruder_nozzle_list = build_extruder_nozzle_list(&nozzles);
        self.nozzle_info.nozzle_list = nozzles;
        self
    }

    /// Parse a context from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FilamentGroupResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a context from a JSON string.
    pub fn from_json(json: &str) -> FilamentGroupResult<Self> {
        let mut ctx: Self = serde_json::from_str(json)?;
        if ctx.nozzle_info.extruder_nozzle_list.is_empty() {
            ctx.nozzle_info.extruder_nozzle_list = build_extruder_nozzle_list(&ctx.nozzle_info.nozzle_list);
        }
        ctx.validate()?;
        Ok(ctx)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> FilamentGroupResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> FilamentGroupResult<()> {
        let content = self.to_json()?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn extruder_count(&self) -> usize {
        self.model_info.flush_matrix.len()
    }

    /// Whether some extruder carries more than one nozzle.
    pub fn is_multi_nozzle(&self) -> bool {
        self.nozzle_info.extruder_nozzle_list.values().any(|nozzles| nozzles.len() > 1)
    }

    /// Check dimensional consistency.
    pub fn validate(&self) -> FilamentGroupResult<()> {
        let invalid = |msg: String| Err(FilamentGroupError::InvalidContext(msg));
        let total = self.group_info.total_filament_num;
        let extruders = self.extruder_count();

        if extruders == 0 {
            return invalid("at least one flush matrix is required".to_string());
        }
        for (e, matrix) in self.model_info.flush_matrix.iter().enumerate() {
            if !matrix.is_square() || matrix.size() < total {
                return invalid(format!(
                    "flush matrix of extruder {} must be square and cover {} filaments",
                    e, total
                ));
            }
        }
        if self.model_info.filament_info.len() != total {
            return invalid(format!(
                "expected {} filament infos, got {}",
                total,
                self.model_info.filament_info.len()
            ));
        }
        if !self.model_info.filament_ids.is_empty() && self.model_info.filament_ids.len() != total {
            return invalid(format!(
                "expected {} filament ids, got {}",
                total,
                self.model_info.filament_ids.len()
            ));
        }
        if let Some(f) = self.model_info.layer_filaments.iter().flatten().find(|&&f| f >= total) {
            return invalid(format!("layer references unknown filament {}", f));
        }
        if self.model_info.unprintable_filaments.len() > extruders {
            return invalid("more unprintable sets than extruders".to_string());
        }
        if let Some(f) = self
            .model_info
            .unprintable_filaments
            .iter()
            .flatten()
            .find(|&&f| f >= total)
        {
            return invalid(format!("unprintable set references unknown filament {}", f));
        }
        if self.machine_info.max_group_size.len() < extruders {
            return invalid(format!("expected {} group sizes", extruders));
        }
        if self.machine_info.master_extruder_id >= extruders {
            return invalid(format!(
                "master extruder {} out of range",
                self.machine_info.master_extruder_id
            ));
        }
        if !(self.group_info.max_gap_threshold >= 0.0) {
            return invalid("gap threshold must be non-negative".to_string());
        }
        if !self.group_info.filament_volume_map.is_empty() && self.group_info.filament_volume_map.len() != total {
            return invalid("filament volume map must cover every filament".to_string());
        }

        let nozzles = &self.nozzle_info.nozzle_list;
        for (idx, nozzle) in nozzles.iter().enumerate() {
            if nozzle.group_id != idx {
                return invalid(format!("nozzle {} carries id {}", idx, nozzle.group_id));
            }
            if nozzle.extruder_id >= extruders {
                return invalid(format!("nozzle {} references unknown extruder {}", idx, nozzle.extruder_id));
            }
        }
        for (extruder, ids) in &self.nozzle_info.extruder_nozzle_list {
            for &id in ids {
                if nozzles.get(id).map(|n| n.extruder_id) != Some(*extruder) {
                    return invalid(format!("nozzle {} is not on extruder {}", id, extruder));
                }
            }
        }
        Ok(())
    }
}
