//! # Filament Group
//!
//! Filament to extruder / nozzle assignment for multi-material 3D printers.
//!
//! A multi-material print switches filaments on a shared nozzle many times per
//! layer, and every switch purges material. Printers with two extruders (and
//! some with several nozzles per extruder) can avoid most of that waste if
//! the right filaments share a nozzle. This crate computes that assignment.
//!
//! ## Modules
//!
//! - [`color`]: RGBA colors and CIEDE2000 color distance
//! - [`flow_network`]: max-flow / min-cost flow bipartite assignment
//! - [`tool_order`]: flush matrices and per-layer filament ordering
//! - [`nozzle`]: nozzle topology and change counting
//! - [`grouping`]: the grouping engine and its entry points
//!
//! ## Example
//!
//! ```rust,ignore
//! use filament_group::{Color, FilamentGroup, FilamentGroupContext, FilamentInfo, FlushMatrix};
//!
//! let flush = FlushMatrix::new(3, 300.0);
//! let info = vec![
//!     FilamentInfo::new(Color::rgb(255, 255, 255), "PLA"),
//!     FilamentInfo::new(Color::rgb(0, 0, 0), "PLA"),
//!     FilamentInfo::new(Color::rgb(255, 0, 0), "PLA"),
//! ];
//! let ctx = FilamentGroupContext::new(vec![flush.clone(), flush], vec![vec![0, 1, 2]], info);
//! let outcome = FilamentGroup::new(ctx)?.calc_filament_group();
//! ```

pub mod color;
pub mod flow_network;
pub mod grouping;
pub mod nozzle;
pub mod tool_order;

pub use color::{color_distance, Color, ColorParseError};
pub use grouping::{
    calc_filament_group_for_manual_multi_nozzle, calc_filament_group_for_match_multi_nozzle, FilamentGroup,
    FilamentGroupContext, FilamentGroupError, FilamentGroupMultiNozzle, FilamentGroupResult, FilamentInfo,
    GroupMode, GroupOutcome, GroupStrategy, MachineFilamentInfo,
};
pub use nozzle::{MultiNozzleGroupResult, NozzleInfo, NozzleVolumeType};
pub use tool_order::FlushMatrix;
