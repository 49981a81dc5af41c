//! Online-learned spatio-directional guiding cache for path tracing.
//!
//! The cache observes light-transport samples during rendering and learns,
//! per region of space, a directional distribution proportional to the
//! incident radiance. Renderers query it to bias bounce directions toward
//! light, optionally multiplied by a coarse BSDF proxy (product guiding),
//! with an online-learned mixing weight between the BSDF and the cache.
//!
//! Entry points:
//! - [`guiding::SpatTree`]: the spatial tree; `get_d_tree` / `record` during
//!   a pass, `build` between passes.
//! - [`guiding::PathGuidedSampler`]: per-shading-point mixture sampler.
//! - [`pass::PassController`]: doubles pass budgets, monitors variance,
//!   decides the final iteration and combines iterations.

pub mod atomic;
pub mod config;
pub mod error;
pub mod guiding;
pub mod math;
pub mod parallel;
pub mod pass;
pub mod sampling;

pub use config::GuidingConfig;
pub use error::{GuidingError, GuidingResult};
pub use guiding::{
    Bsdf, BsdfProxy, BsdfSample, DirTree, GuidedSample, GuidingMethod, GuidingRecord,
    PathGuidedSampler, ScatteringMode, ScatteringModes, SpatTree,
};
pub use pass::{AbortSwitch, Image, PassController, VarianceFilm};
