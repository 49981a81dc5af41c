//! Guiding configuration: filters, sampling-fraction policy, bounce and
//! guiding modes, and the pass/iteration budget.
//!
//! Loadable from JSON; out-of-range values are clamped with a warning rather
//! than rejected so a render job never dies on a sloppy config file.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GuidingError, GuidingResult};

/// How a record is distributed over the spatial tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialFilter {
    Nearest,
    Stochastic,
    Box,
}

/// How a record is distributed over a directional tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionalFilter {
    Nearest,
    Box,
}

/// Whether the BSDF-vs-guided mixing weight is learned online or fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingFractionMode {
    Fixed,
    Learn,
}

/// Scattering-mode relabeling applied to guided bounces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidedBounceMode {
    Learn,
    StrictlyDiffuse,
    StrictlyGlossy,
    PreferDiffuse,
    PreferGlossy,
}

/// Which learned distributions participate in the mixture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidingMode {
    PathGuiding,
    ProductGuiding,
    Combined,
}

/// How the controller decides the final iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationProgression {
    Automatic,
    Combine,
}

impl FromStr for GuidingMode {
    type Err = GuidingError;

    fn from_str(s: &str) -> GuidingResult<Self> {
        match s {
            "path_guiding" => Ok(GuidingMode::PathGuiding),
            "product_guiding" => Ok(GuidingMode::ProductGuiding),
            "combined" => Ok(GuidingMode::Combined),
            other => Err(GuidingError::config(format!(
                "unknown guiding mode \"{other}\""
            ))),
        }
    }
}

/// Full configuration of the guiding cache and its pass controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuidingConfig {
    #[serde(default = "GuidingConfig::default_spatial_filter")]
    pub spatial_filter: SpatialFilter,
    #[serde(default = "GuidingConfig::default_directional_filter")]
    pub directional_filter: DirectionalFilter,
    #[serde(default = "GuidingConfig::default_fraction_mode")]
    pub bsdf_sampling_fraction_mode: SamplingFractionMode,
    /// Used when the fraction mode is `fixed`. Clamped to `[0, 1]`.
    #[serde(default = "GuidingConfig::default_fixed_fraction")]
    pub fixed_bsdf_sampling_fraction: f32,
    /// ADAM learning rate when the fraction mode is `learn`.
    #[serde(default = "GuidingConfig::default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "GuidingConfig::default_bounce_mode")]
    pub guided_bounce_mode: GuidedBounceMode,
    #[serde(default = "GuidingConfig::default_guiding_mode")]
    pub guiding_mode: GuidingMode,
    #[serde(default = "GuidingConfig::default_progression")]
    pub iteration_progression: IterationProgression,
    #[serde(default = "GuidingConfig::default_samples_per_pass")]
    pub samples_per_pass: usize,
    #[serde(default = "GuidingConfig::default_sample_budget")]
    pub sample_budget: usize,
    #[serde(default = "GuidingConfig::default_max_passes")]
    pub max_passes: usize,
    /// Destination for visualizer dumps; dumping is disabled when unset.
    #[serde(default)]
    pub save_path: Option<PathBuf>,
}

impl GuidingConfig {
    fn default_spatial_filter() -> SpatialFilter {
        SpatialFilter::Stochastic
    }

    fn default_directional_filter() -> DirectionalFilter {
        DirectionalFilter::Box
    }

    fn default_fraction_mode() -> SamplingFractionMode {
        SamplingFractionMode::Learn
    }

    fn default_fixed_fraction() -> f32 {
        0.5
    }

    fn default_learning_rate() -> f32 {
        0.01
    }

    fn default_bounce_mode() -> GuidedBounceMode {
        GuidedBounceMode::Learn
    }

    fn default_guiding_mode() -> GuidingMode {
        GuidingMode::PathGuiding
    }

    fn default_progression() -> IterationProgression {
        IterationProgression::Automatic
    }

    fn default_samples_per_pass() -> usize {
        4
    }

    fn default_sample_budget() -> usize {
        256
    }

    fn default_max_passes() -> usize {
        64
    }

    /// Parses a JSON configuration and clamps it into a usable state.
    pub fn from_json(json: &str) -> GuidingResult<Self> {
        let mut config: GuidingConfig =
            serde_json::from_str(json).map_err(GuidingError::config)?;
        config.validate();
        Ok(config)
    }

    /// Clamps out-of-range values in place, warning about each adjustment.
    pub fn validate(&mut self) {
        if !(0.0..=1.0).contains(&self.fixed_bsdf_sampling_fraction) {
            let clamped = self.fixed_bsdf_sampling_fraction.clamp(0.0, 1.0);
            log::warn!(
                "fixed_bsdf_sampling_fraction {} out of [0, 1], clamping to {}",
                self.fixed_bsdf_sampling_fraction,
                clamped
            );
            self.fixed_bsdf_sampling_fraction = clamped;
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            log::warn!(
                "learning_rate {} must be positive, falling back to {}",
                self.learning_rate,
                Self::default_learning_rate()
            );
            self.learning_rate = Self::default_learning_rate();
        }
        if self.samples_per_pass == 0 {
            log::warn!("samples_per_pass must be >= 1, clamping to 1");
            self.samples_per_pass = 1;
        }
        if self.sample_budget == 0 {
            log::warn!("sample_budget must be >= 1, clamping to 1");
            self.sample_budget = 1;
        }
        if self.max_passes == 0 {
            log::warn!("max_passes must be >= 1, clamping to 1");
            self.max_passes = 1;
        }
    }
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            spatial_filter: Self::default_spatial_filter(),
            directional_filter: Self::default_directional_filter(),
            bsdf_sampling_fraction_mode: Self::default_fraction_mode(),
            fixed_bsdf_sampling_fraction: Self::default_fixed_fraction(),
            learning_rate: Self::default_learning_rate(),
            guided_bounce_mode: Self::default_bounce_mode(),
            guiding_mode: Self::default_guiding_mode(),
            iteration_progression: Self::default_progression(),
            samples_per_pass: Self::default_samples_per_pass(),
            sample_budget: Self::default_sample_budget(),
            max_passes: Self::default_max_passes(),
            save_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = GuidingConfig::from_json(
            r#"{
                "guiding_mode": "combined",
                "spatial_filter": "box",
                "samples_per_pass": 16
            }"#,
        )
        .unwrap();
        assert_eq!(config.guiding_mode, GuidingMode::Combined);
        assert_eq!(config.spatial_filter, SpatialFilter::Box);
        assert_eq!(config.samples_per_pass, 16);
        assert_eq!(config.directional_filter, DirectionalFilter::Box);
        assert_eq!(
            config.bsdf_sampling_fraction_mode,
            SamplingFractionMode::Learn
        );
        assert!(config.save_path.is_none());
    }

    #[test]
    fn rejects_unknown_enum_values() {
        assert!(GuidingConfig::from_json(r#"{"guiding_mode": "psychic"}"#).is_err());
        assert!("combined".parse::<GuidingMode>().is_ok());
        assert!("telepathy".parse::<GuidingMode>().is_err());
    }

    #[test]
    fn validation_clamps_bad_values() {
        let mut config = GuidingConfig {
            fixed_bsdf_sampling_fraction: 1.5,
            learning_rate: -3.0,
            samples_per_pass: 0,
            ..GuidingConfig::default()
        };
        config.validate();
        assert_eq!(config.fixed_bsdf_sampling_fraction, 1.0);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.samples_per_pass, 1);
    }

    #[test]
    fn round_trips_through_json() {
        let config = GuidingConfig {
            guiding_mode: GuidingMode::ProductGuiding,
            save_path: Some(PathBuf::from("/tmp/tree.sdt")),
            ..GuidingConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back = GuidingConfig::from_json(&json).unwrap();
        assert_eq!(back.guiding_mode, GuidingMode::ProductGuiding);
        assert_eq!(back.save_path, config.save_path);
    }
}
