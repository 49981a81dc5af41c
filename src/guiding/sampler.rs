//! Mixture sampler used at every guided shading point.
//!
//! Combines up to three proposals (BSDF sample, directional-tree sample,
//! product-proxy sample) into one importance-sampled incoming direction and
//! reports the mixture density, which is also what `evaluate` returns for
//! MIS weighting.

use std::sync::Once;

use glam::Vec3;
use rand::RngCore;

use crate::config::{GuidedBounceMode, GuidingMode};
use crate::sampling;

use super::bsdf_proxy::BsdfProxy;
use super::dtree::DirTree;
use super::proxy::ProxyView;
use super::{GuidingMethod, ScatteringMode, ScatteringModes};

/// One BSDF sampling result, value already weighted by `|cos|`.
#[derive(Debug, Clone, Copy)]
pub struct BsdfSample {
    pub incoming: Vec3,
    pub value: Vec3,
    pub pdf: f32,
    pub scattering_mode: ScatteringMode,
}

/// Surface reflectance seam the sampler drives. Implemented by the host
/// renderer's materials.
pub trait Bsdf {
    /// Draws an incoming direction from the BSDF alone.
    fn sample(&self, rng: &mut dyn RngCore, outgoing: Vec3, modes: ScatteringModes) -> BsdfSample;

    /// Returns `(value, pdf)` of the BSDF toward `incoming`; `pdf` is zero
    /// for directions the BSDF cannot produce.
    fn evaluate(&self, outgoing: Vec3, incoming: Vec3, modes: ScatteringModes) -> (Vec3, f32);

    /// Only delta lobes; guiding is inert on such surfaces.
    fn is_purely_specular(&self) -> bool;

    /// Describes the BSDF to a product-guiding proxy. Returning `false`
    /// (the default) disables product guiding at this shading point.
    fn add_parameters_to_proxy(&self, _proxy: &mut BsdfProxy) -> bool {
        false
    }
}

/// Guided sampling result: the chosen direction with its mixture pdf plus
/// the component pdfs the record and the optimizer need.
#[derive(Debug, Clone, Copy)]
pub struct GuidedSample {
    pub incoming: Vec3,
    pub value: Vec3,
    /// Mixture pdf the direction was drawn with.
    pub wi_pdf: f32,
    pub bsdf_pdf: f32,
    pub d_tree_pdf: f32,
    pub product_pdf: f32,
    pub scattering_mode: ScatteringMode,
    pub guiding_method: GuidingMethod,
}

static COMBINED_DOWNGRADE_NOTICE: Once = Once::new();

/// Per-shading-point mixture sampler over BSDF, directional tree and
/// product proxy.
pub struct PathGuidedSampler<'a> {
    d_tree: &'a DirTree,
    bsdf: &'a dyn Bsdf,
    bsdf_sampling_modes: ScatteringModes,
    shading_normal: Vec3,
    guided_bounce_mode: GuidedBounceMode,
    enable_path_guiding: bool,
    enable_product_guiding: bool,
    guiding_method: GuidingMethod,
    bsdf_sampling_fraction: f32,
    product_sampling_fraction: f32,
    proxy: ProxyView,
    bsdf_proxy: BsdfProxy,
}

impl<'a> PathGuidedSampler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guiding_mode: GuidingMode,
        allow_path_guiding: bool,
        guided_bounce_mode: GuidedBounceMode,
        d_tree: &'a DirTree,
        bsdf: &'a dyn Bsdf,
        bsdf_sampling_modes: ScatteringModes,
        shading_normal: Vec3,
        sd_tree_is_built: bool,
    ) -> Self {
        let enable_path_guiding =
            sd_tree_is_built && !bsdf.is_purely_specular() && allow_path_guiding;

        let proxy = d_tree.radiance_proxy().view();
        let mut bsdf_proxy = BsdfProxy::new();

        let wants_product = matches!(
            guiding_mode,
            GuidingMode::ProductGuiding | GuidingMode::Combined
        );
        let enable_product_guiding =
            wants_product && proxy.is_built() && bsdf.add_parameters_to_proxy(&mut bsdf_proxy);

        if guiding_mode == GuidingMode::Combined && enable_path_guiding && !enable_product_guiding {
            COMBINED_DOWNGRADE_NOTICE.call_once(|| {
                log::warn!(
                    "combined guiding could not initialize its product distribution; \
                     falling back to path guiding"
                );
            });
        }

        let (bsdf_sampling_fraction, product_sampling_fraction) = if !enable_path_guiding {
            (1.0, 0.0)
        } else if guiding_mode == GuidingMode::Combined && enable_product_guiding {
            let fractions = d_tree.bsdf_sampling_fraction_product();
            (fractions.x, fractions.y)
        } else if guiding_mode == GuidingMode::ProductGuiding && enable_product_guiding {
            (d_tree.bsdf_sampling_fraction(), 1.0)
        } else {
            (d_tree.bsdf_sampling_fraction(), 0.0)
        };

        debug_assert!((0.0..=1.0).contains(&bsdf_sampling_fraction));
        debug_assert!((0.0..=1.0).contains(&product_sampling_fraction));

        // Only the combined three-way mixture feeds the product optimizer;
        // everything else learns the two-way mix.
        let guiding_method = if guiding_mode == GuidingMode::Combined && enable_product_guiding {
            GuidingMethod::ProductGuiding
        } else {
            GuidingMethod::PathGuiding
        };

        Self {
            d_tree,
            bsdf,
            bsdf_sampling_modes,
            shading_normal,
            guided_bounce_mode,
            enable_path_guiding,
            enable_product_guiding,
            guiding_method,
            bsdf_sampling_fraction,
            product_sampling_fraction,
            proxy,
            bsdf_proxy,
        }
    }

    /// The mixture this sampler's records should train.
    pub fn guiding_method(&self) -> GuidingMethod {
        self.guiding_method
    }

    pub fn path_guiding_enabled(&self) -> bool {
        self.enable_path_guiding
    }

    pub fn product_guiding_enabled(&self) -> bool {
        self.enable_product_guiding
    }

    /// Draws one incoming direction from the mixture. Returns `None` when
    /// the proposal was rejected (BSDF cannot scatter that way).
    pub fn sample(&mut self, rng: &mut dyn RngCore, outgoing: Vec3) -> Option<GuidedSample> {
        if !self.enable_path_guiding {
            return self.simple_bsdf_bounce(rng, outgoing);
        }

        let s = sampling::next_f32(rng);
        if s < self.bsdf_sampling_fraction {
            self.guiding_aware_bsdf_bounce(rng, outgoing)
        } else {
            let s = (s - self.bsdf_sampling_fraction) / (1.0 - self.bsdf_sampling_fraction);
            self.guided_bounce(rng, outgoing, s)
        }
    }

    /// Mixture density toward a direction obtained elsewhere (light
    /// sampling); consistent with [`Self::sample`] for MIS.
    pub fn evaluate(
        &mut self,
        outgoing: Vec3,
        incoming: Vec3,
        light_sampling_modes: ScatteringModes,
    ) -> (Vec3, f32) {
        let (value, bsdf_pdf) = self.bsdf.evaluate(outgoing, incoming, light_sampling_modes);
        if !self.enable_path_guiding {
            return (value, bsdf_pdf);
        }

        let d_tree_pdf = self.d_tree.pdf(incoming, self.modes_before_sampling());
        let product_pdf = if self.enable_product_guiding {
            self.build_product(outgoing);
            self.proxy.pdf(incoming)
        } else {
            0.0
        };

        (value, self.extension_pdf(bsdf_pdf, d_tree_pdf, product_pdf))
    }

    fn simple_bsdf_bounce(
        &mut self,
        rng: &mut dyn RngCore,
        outgoing: Vec3,
    ) -> Option<GuidedSample> {
        let bsdf_sample = self.bsdf.sample(rng, outgoing, self.bsdf_sampling_modes);
        if bsdf_sample.scattering_mode == ScatteringMode::None {
            return None;
        }
        Some(GuidedSample {
            incoming: bsdf_sample.incoming,
            value: bsdf_sample.value,
            wi_pdf: bsdf_sample.pdf,
            bsdf_pdf: bsdf_sample.pdf,
            d_tree_pdf: 0.0,
            product_pdf: 0.0,
            scattering_mode: bsdf_sample.scattering_mode,
            guiding_method: self.guiding_method,
        })
    }

    fn guiding_aware_bsdf_bounce(
        &mut self,
        rng: &mut dyn RngCore,
        outgoing: Vec3,
    ) -> Option<GuidedSample> {
        let bsdf_sample = self.bsdf.sample(rng, outgoing, self.bsdf_sampling_modes);
        if bsdf_sample.scattering_mode == ScatteringMode::None {
            return None;
        }

        if bsdf_sample.scattering_mode == ScatteringMode::Specular {
            // A delta event: the mixture collapses to the discrete
            // probability of having chosen the BSDF strategy.
            return Some(GuidedSample {
                incoming: bsdf_sample.incoming,
                value: bsdf_sample.value,
                wi_pdf: self.bsdf_sampling_fraction,
                bsdf_pdf: bsdf_sample.pdf,
                d_tree_pdf: 0.0,
                product_pdf: 0.0,
                scattering_mode: bsdf_sample.scattering_mode,
                guiding_method: self.guiding_method,
            });
        }

        let product_pdf = if self.enable_product_guiding {
            self.build_product(outgoing);
            self.proxy.pdf(bsdf_sample.incoming)
        } else {
            0.0
        };
        let d_tree_pdf = self
            .d_tree
            .pdf(bsdf_sample.incoming, self.modes_before_sampling());

        Some(GuidedSample {
            incoming: bsdf_sample.incoming,
            value: bsdf_sample.value,
            wi_pdf: self.extension_pdf(bsdf_sample.pdf, d_tree_pdf, product_pdf),
            bsdf_pdf: bsdf_sample.pdf,
            d_tree_pdf,
            product_pdf,
            scattering_mode: bsdf_sample.scattering_mode,
            guiding_method: self.guiding_method,
        })
    }

    fn guided_bounce(
        &mut self,
        rng: &mut dyn RngCore,
        outgoing: Vec3,
        s: f32,
    ) -> Option<GuidedSample> {
        if self.enable_product_guiding {
            self.build_product(outgoing);
        }

        let (incoming, d_tree_pdf, product_pdf, sampled_mode) =
            if s <= self.product_sampling_fraction {
                let (incoming, product_pdf) = self.proxy.sample(rng);
                let d_tree_pdf = self.d_tree.pdf(incoming, self.modes_before_sampling());
                (incoming, d_tree_pdf, product_pdf, ScatteringMode::Diffuse)
            } else {
                let tree_sample = self.d_tree.sample(rng, self.modes_before_sampling());
                if tree_sample.scattering_mode == ScatteringMode::None {
                    return None;
                }
                let product_pdf = if self.enable_product_guiding {
                    self.proxy.pdf(tree_sample.direction)
                } else {
                    0.0
                };
                (
                    tree_sample.direction,
                    tree_sample.pdf,
                    product_pdf,
                    tree_sample.scattering_mode,
                )
            };

        let scattering_mode = self.mode_after_sampling(sampled_mode);
        if scattering_mode == ScatteringMode::None {
            return None;
        }

        let (value, bsdf_pdf) = self
            .bsdf
            .evaluate(outgoing, incoming, self.bsdf_sampling_modes);
        if bsdf_pdf == 0.0 {
            // The BSDF vetoes the guided direction.
            return None;
        }

        Some(GuidedSample {
            incoming,
            value,
            wi_pdf: self.extension_pdf(bsdf_pdf, d_tree_pdf, product_pdf),
            bsdf_pdf,
            d_tree_pdf,
            product_pdf,
            scattering_mode,
            guiding_method: self.guiding_method,
        })
    }

    /// `alpha * bsdf + (1 - alpha) * (beta * product + (1 - beta) * tree)`.
    fn extension_pdf(&self, bsdf_pdf: f32, d_tree_pdf: f32, product_pdf: f32) -> f32 {
        if !self.enable_path_guiding {
            return bsdf_pdf;
        }
        let guided_pdf = d_tree_pdf
            + (product_pdf - d_tree_pdf) * self.product_sampling_fraction;
        guided_pdf + (bsdf_pdf - guided_pdf) * self.bsdf_sampling_fraction
    }

    fn build_product(&mut self, outgoing: Vec3) {
        self.proxy
            .build_product(&mut self.bsdf_proxy, outgoing, self.shading_normal);
    }

    /// In learn mode the tree's own classification filters sampling;
    /// otherwise guided bounces may produce any non-specular mode.
    fn modes_before_sampling(&self) -> ScatteringModes {
        match self.guided_bounce_mode {
            GuidedBounceMode::Learn => self.bsdf_sampling_modes,
            _ => ScatteringModes::DIFFUSE | ScatteringModes::GLOSSY,
        }
    }

    fn mode_after_sampling(&self, sampled_mode: ScatteringMode) -> ScatteringMode {
        let has_diffuse = self.bsdf_sampling_modes.has_diffuse();
        let has_glossy = self.bsdf_sampling_modes.has_glossy();

        match self.guided_bounce_mode {
            GuidedBounceMode::Learn => sampled_mode,
            GuidedBounceMode::StrictlyDiffuse => {
                if has_diffuse {
                    ScatteringMode::Diffuse
                } else {
                    ScatteringMode::None
                }
            }
            GuidedBounceMode::StrictlyGlossy => {
                if has_glossy {
                    ScatteringMode::Glossy
                } else {
                    ScatteringMode::None
                }
            }
            GuidedBounceMode::PreferDiffuse => {
                if has_diffuse {
                    ScatteringMode::Diffuse
                } else if has_glossy {
                    ScatteringMode::Glossy
                } else {
                    ScatteringMode::None
                }
            }
            GuidedBounceMode::PreferGlossy => {
                if has_glossy {
                    ScatteringMode::Glossy
                } else if has_diffuse {
                    ScatteringMode::Diffuse
                } else {
                    ScatteringMode::None
                }
            }
        }
    }
}
