//! Low-resolution equal-area image of a directional tree, optionally
//! multiplied by a BSDF proxy to form a product-guiding distribution.
//!
//! The tree owns one `RadianceProxy`, rebuilt after every restructure; each
//! sampler holds a cheap `ProxyView` whose product map is local to the
//! shading point, so product builds never race across threads.

use std::sync::Arc;

use glam::{Vec2, Vec3};
use rand::RngCore;

use crate::math::{self, RCP_FOUR_PI};
use crate::sampling::{self, Distribution1D};

use super::bsdf_proxy::BsdfProxy;
use super::dtree::{child_index, DirTreeNode, CHILD_OFFSETS};

/// Side length of the proxy pixel map.
pub const PROXY_WIDTH: usize = 16;
const PROXY_PIXELS: usize = PROXY_WIDTH * PROXY_WIDTH;

/// Immutable pdf-only snapshot of a quadtree subtree that straddles one
/// proxy pixel. Published at proxy-build time so views never observe a tree
/// mid-restructure.
#[derive(Debug, Clone)]
pub struct ProxyStratum {
    pub(crate) previous: f32,
    pub(crate) children: Option<Box<[ProxyStratum; 4]>>,
}

impl ProxyStratum {
    /// Draws a point in the stratum's unit square with density proportional
    /// to the snapshotted sums; returns `(point, local_pdf)`.
    fn sample(&self, s: Vec2) -> (Vec2, f32) {
        if self.previous <= 0.0 {
            return (s, 1.0);
        }
        let mut s = s;
        let mut pdf = 1.0 / self.previous;
        let p = self.sample_recursive(&mut s, &mut pdf);
        (p.clamp(Vec2::ZERO, Vec2::splat(1.0 - f32::EPSILON)), pdf)
    }

    fn sample_recursive(&self, s: &mut Vec2, pdf: &mut f32) -> Vec2 {
        *s = s.min(Vec2::splat(1.0 - f32::EPSILON));

        let children = match &self.children {
            None => {
                *pdf *= self.previous;
                return *s;
            }
            Some(children) => children,
        };

        let left_half = children[0].previous + children[3].previous;
        *pdf *= 4.0;

        let mut factor = left_half / self.previous;
        if s.x < factor {
            s.x /= factor;
            factor = children[0].previous / left_half;
            if s.y < factor {
                s.y /= factor;
                CHILD_OFFSETS[0] + 0.5 * children[0].sample_recursive(s, pdf)
            } else {
                s.y = (s.y - factor) / (1.0 - factor);
                CHILD_OFFSETS[3] + 0.5 * children[3].sample_recursive(s, pdf)
            }
        } else {
            s.x = (s.x - factor) / (1.0 - factor);
            factor = children[1].previous
                / (children[1].previous + children[2].previous);
            if s.y < factor {
                s.y /= factor;
                CHILD_OFFSETS[1] + 0.5 * children[1].sample_recursive(s, pdf)
            } else {
                s.y = (s.y - factor) / (1.0 - factor);
                CHILD_OFFSETS[2] + 0.5 * children[2].sample_recursive(s, pdf)
            }
        }
    }

    /// Density of [`Self::sample`] at `p` in the stratum's unit square.
    fn pdf(&self, p: Vec2) -> f32 {
        if self.previous <= 0.0 {
            return 1.0;
        }
        let mut p = p;
        self.pdf_recursive(&mut p) / self.previous
    }

    fn pdf_recursive(&self, p: &mut Vec2) -> f32 {
        match &self.children {
            None => self.previous,
            Some(children) => 4.0 * children[child_index(p)].pdf_recursive(p),
        }
    }
}

/// Shared pixel map plus the per-pixel strata; one snapshot per restructure.
#[derive(Debug)]
struct ProxyMap {
    pixels: Vec<f32>,
    strata: Vec<Option<ProxyStratum>>,
}

impl ProxyMap {
    fn empty() -> Self {
        Self {
            pixels: vec![0.0; PROXY_PIXELS],
            strata: vec![None; PROXY_PIXELS],
        }
    }
}

/// The per-tree radiance image. Owned by a `DirTree`; samplers get views.
#[derive(Debug, Clone)]
pub struct RadianceProxy {
    map: Arc<ProxyMap>,
    is_built: bool,
}

impl RadianceProxy {
    pub(crate) fn new() -> Self {
        Self {
            map: Arc::new(ProxyMap::empty()),
            is_built: false,
        }
    }

    pub fn is_built(&self) -> bool {
        self.is_built
    }

    /// Drops the built flag; existing views keep their own snapshot.
    pub(crate) fn invalidate(&mut self) {
        self.is_built = false;
    }

    /// Rasterizes the quadtree into a fresh pixel map.
    /// `scale` is `1 / (4pi * previous_sample_weight)`.
    pub(crate) fn build(&mut self, root: &DirTreeNode, scale: f32) {
        let mut pixels = vec![0.0; PROXY_PIXELS];
        let mut strata: Vec<Option<ProxyStratum>> = vec![None; PROXY_PIXELS];
        let end_level = PROXY_WIDTH.trailing_zeros() as usize;

        root.build_radiance_proxy(
            &mut pixels,
            &mut strata,
            PROXY_WIDTH,
            scale,
            end_level,
            (0, 0),
            0,
        );

        for pixel in pixels.iter_mut() {
            if !pixel.is_finite() || *pixel < 0.0 {
                *pixel = 0.0;
            }
        }

        self.map = Arc::new(ProxyMap { pixels, strata });
        self.is_built = true;
    }

    /// Nearest-pixel radiance toward `direction`. Debugging accessor.
    pub fn proxy_radiance(&self, direction: Vec3) -> f32 {
        let p = math::dir_to_cylindrical(direction) * PROXY_WIDTH as f32;
        let x = (p.x as usize).min(PROXY_WIDTH - 1);
        let y = (p.y as usize).min(PROXY_WIDTH - 1);
        self.map.pixels[y * PROXY_WIDTH + x]
    }

    /// A cheap per-sampler view of the current snapshot.
    pub fn view(&self) -> ProxyView {
        ProxyView {
            map: Arc::clone(&self.map),
            is_built: self.is_built,
            product: None,
        }
    }
}

/// Product map and its pixel distribution, local to one sampler.
#[derive(Debug)]
struct ProductMap {
    distribution: Distribution1D,
}

/// Sampler-owned view of a radiance proxy. The product build mutates only
/// this view, so concurrent shading points never contend.
#[derive(Debug)]
pub struct ProxyView {
    map: Arc<ProxyMap>,
    is_built: bool,
    product: Option<ProductMap>,
}

impl ProxyView {
    pub fn is_built(&self) -> bool {
        self.is_built
    }

    pub fn product_is_built(&self) -> bool {
        self.product.is_some()
    }

    /// Multiplies the BSDF proxy into the radiance map and rebuilds the
    /// pixel distribution. Idempotent for the lifetime of this view; the
    /// next tree restructure hands out fresh views.
    pub fn build_product(
        &mut self,
        bsdf_proxy: &mut BsdfProxy,
        outgoing: Vec3,
        shading_normal: Vec3,
    ) {
        if self.product.is_some() {
            return;
        }

        bsdf_proxy.finish_parameterization(outgoing, shading_normal);

        let inv_width = 1.0 / PROXY_WIDTH as f32;
        let mut pixels = self.map.pixels.clone();
        for y in 0..PROXY_WIDTH {
            for x in 0..PROXY_WIDTH {
                let center = Vec2::new(
                    (x as f32 + 0.5) * inv_width,
                    (y as f32 + 0.5) * inv_width,
                );
                let incoming = math::cylindrical_to_dir(center);
                pixels[y * PROXY_WIDTH + x] *= bsdf_proxy.evaluate(incoming);
            }
        }

        self.product = Some(ProductMap {
            distribution: Distribution1D::new(&pixels),
        });
    }

    /// Draws a world direction from the product distribution; within the
    /// chosen pixel the sub-pixel offset follows the pixel's stratum.
    /// Returns `(direction, pdf)`.
    pub fn sample(&self, rng: &mut dyn RngCore) -> (Vec3, f32) {
        let distribution = match &self.product {
            Some(product) if product.distribution.integral() > 0.0 => &product.distribution,
            _ => {
                // Nothing to importance-sample; fall back to uniform.
                let s = sampling::next_vec2(rng);
                return (math::sample_sphere_uniform(s), RCP_FOUR_PI);
            }
        };

        let (index, pixel_prob) = distribution.sample_discrete(sampling::next_f32(rng));
        let pixel = Vec2::new(
            (index % PROXY_WIDTH) as f32,
            (index / PROXY_WIDTH) as f32,
        );

        let s = sampling::next_vec2(rng);
        let (offset, sub_pdf) = match &self.map.strata[index] {
            Some(stratum) => stratum.sample(s),
            None => (s, 1.0),
        };

        let uv = ((pixel + offset) / PROXY_WIDTH as f32)
            .clamp(Vec2::ZERO, Vec2::splat(0.99999));
        let pdf = pixel_prob * sub_pdf * PROXY_PIXELS as f32 * RCP_FOUR_PI;
        (math::cylindrical_to_dir(uv), pdf)
    }

    /// Density of [`Self::sample`] at `direction`.
    pub fn pdf(&self, direction: Vec3) -> f32 {
        let distribution = match &self.product {
            Some(product) if product.distribution.integral() > 0.0 => &product.distribution,
            _ => return RCP_FOUR_PI,
        };

        let p = math::dir_to_cylindrical(direction) * PROXY_WIDTH as f32;
        let x = (p.x as usize).min(PROXY_WIDTH - 1);
        let y = (p.y as usize).min(PROXY_WIDTH - 1);
        let index = y * PROXY_WIDTH + x;

        let mut pdf = distribution.discrete_pdf(index);
        if let Some(stratum) = &self.map.strata[index] {
            let sub = Vec2::new(p.x - x as f32, p.y - y as f32)
                .clamp(Vec2::ZERO, Vec2::splat(1.0 - f32::EPSILON));
            pdf *= stratum.pdf(sub);
        }
        pdf * PROXY_PIXELS as f32 * RCP_FOUR_PI
    }
}
