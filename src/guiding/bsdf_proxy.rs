//! Coarse analytic stand-in for the local surface reflectance.
//!
//! A BSDF contributes up to four additive lobes (diffuse, translucency,
//! reflection, refraction); the radiance proxy multiplies the parameterized
//! proxy into its pixel map to form the product-guiding distribution.

use glam::Vec3;

use crate::math;

const MIN_ROUGHNESS: f32 = 0.05;

/// Additive four-lobe reflectance proxy. Weights accumulate first, then
/// `finish_parameterization` fixes the lobe directions for one shading
/// point, after which `evaluate` is valid.
#[derive(Debug, Clone)]
pub struct BsdfProxy {
    diffuse_weight: f32,
    translucency_weight: f32,
    reflection_weight: f32,
    refraction_weight: f32,
    reflection_roughness: f32,
    refraction_roughness: f32,
    ior: f32,

    is_diffuse: bool,
    is_translucent: bool,
    is_reflective: bool,
    is_refractive: bool,

    normal: Vec3,
    reflection_lobe: Vec3,
    refraction_lobe: Vec3,
}

impl BsdfProxy {
    pub fn new() -> Self {
        Self {
            diffuse_weight: 0.0,
            translucency_weight: 0.0,
            reflection_weight: 0.0,
            refraction_weight: 0.0,
            reflection_roughness: 0.0,
            refraction_roughness: 0.0,
            ior: 1.5,
            is_diffuse: false,
            is_translucent: false,
            is_reflective: false,
            is_refractive: false,
            normal: Vec3::Z,
            reflection_lobe: Vec3::Z,
            refraction_lobe: -Vec3::Z,
        }
    }

    pub fn add_diffuse_weight(&mut self, weight: f32) {
        self.diffuse_weight += weight;
    }

    pub fn add_translucency_weight(&mut self, weight: f32) {
        self.translucency_weight += weight;
    }

    /// Accumulates a reflective lobe; the stored roughness is the
    /// weight-averaged roughness of all contributions.
    pub fn add_reflection_weight(&mut self, weight: f32, roughness: f32) {
        let old_weight = self.reflection_weight;
        self.reflection_weight += weight;
        let inv_weight = if self.reflection_weight > 0.0 {
            1.0 / self.reflection_weight
        } else {
            0.0
        };
        self.reflection_roughness =
            old_weight * inv_weight * self.reflection_roughness + weight * inv_weight * roughness;
    }

    pub fn add_refraction_weight(&mut self, weight: f32, roughness: f32) {
        let old_weight = self.refraction_weight;
        self.refraction_weight += weight;
        let inv_weight = if self.refraction_weight > 0.0 {
            1.0 / self.refraction_weight
        } else {
            0.0
        };
        self.refraction_roughness =
            old_weight * inv_weight * self.refraction_roughness + weight * inv_weight * roughness;
    }

    pub fn set_ior(&mut self, ior: f32) {
        self.ior = ior;
    }

    /// No lobe received any weight.
    pub fn is_zero(&self) -> bool {
        !(self.is_diffuse || self.is_translucent || self.is_reflective || self.is_refractive)
    }

    /// Fixes the lobes for one shading point: reflection and refraction
    /// directions in world space, reflection roughness doubled, refraction
    /// roughness scaled by `(cos_t + ior * cos_o) / cos_t` to account for
    /// the solid-angle change under refraction.
    pub fn finish_parameterization(&mut self, outgoing: Vec3, shading_normal: Vec3) {
        self.is_diffuse = self.diffuse_weight > 0.0;
        self.is_translucent = self.translucency_weight > 0.0;
        self.is_reflective = self.reflection_weight > 0.0;
        self.is_refractive = self.refraction_weight > 0.0;

        if self.is_zero() {
            return;
        }

        self.normal = shading_normal;
        self.reflection_lobe = math::reflect(outgoing, self.normal);
        match math::refract(outgoing, self.normal, self.ior) {
            Some(refracted) => self.refraction_lobe = refracted,
            None => self.is_refractive = false,
        }

        self.reflection_roughness *= 2.0;
        if self.is_refractive {
            let cos_nt = self.normal.dot(self.refraction_lobe).abs().max(1e-4);
            let cos_no = self.normal.dot(outgoing).abs();
            self.refraction_roughness *= (cos_nt + self.ior * cos_no) / cos_nt;
        }
    }

    /// Proxy reflectance toward `incoming`. Valid after
    /// `finish_parameterization`; always non-negative.
    pub fn evaluate(&self, incoming: Vec3) -> f32 {
        let cos_ni = self.normal.dot(incoming);

        let mut value = 0.0;
        if self.is_diffuse {
            value += self.diffuse_weight * cos_ni.max(0.0);
        }
        if self.is_translucent {
            value += self.translucency_weight * (-cos_ni).max(0.0);
        }
        if self.is_reflective {
            value += self.reflection_weight
                * phong_lobe(self.reflection_lobe, incoming, self.reflection_roughness);
        }
        if self.is_refractive {
            value += self.refraction_weight
                * phong_lobe(self.refraction_lobe, incoming, self.refraction_roughness);
        }
        value
    }
}

impl Default for BsdfProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized Phong lobe around `axis` with exponent derived from the
/// roughness (rough surfaces get broad, low lobes).
fn phong_lobe(axis: Vec3, incoming: Vec3, roughness: f32) -> f32 {
    let r = roughness.max(MIN_ROUGHNESS);
    let exponent = 2.0 / (r * r);
    let cos_lobe = axis.dot(incoming).max(0.0);
    (exponent + 2.0) / std::f32::consts::TAU * cos_lobe.powf(exponent)
}
