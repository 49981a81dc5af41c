//! Per-path vertex buffering.
//!
//! The path tracer fills one `VertexPath` per camera path, back-propagates
//! radiance into the stored vertices as it arrives, and bulk-inserts the
//! whole path into the SD-tree when the path terminates.

use glam::Vec3;
use rand::RngCore;

use crate::math;

use super::dtree::DirTree;
use super::stree::SpatTree;
use super::{GuidingMethod, GuidingRecord};

/// Longest path the buffer retains; deeper bounces are dropped.
pub const MAX_PATH_LENGTH: usize = 32;

/// One recorded bounce, accumulated until the path terminates.
#[derive(Clone, Copy)]
pub struct PathVertex<'a> {
    pub d_tree: &'a DirTree,
    pub d_tree_node_size: Vec3,
    pub point: Vec3,
    pub direction: Vec3,
    /// Path throughput up to (and including) this bounce.
    pub throughput: Vec3,
    pub bsdf_value: Vec3,
    /// Radiance gathered downstream of this bounce; grows via
    /// [`Self::add_radiance`].
    pub radiance: Vec3,
    pub wi_pdf: f32,
    pub bsdf_pdf: f32,
    pub d_tree_pdf: f32,
    pub product_pdf: f32,
    pub is_delta: bool,
    pub guiding_method: GuidingMethod,
}

impl<'a> PathVertex<'a> {
    pub fn add_radiance(&mut self, radiance: Vec3) {
        self.radiance += radiance;
    }

    /// Converts the accumulated spectra into one scalar record and inserts
    /// it. Vertices with invalid components are dropped silently.
    pub fn record_to_tree(&self, sd_tree: &SpatTree, rng: &mut dyn RngCore) {
        let mut incoming_radiance = Vec3::ZERO;
        let mut product = Vec3::ZERO;
        for i in 0..3 {
            if !self.radiance[i].is_finite()
                || self.radiance[i] < 0.0
                || !self.bsdf_value[i].is_finite()
                || self.bsdf_value[i] < 0.0
            {
                return;
            }
            let rcp_throughput = if self.throughput[i] == 0.0 {
                0.0
            } else {
                1.0 / self.throughput[i]
            };
            incoming_radiance[i] = self.radiance[i] * rcp_throughput;
            product[i] = incoming_radiance[i] * self.bsdf_value[i];
        }

        let record = GuidingRecord {
            direction: self.direction,
            radiance: math::average(incoming_radiance),
            wi_pdf: self.wi_pdf,
            bsdf_pdf: self.bsdf_pdf,
            d_tree_pdf: self.d_tree_pdf,
            product_pdf: self.product_pdf,
            sample_weight: 1.0,
            product: math::average(product),
            is_delta: self.is_delta,
            guiding_method: self.guiding_method,
        };

        sd_tree.record(self.d_tree, self.point, self.d_tree_node_size, record, rng);
    }
}

/// Bounded vertex buffer for one camera path.
pub struct VertexPath<'a> {
    vertices: Vec<PathVertex<'a>>,
}

impl<'a> VertexPath<'a> {
    pub fn new() -> Self {
        Self {
            vertices: Vec::with_capacity(MAX_PATH_LENGTH),
        }
    }

    pub fn is_full(&self) -> bool {
        self.vertices.len() >= MAX_PATH_LENGTH
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Appends a vertex; silently dropped once the path is full.
    pub fn add_vertex(&mut self, vertex: PathVertex<'a>) {
        if !self.is_full() {
            self.vertices.push(vertex);
        }
    }

    /// Distributes newly found radiance to every stored vertex.
    pub fn add_radiance(&mut self, radiance: Vec3) {
        for vertex in &mut self.vertices {
            vertex.add_radiance(radiance);
        }
    }

    /// Distributes radiance to every vertex except the last one; used for
    /// light hits that the final bounce already accounted for directly.
    pub fn add_indirect_radiance(&mut self, radiance: Vec3) {
        let len = self.vertices.len();
        if len < 2 {
            return;
        }
        for vertex in &mut self.vertices[..len - 1] {
            vertex.add_radiance(radiance);
        }
    }

    /// Bulk-inserts every vertex into the SD-tree.
    pub fn record_to_tree(&self, sd_tree: &SpatTree, rng: &mut dyn RngCore) {
        for vertex in &self.vertices {
            vertex.record_to_tree(sd_tree, rng);
        }
    }
}

impl<'a> Default for VertexPath<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectionalFilter, GuidingConfig, SpatialFilter};
    use crate::math::Aabb3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn test_tree() -> SpatTree {
        let config = GuidingConfig {
            spatial_filter: SpatialFilter::Nearest,
            directional_filter: DirectionalFilter::Nearest,
            ..GuidingConfig::default()
        };
        SpatTree::new(
            Aabb3::new(Vec3::ZERO, Vec3::ONE),
            Arc::new(config),
        )
    }

    fn vertex<'a>(tree: &'a SpatTree, point: Vec3) -> PathVertex<'a> {
        let (d_tree, d_tree_node_size) = tree.get_d_tree(point);
        PathVertex {
            d_tree,
            d_tree_node_size,
            point,
            direction: Vec3::Z,
            throughput: Vec3::splat(0.5),
            bsdf_value: Vec3::splat(0.25),
            radiance: Vec3::ZERO,
            wi_pdf: 1.0,
            bsdf_pdf: 0.5,
            d_tree_pdf: 0.0,
            product_pdf: 0.0,
            is_delta: false,
            guiding_method: GuidingMethod::PathGuiding,
        }
    }

    #[test]
    fn radiance_propagates_to_buffered_vertices() {
        let tree = test_tree();
        let mut path = VertexPath::new();
        path.add_vertex(vertex(&tree, Vec3::splat(0.25)));
        path.add_vertex(vertex(&tree, Vec3::splat(0.75)));

        path.add_radiance(Vec3::ONE);
        path.add_indirect_radiance(Vec3::ONE);

        assert_eq!(path.vertices[0].radiance, Vec3::splat(2.0));
        assert_eq!(path.vertices[1].radiance, Vec3::ONE);
    }

    #[test]
    fn terminated_path_records_all_vertices() {
        let tree = test_tree();
        let mut rng = StdRng::seed_from_u64(41);

        let mut path = VertexPath::new();
        path.add_vertex(vertex(&tree, Vec3::splat(0.25)));
        path.add_vertex(vertex(&tree, Vec3::splat(0.75)));
        path.add_radiance(Vec3::ONE);
        path.record_to_tree(&tree, &mut rng);

        let (d_tree, _) = tree.get_d_tree(Vec3::splat(0.5));
        assert_eq!(d_tree.sample_weight(), 2.0);
    }

    #[test]
    fn invalid_vertices_are_skipped() {
        let tree = test_tree();
        let mut rng = StdRng::seed_from_u64(42);

        let mut bad = vertex(&tree, Vec3::splat(0.5));
        bad.radiance = Vec3::new(f32::NAN, 0.0, 0.0);
        bad.record_to_tree(&tree, &mut rng);

        let (d_tree, _) = tree.get_d_tree(Vec3::splat(0.5));
        assert_eq!(d_tree.sample_weight(), 0.0);
    }

    #[test]
    fn path_buffer_saturates() {
        let tree = test_tree();
        let mut path = VertexPath::new();
        for _ in 0..MAX_PATH_LENGTH + 5 {
            path.add_vertex(vertex(&tree, Vec3::splat(0.5)));
        }
        assert_eq!(path.len(), MAX_PATH_LENGTH);
        assert!(path.is_full());
    }
}
