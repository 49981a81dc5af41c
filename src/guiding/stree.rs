//! The spatio-directional tree: an axis-rotating binary subdivision of the
//! scene cube whose leaves each own one directional tree.
//!
//! During a pass the topology is frozen and records route concurrently to
//! the owning leaves. Between passes `build` snapshots every directional
//! tree, splits spatial leaves that saw enough samples, restructures all
//! directional trees in parallel, and logs aggregate statistics.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use rand::RngCore;

use crate::config::{GuidingConfig, SpatialFilter};
use crate::math::Aabb3;
use crate::parallel;
use crate::sampling;

use super::dtree::DirTree;
use super::{GuidingRecord, ScatteringMode, DTREE_THRESHOLD, SPATIAL_SUBDIVISION_THRESHOLD};

enum NodeState {
    Leaf(Box<DirTree>),
    Interior(Box<[SpatTreeNode; 2]>),
}

/// One spatial node: either a leaf owning a directional tree, or two
/// children split along `axis`. The states are mutually exclusive by
/// construction.
pub struct SpatTreeNode {
    axis: u8,
    state: NodeState,
}

impl SpatTreeNode {
    fn new_root(config: Arc<GuidingConfig>) -> Self {
        Self {
            axis: 0,
            state: NodeState::Leaf(Box::new(DirTree::new(config))),
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self.state, NodeState::Leaf(_))
    }

    /// Descends to the leaf containing `point` (normalized into `[0,1)^3`),
    /// halving `size` along each traversed axis.
    fn get_d_tree<'a>(&'a self, point: &mut Vec3, size: &mut Vec3) -> &'a DirTree {
        match &self.state {
            NodeState::Leaf(d_tree) => d_tree,
            NodeState::Interior(children) => {
                let axis = self.axis as usize;
                size[axis] *= 0.5;
                let child = if point[axis] < 0.5 {
                    point[axis] *= 2.0;
                    0
                } else {
                    point[axis] = (point[axis] - 0.5) * 2.0;
                    1
                };
                children[child].get_d_tree(point, size)
            }
        }
    }

    /// Splits every leaf whose accumulated sample weight exceeds
    /// `required_samples`; freshly created children are revisited, so a
    /// heavy leaf can split more than once.
    fn subdivide(&mut self, required_samples: f32) {
        if let NodeState::Leaf(d_tree) = &self.state {
            if d_tree.sample_weight() <= required_samples {
                return;
            }
            self.split();
        }
        if let NodeState::Interior(children) = &mut self.state {
            for child in children.iter_mut() {
                child.subdivide(required_samples);
            }
        }
    }

    /// Replaces this leaf by two children along the next axis, each with a
    /// copy of the directional tree carrying half the sample weight.
    fn split(&mut self) {
        if let NodeState::Leaf(d_tree) = &mut self.state {
            let mut first = (**d_tree).clone();
            first.halve_sample_weight();
            let second = first.clone();

            let child_axis = (self.axis + 1) % 3;
            self.state = NodeState::Interior(Box::new([
                SpatTreeNode {
                    axis: child_axis,
                    state: NodeState::Leaf(Box::new(first)),
                },
                SpatTreeNode {
                    axis: child_axis,
                    state: NodeState::Leaf(Box::new(second)),
                },
            ]));
        }
    }

    /// Box-filtered record: every overlapped leaf receives the record with
    /// its sample weight scaled by the overlap volume.
    fn record_box(&self, splat: Aabb3, node_box: Aabb3, record: &GuidingRecord) {
        let intersection = Aabb3::intersect(splat, node_box);
        if !intersection.is_valid() {
            return;
        }
        let volume = intersection.volume();
        if volume <= 0.0 {
            return;
        }

        match &self.state {
            NodeState::Leaf(d_tree) => {
                let mut weighted = *record;
                weighted.sample_weight *= volume;
                d_tree.record(&weighted);
            }
            NodeState::Interior(children) => {
                let axis = self.axis as usize;
                let mut offset = Vec3::ZERO;
                offset[axis] = 0.5 * node_box.extent()[axis];

                children[0].record_box(
                    splat,
                    Aabb3::new(node_box.min, node_box.max - offset),
                    record,
                );
                children[1].record_box(
                    splat,
                    Aabb3::new(node_box.min + offset, node_box.max),
                    record,
                );
            }
        }
    }

    fn build(&mut self) {
        match &mut self.state {
            NodeState::Leaf(d_tree) => d_tree.build(),
            NodeState::Interior(children) => {
                for child in children.iter_mut() {
                    child.build();
                }
            }
        }
    }

    /// Collects one restructure job per leaf for the parallel phase.
    fn collect_leaves<'a>(&'a mut self, jobs: &mut Vec<&'a mut DirTree>) {
        match &mut self.state {
            NodeState::Leaf(d_tree) => jobs.push(d_tree),
            NodeState::Interior(children) => {
                for child in children.iter_mut() {
                    child.collect_leaves(jobs);
                }
            }
        }
    }

    fn gather_statistics(&self, stats: &mut TreeStats, depth: usize) {
        stats.spatial_nodes += 1;
        match &self.state {
            NodeState::Leaf(d_tree) => {
                stats.d_trees += 1;

                stats.d_tree_depth.add(d_tree.max_depth() as f32);
                stats.d_tree_nodes.add(d_tree.node_count() as f32);
                stats.mean_radiance.add(d_tree.mean());
                stats.sample_weight.add(d_tree.sample_weight());
                stats.sampling_fraction.add(d_tree.bsdf_sampling_fraction());
                stats.spatial_depth.add(depth as f32);

                if d_tree.scattering_mode() == ScatteringMode::Glossy {
                    stats.glossy_d_trees += 1;
                }
            }
            NodeState::Interior(children) => {
                for child in children.iter() {
                    child.gather_statistics(stats, depth + 1);
                }
            }
        }
    }

    /// Depth-first dump of all leaves with positive sample weight.
    fn dump<W: Write>(&self, writer: &mut W, aabb: Aabb3) -> std::io::Result<()> {
        match &self.state {
            NodeState::Leaf(d_tree) => {
                if d_tree.sample_weight() > 0.0 {
                    let extent = aabb.extent();
                    for value in [
                        aabb.min.x, aabb.min.y, aabb.min.z, extent.x, extent.y, extent.z,
                    ] {
                        writer.write_all(&value.to_le_bytes())?;
                    }
                    d_tree.write_to(writer)?;
                }
                Ok(())
            }
            NodeState::Interior(children) => {
                let axis = self.axis as usize;
                let half_extent = 0.5 * aabb.extent()[axis];

                let mut child_aabb = aabb;
                child_aabb.max[axis] -= half_extent;
                children[0].dump(writer, child_aabb)?;

                child_aabb.min[axis] += half_extent;
                child_aabb.max[axis] += half_extent;
                children[1].dump(writer, child_aabb)
            }
        }
    }
}

/// Min/max/average accumulator used by the per-build statistics log.
#[derive(Debug, Clone, Copy)]
struct MinMaxAvg {
    min: f32,
    max: f32,
    sum: f32,
}

impl MinMaxAvg {
    fn new() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            sum: 0.0,
        }
    }

    fn add(&mut self, value: f32) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn avg(&self, count: usize) -> f32 {
        if count == 0 {
            0.0
        } else {
            self.sum / count as f32
        }
    }
}

/// Aggregate statistics over the whole SD-tree, logged after every build.
struct TreeStats {
    spatial_nodes: usize,
    d_trees: usize,
    glossy_d_trees: usize,
    spatial_depth: MinMaxAvg,
    d_tree_depth: MinMaxAvg,
    d_tree_nodes: MinMaxAvg,
    mean_radiance: MinMaxAvg,
    sample_weight: MinMaxAvg,
    sampling_fraction: MinMaxAvg,
}

impl TreeStats {
    fn new() -> Self {
        Self {
            spatial_nodes: 0,
            d_trees: 0,
            glossy_d_trees: 0,
            spatial_depth: MinMaxAvg::new(),
            d_tree_depth: MinMaxAvg::new(),
            d_tree_nodes: MinMaxAvg::new(),
            mean_radiance: MinMaxAvg::new(),
            sample_weight: MinMaxAvg::new(),
            sampling_fraction: MinMaxAvg::new(),
        }
    }

    fn log(&self) {
        let n = self.d_trees;
        log::info!(
            "SD-tree statistics [min, max, avg]:\n\
             spatial tree: {} nodes, {} leaves, depth [{}, {}, {:.2}]\n\
             directional trees: nodes [{}, {}, {:.1}], depth [{}, {}, {:.2}]\n\
             mean radiance [{:.3}, {:.3}, {:.3}], sample weight [{:.1}, {:.1}, {:.1}]\n\
             bsdf sampling fraction [{:.3}, {:.3}, {:.3}], glossy fraction {:.3}",
            self.spatial_nodes,
            n,
            self.spatial_depth.min,
            self.spatial_depth.max,
            self.spatial_depth.avg(n),
            self.d_tree_nodes.min,
            self.d_tree_nodes.max,
            self.d_tree_nodes.avg(n),
            self.d_tree_depth.min,
            self.d_tree_depth.max,
            self.d_tree_depth.avg(n),
            self.mean_radiance.min,
            self.mean_radiance.max,
            self.mean_radiance.avg(n),
            self.sample_weight.min,
            self.sample_weight.max,
            self.sample_weight.avg(n),
            self.sampling_fraction.min,
            self.sampling_fraction.max,
            self.sampling_fraction.avg(n),
            self.glossy_d_trees as f32 / n.max(1) as f32,
        );
    }
}

/// Root of the guiding cache.
pub struct SpatTree {
    config: Arc<GuidingConfig>,
    root: SpatTreeNode,
    aabb: Aabb3,
    is_built: bool,
    is_final_iteration: bool,
}

impl SpatTree {
    /// Builds an empty cache over `scene_aabb`, grown into a cube so every
    /// hierarchical halving stays cubical.
    pub fn new(scene_aabb: Aabb3, config: Arc<GuidingConfig>) -> Self {
        let extent = scene_aabb.extent();
        let max_extent = extent.max_element().max(f32::MIN_POSITIVE);
        let aabb = Aabb3::new(scene_aabb.min, scene_aabb.min + Vec3::splat(max_extent));

        Self {
            root: SpatTreeNode::new_root(Arc::clone(&config)),
            config,
            aabb,
            is_built: false,
            is_final_iteration: false,
        }
    }

    pub fn aabb(&self) -> Aabb3 {
        self.aabb
    }

    /// Locates the directional tree for a world-space point; also returns
    /// the world-space size of the owning voxel.
    pub fn get_d_tree(&self, point: Vec3) -> (&DirTree, Vec3) {
        let mut size = self.aabb.extent();
        let mut normalized = (point - self.aabb.min) / size;
        let d_tree = self.root.get_d_tree(&mut normalized, &mut size);
        (d_tree, size)
    }

    /// Inserts one observation under the configured spatial filter.
    /// Records with non-finite or negative payloads are dropped.
    pub fn record(
        &self,
        d_tree: &DirTree,
        point: Vec3,
        d_tree_node_size: Vec3,
        record: GuidingRecord,
        rng: &mut dyn RngCore,
    ) {
        if !record.is_valid() {
            return;
        }

        match self.config.spatial_filter {
            SpatialFilter::Nearest => d_tree.record(&record),
            SpatialFilter::Stochastic => {
                let offset = d_tree_node_size * (sampling::next_vec3(rng) - Vec3::splat(0.5));
                let jittered = self.aabb.clip(point + offset);
                let (jittered_tree, _) = self.get_d_tree(jittered);
                jittered_tree.record(&record);
            }
            SpatialFilter::Box => {
                let splat = Aabb3::new(
                    point - 0.5 * d_tree_node_size,
                    point + 0.5 * d_tree_node_size,
                );
                let volume = splat.volume();
                if volume <= 0.0 {
                    return;
                }
                let mut scaled = record;
                scaled.sample_weight /= volume;
                self.root.record_box(splat, self.aabb, &scaled);
            }
        }
    }

    /// Between-pass maintenance: snapshot every directional tree, split
    /// heavy spatial leaves, restructure all directional trees in parallel,
    /// then log statistics.
    pub fn build(&mut self, iteration: usize) {
        self.root.build();

        let required_samples =
            SPATIAL_SUBDIVISION_THRESHOLD * 2.0f32.powf(iteration as f32 * 0.5);
        self.root.subdivide(required_samples);

        let mut jobs = Vec::new();
        self.root.collect_leaves(&mut jobs);
        parallel::drain_parallel(jobs, |d_tree| d_tree.restructure(DTREE_THRESHOLD));

        let mut stats = TreeStats::new();
        self.root.gather_statistics(&mut stats, 1);
        stats.log();

        self.is_built = true;
    }

    pub fn is_built(&self) -> bool {
        self.is_built
    }

    /// Latched by the pass controller; recording and rebuilding stop after
    /// the final iteration begins.
    pub fn start_final_iteration(&mut self) {
        self.is_final_iteration = true;
    }

    pub fn is_final_iteration(&self) -> bool {
        self.is_final_iteration
    }

    /// Dumps the tree in the visualizer layout. IO failures are logged and
    /// swallowed; rendering continues without the dump.
    pub fn write_to_disk(&self, camera_matrix: Mat4, iteration: usize, append_iteration: bool) {
        let Some(base_path) = &self.config.save_path else {
            return;
        };

        let path = if append_iteration {
            dump_path_for_iteration(base_path, iteration)
        } else {
            base_path.clone()
        };

        let result = File::create(&path).and_then(|file| {
            let mut writer = BufWriter::new(file);
            self.dump(&mut writer, camera_matrix)
        });
        if let Err(error) = result {
            log::warn!("could not write SD-tree dump to {:?}: {}", path, error);
        }
    }

    /// Binary layout: 16 floats of the camera matrix (rotated 180 degrees
    /// around Y for the visualizer's axis convention), then each non-empty
    /// leaf as bbox min/extent plus its directional dump.
    pub fn dump<W: Write>(&self, writer: &mut W, camera_matrix: Mat4) -> std::io::Result<()> {
        let rotated = camera_matrix * Mat4::from_rotation_y(std::f32::consts::PI);
        for row in 0..4 {
            let r = rotated.row(row);
            for value in [r.x, r.y, r.z, r.w] {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        self.root.dump(writer, self.aabb)
    }
}

/// `scene.sdt` with iteration 3 becomes `scene-03.sdt`.
fn dump_path_for_iteration(base: &std::path::Path, iteration: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sdtree");
    let extension = base.extension().and_then(|s| s.to_str()).unwrap_or("sdt");
    base.with_file_name(format!("{}-{:02}.{}", stem, iteration, extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectionalFilter;
    use crate::guiding::GuidingMethod;
    use crate::math::RCP_FOUR_PI;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_config(spatial_filter: SpatialFilter) -> Arc<GuidingConfig> {
        Arc::new(GuidingConfig {
            spatial_filter,
            directional_filter: DirectionalFilter::Nearest,
            ..GuidingConfig::default()
        })
    }

    fn scene_aabb() -> Aabb3 {
        Aabb3::new(Vec3::new(-1.0, -2.0, 0.0), Vec3::new(3.0, 0.0, 1.0))
    }

    fn record_at(tree: &SpatTree, point: Vec3, rng: &mut StdRng) {
        let (d_tree, size) = tree.get_d_tree(point);
        tree.record(
            d_tree,
            point,
            size,
            GuidingRecord {
                direction: Vec3::Z,
                radiance: 1.0,
                wi_pdf: 1.0,
                bsdf_pdf: 0.0,
                d_tree_pdf: 0.0,
                product_pdf: 0.0,
                sample_weight: 1.0,
                product: 0.0,
                is_delta: false,
                guiding_method: GuidingMethod::PathGuiding,
            },
            rng,
        );
    }

    #[test]
    fn scene_bounds_grow_into_a_cube() {
        let tree = SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let extent = tree.aabb().extent();
        assert_eq!(extent, Vec3::splat(4.0));
        assert_eq!(tree.aabb().min, Vec3::new(-1.0, -2.0, 0.0));
    }

    #[test]
    fn get_d_tree_reports_shrinking_voxels() {
        let mut tree = SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let point = Vec3::new(0.0, -1.0, 0.5);

        let (_, size) = tree.get_d_tree(point);
        assert_eq!(size, Vec3::splat(4.0));

        // 100 > 50 splits the root once along x; the halved children stop.
        let mut rng = StdRng::seed_from_u64(31);
        for _ in 0..100 {
            record_at(&tree, point, &mut rng);
        }
        tree.root.subdivide(50.0);

        let (_, size) = tree.get_d_tree(point);
        assert_eq!(size, Vec3::new(2.0, 4.0, 4.0));
    }

    #[test]
    fn subdivision_halves_sample_weight_per_level() {
        let tree = &mut SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let point = Vec3::new(0.0, -1.0, 0.5);
        let mut rng = StdRng::seed_from_u64(32);
        for _ in 0..128 {
            record_at(tree, point, &mut rng);
        }

        let (d_tree, _) = tree.get_d_tree(point);
        assert_eq!(d_tree.sample_weight(), 128.0);

        tree.root.subdivide(100.0);
        // 128 > 100 splits into two 64s; 64 < 100 stops the recursion.
        let (d_tree, _) = tree.get_d_tree(point);
        assert_eq!(d_tree.sample_weight(), 64.0);

        // Both children carry the copied tree: ownership moved, not shared.
        let other = Vec3::new(2.9, -1.0, 0.5);
        let (other_tree, _) = tree.get_d_tree(other);
        assert_eq!(other_tree.sample_weight(), 64.0);
        assert!(!std::ptr::eq(d_tree, other_tree));
    }

    #[test]
    fn build_restructures_all_leaves_and_logs() {
        let tree = &mut SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let mut rng = StdRng::seed_from_u64(33);
        for i in 0..512 {
            let t = i as f32 / 512.0;
            record_at(tree, Vec3::new(-1.0 + 4.0 * t, -1.0, 0.5), &mut rng);
        }

        assert!(!tree.is_built());
        tree.build(0);
        assert!(tree.is_built());

        let (d_tree, _) = tree.get_d_tree(Vec3::new(0.0, -1.0, 0.5));
        assert!(d_tree.is_built());
        // Directional mass was published: pdf deviates from uniform.
        assert!(d_tree.pdf(Vec3::Z, crate::guiding::ScatteringModes::ALL) > RCP_FOUR_PI);
    }

    #[test]
    fn stochastic_records_stay_inside_the_scene() {
        let tree = SpatTree::new(scene_aabb(), test_config(SpatialFilter::Stochastic));
        let mut rng = StdRng::seed_from_u64(34);

        // Record at a corner; jitter must be clipped into the cube, not lost.
        let corner = Vec3::new(-1.0, -2.0, 0.0);
        for _ in 0..64 {
            record_at(&tree, corner, &mut rng);
        }

        let mut jobs_weight = 0.0;
        let mut probe = |p: Vec3| {
            let (t, _) = tree.get_d_tree(p);
            jobs_weight += t.sample_weight();
        };
        probe(corner);
        assert_eq!(jobs_weight, 64.0);
    }

    #[test]
    fn box_filter_conserves_total_sample_weight() {
        let tree = &mut SpatTree::new(scene_aabb(), test_config(SpatialFilter::Box));
        // Center of the cube: every splat stays inside the scene bounds.
        let point = Vec3::new(1.0, 0.0, 2.0);
        let mut rng = StdRng::seed_from_u64(35);

        for _ in 0..200 {
            record_at(tree, point, &mut rng);
        }
        // 200 -> two 100s -> four 50s; splitting halves, never loses weight.
        tree.root.subdivide(50.0);

        // With four leaves the splat now spans several of them.
        for _ in 0..100 {
            record_at(tree, point, &mut rng);
        }

        let mut jobs = Vec::new();
        tree.root.collect_leaves(&mut jobs);
        let total: f32 = jobs.iter().map(|t| t.sample_weight()).sum();
        assert!((total - 300.0).abs() < 300.0 * 1e-4, "total weight {}", total);
    }

    #[test]
    fn invalid_records_are_dropped() {
        let tree = SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let mut rng = StdRng::seed_from_u64(36);
        let point = Vec3::new(0.0, -1.0, 0.5);
        let (d_tree, size) = tree.get_d_tree(point);

        for radiance in [f32::NAN, f32::INFINITY, -1.0] {
            tree.record(
                d_tree,
                point,
                size,
                GuidingRecord {
                    direction: Vec3::Z,
                    radiance,
                    wi_pdf: 1.0,
                    bsdf_pdf: 0.0,
                    d_tree_pdf: 0.0,
                    product_pdf: 0.0,
                    sample_weight: 1.0,
                    product: 0.0,
                    is_delta: false,
                    guiding_method: GuidingMethod::PathGuiding,
                },
                &mut rng,
            );
        }
        assert_eq!(d_tree.sample_weight(), 0.0);
    }

    #[test]
    fn dump_starts_with_camera_preamble() {
        let tree = &mut SpatTree::new(scene_aabb(), test_config(SpatialFilter::Nearest));
        let mut rng = StdRng::seed_from_u64(37);
        for _ in 0..32 {
            record_at(tree, Vec3::new(0.0, -1.0, 0.5), &mut rng);
        }
        tree.build(0);
        // Leave fresh records so the leaf has positive sample weight.
        for _ in 0..8 {
            record_at(tree, Vec3::new(0.0, -1.0, 0.5), &mut rng);
        }

        let mut bytes = Vec::new();
        tree.dump(&mut bytes, Mat4::IDENTITY).unwrap();

        // 16 camera floats, then at least one leaf record:
        // 6 bbox floats + directional header (f32 + 2 * u64).
        assert!(bytes.len() >= 64 + 24 + 20);

        // Identity camera rotated around Y: row 0 is (-1, 0, 0, 0).
        let m00 = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert!((m00 + 1.0).abs() < 1e-6);

        // First leaf bbox is the scene cube (root is still a leaf).
        let bbox_min_x = f32::from_le_bytes(bytes[64..68].try_into().unwrap());
        let extent_x = f32::from_le_bytes(bytes[76..80].try_into().unwrap());
        assert_eq!(bbox_min_x, -1.0);
        assert_eq!(extent_x, 4.0);
    }

    #[test]
    fn iteration_dump_paths_are_suffixed() {
        let base = PathBuf::from("/tmp/guiding/scene.sdt");
        assert_eq!(
            dump_path_for_iteration(&base, 3),
            PathBuf::from("/tmp/guiding/scene-03.sdt")
        );
    }
}
