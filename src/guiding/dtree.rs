//! Adaptive directional quadtree over the cylindrical unit square.
//!
//! Each tree learns a 2D density proportional to the incident radiance seen
//! at one spatial cell. Worker threads record concurrently into atomic
//! accumulators; between passes the tree snapshots those sums, refines its
//! topology toward the observed distribution, and republishes itself for
//! sampling and pdf queries.

use std::io::Write;
use std::sync::Arc;

use glam::{Vec2, Vec3};
use rand::RngCore;

use crate::atomic::{AtomicF32, SpinLock};
use crate::config::{DirectionalFilter, GuidedBounceMode, GuidingConfig, SamplingFractionMode};
use crate::math::{self, Aabb2, RCP_FOUR_PI};
use crate::sampling;

use super::optimizer::{logistic, Adam, REGULARIZATION};
use super::proxy::{ProxyStratum, RadianceProxy};
use super::{
    GuidingMethod, GuidingRecord, ScatteringMode, ScatteringModes, DTREE_GLOSSY_AREA_FRACTION,
    DTREE_GLOSSY_ENERGY_THRESHOLD, DTREE_MAX_DEPTH,
};

/// Quadrant layout of a node's children over its unit square:
/// upper-left, upper-right, lower-right, lower-left, where "upper" means
/// `v < 0.5`. Offsets are the child squares' minimum corners.
pub(crate) const CHILD_OFFSETS: [Vec2; 4] = [
    Vec2::new(0.0, 0.0),
    Vec2::new(0.5, 0.0),
    Vec2::new(0.5, 0.5),
    Vec2::new(0.0, 0.5),
];

/// Child order expected by the visualizer dump: UL, UR, LL, LR.
const DUMP_CHILD_ORDER: [usize; 4] = [0, 1, 3, 2];

/// Quadrant of `p` in the unit square; remaps `p` into that child's square.
pub(crate) fn child_index(p: &mut Vec2) -> usize {
    let right = p.x >= 0.5;
    let lower = p.y >= 0.5;
    p.x = if right { 2.0 * p.x - 1.0 } else { 2.0 * p.x };
    p.y = if lower { 2.0 * p.y - 1.0 } else { 2.0 * p.y };
    match (right, lower) {
        (false, false) => 0,
        (true, false) => 1,
        (true, true) => 2,
        (false, true) => 3,
    }
}

/// One quadtree node. `current` collects radiance during a pass; `previous`
/// is the snapshot the pass reads for sampling and pdf evaluation.
#[derive(Debug, Clone)]
pub(crate) struct DirTreeNode {
    current: AtomicF32,
    previous: f32,
    children: Option<Box<[DirTreeNode; 4]>>,
}

/// Node used by the flattened visualizer dump; `children[i] == 0` marks a
/// leaf slot, anything else indexes into the flat node list.
struct FlatNode {
    sums: [f32; 4],
    children: [usize; 4],
}

impl DirTreeNode {
    fn leaf(previous: f32) -> Self {
        Self {
            current: AtomicF32::new(0.0),
            previous,
            children: None,
        }
    }

    /// The degenerate published topology: an interior root over four empty
    /// leaves. Every tree starts and resets to this shape.
    fn fresh_root() -> Self {
        Self {
            current: AtomicF32::new(0.0),
            previous: 0.0,
            children: Some(Box::new([
                Self::leaf(0.0),
                Self::leaf(0.0),
                Self::leaf(0.0),
                Self::leaf(0.0),
            ])),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub(crate) fn previous(&self) -> f32 {
        self.previous
    }

    fn record_nearest(&self, mut p: Vec2, radiance: f32) {
        let mut node = self;
        loop {
            match &node.children {
                None => {
                    node.current.fetch_add(radiance);
                    return;
                }
                Some(children) => node = &children[child_index(&mut p)],
            }
        }
    }

    /// Splats `radiance * intersection_area` into every leaf the splat box
    /// overlaps. `radiance` is already divided by the splat area.
    fn record_box(&self, splat: Aabb2, node_box: Aabb2, radiance: f32) {
        let intersection = Aabb2::intersect(splat, node_box);
        if !intersection.is_valid() {
            return;
        }
        let area = intersection.area();
        if area <= 0.0 {
            return;
        }

        match &self.children {
            None => self.current.fetch_add(radiance * area),
            Some(children) => {
                let half = 0.5 * node_box.extent();
                for (child, offset) in children.iter().zip(CHILD_OFFSETS) {
                    let min = node_box.min + offset * node_box.extent();
                    child.record_box(splat, Aabb2::new(min, min + half), radiance);
                }
            }
        }
    }

    fn depth_at(&self, mut p: Vec2) -> usize {
        let mut node = self;
        let mut depth = 0;
        while let Some(children) = &node.children {
            node = &children[child_index(&mut p)];
            depth += 1;
        }
        depth
    }

    fn node_count(&self) -> usize {
        match &self.children {
            None => 1,
            Some(children) => 1 + children.iter().map(Self::node_count).sum::<usize>(),
        }
    }

    fn max_depth(&self) -> usize {
        match &self.children {
            None => 1,
            Some(children) => 1 + children.iter().map(Self::max_depth).max().unwrap_or(0),
        }
    }

    /// Copies `current` into `previous`, summing interior nodes bottom-up.
    /// Returns this node's new `previous`.
    fn build_radiance_sums(&mut self) -> f32 {
        self.previous = match &mut self.children {
            None => self.current.load(),
            Some(children) => children.iter_mut().map(Self::build_radiance_sums).sum(),
        };
        self.previous
    }

    fn reset_current(&mut self) {
        self.current.store(0.0);
        if let Some(children) = &mut self.children {
            for child in children.iter_mut() {
                child.reset_current();
            }
        }
    }

    /// One adaptive refinement pass. A leaf holding more than
    /// `threshold` of the total mass splits once into four quarter-seeded
    /// children (new children are not revisited within the same pass); an
    /// interior node whose children all fall at or below the threshold
    /// collapses back into a leaf. The root itself never collapses.
    ///
    /// Every surviving leaf pushes its `(area_fraction, energy_fraction)`
    /// onto `leaves` for the scattering-mode sweep.
    fn restructure(
        &mut self,
        total_sum: f32,
        threshold: f32,
        depth: usize,
        leaves: &mut Vec<(f32, f32)>,
    ) {
        let area = 0.25f32.powi(depth as i32);
        let fraction = self.previous / total_sum;

        match &mut self.children {
            None => {
                if fraction > threshold && depth < DTREE_MAX_DEPTH {
                    let quarter = 0.25 * self.previous;
                    self.children = Some(Box::new([
                        Self::leaf(quarter),
                        Self::leaf(quarter),
                        Self::leaf(quarter),
                        Self::leaf(quarter),
                    ]));
                    for _ in 0..4 {
                        leaves.push((0.25 * area, quarter / total_sum));
                    }
                } else {
                    leaves.push((area, fraction));
                }
            }
            Some(children) => {
                let collapse = depth > 0
                    && children
                        .iter()
                        .all(|child| !(child.previous / total_sum > threshold));
                if collapse {
                    self.children = None;
                    leaves.push((area, fraction));
                } else {
                    for child in children.iter_mut() {
                        child.restructure(total_sum, threshold, depth + 1, leaves);
                    }
                }
            }
        }
    }

    fn pdf_recursive(&self, p: &mut Vec2) -> f32 {
        match &self.children {
            None => self.previous,
            Some(children) => 4.0 * children[child_index(p)].pdf_recursive(p),
        }
    }

    /// Draws a point in this node's unit square with probability
    /// proportional to the `previous` sums; multiplies the quadrant
    /// selection factors into `pdf`.
    fn sample_recursive(&self, s: &mut Vec2, pdf: &mut f32) -> Vec2 {
        // Renormalization in the caller can push a coordinate to 1.0.
        *s = s.min(Vec2::splat(1.0 - f32::EPSILON));

        let children = match &self.children {
            None => {
                *pdf *= self.previous;
                return *s;
            }
            Some(children) => children,
        };

        let upper_left = children[0].previous;
        let upper_right = children[1].previous;
        let lower_right = children[2].previous;
        let lower_left = children[3].previous;
        let left_half = upper_left + lower_left;
        let right_half = upper_right + lower_right;

        *pdf *= 4.0;

        let mut factor = left_half / self.previous;
        if s.x < factor {
            s.x /= factor;
            factor = upper_left / left_half;
            if s.y < factor {
                s.y /= factor;
                CHILD_OFFSETS[0] + 0.5 * children[0].sample_recursive(s, pdf)
            } else {
                s.y = (s.y - factor) / (1.0 - factor);
                CHILD_OFFSETS[3] + 0.5 * children[3].sample_recursive(s, pdf)
            }
        } else {
            s.x = (s.x - factor) / (1.0 - factor);
            factor = upper_right / right_half;
            if s.y < factor {
                s.y /= factor;
                CHILD_OFFSETS[1] + 0.5 * children[1].sample_recursive(s, pdf)
            } else {
                s.y = (s.y - factor) / (1.0 - factor);
                CHILD_OFFSETS[2] + 0.5 * children[2].sample_recursive(s, pdf)
            }
        }
    }

    /// Per-area radiance density at `p` (leaf sum scaled by its area).
    fn radiance_at(&self, p: &mut Vec2) -> f32 {
        match &self.children {
            None => self.previous,
            Some(children) => 4.0 * children[child_index(p)].radiance_at(p),
        }
    }

    /// Immutable pdf-only snapshot of this subtree for the radiance proxy.
    pub(crate) fn snapshot(&self) -> ProxyStratum {
        ProxyStratum {
            previous: self.previous,
            children: self.children.as_ref().map(|children| {
                Box::new([
                    children[0].snapshot(),
                    children[1].snapshot(),
                    children[2].snapshot(),
                    children[3].snapshot(),
                ])
            }),
        }
    }

    /// Rasterizes this subtree into the proxy's pixel grid. `factor` carries
    /// the accumulated `4^depth * scale`; pixels straddled by a deeper
    /// subtree get a snapshot of it as their stratum.
    pub(crate) fn build_radiance_proxy(
        &self,
        pixels: &mut [f32],
        strata: &mut [Option<ProxyStratum>],
        proxy_width: usize,
        factor: f32,
        end_level: usize,
        origin: (usize, usize),
        depth: usize,
    ) {
        if depth == end_level || self.is_leaf() {
            let width = 1 << (end_level - depth);
            let pixel_origin = (origin.0 * width, origin.1 * width);
            let radiance = factor * self.previous;

            for y in 0..width {
                for x in 0..width {
                    let index = (pixel_origin.1 + y) * proxy_width + pixel_origin.0 + x;
                    pixels[index] = radiance;
                    strata[index] = if self.is_leaf() {
                        None
                    } else {
                        Some(self.snapshot())
                    };
                }
            }
        } else if let Some(children) = &self.children {
            let sub_origin = (2 * origin.0, 2 * origin.1);
            for (child, offset) in children.iter().zip(CHILD_OFFSETS) {
                child.build_radiance_proxy(
                    pixels,
                    strata,
                    proxy_width,
                    factor * 4.0,
                    end_level,
                    (
                        sub_origin.0 + (offset.x > 0.0) as usize,
                        sub_origin.1 + (offset.y > 0.0) as usize,
                    ),
                    depth + 1,
                );
            }
        }
    }

    fn flatten(&self, nodes: &mut Vec<FlatNode>) {
        let my_index = nodes.len();
        nodes.push(FlatNode {
            sums: [0.0; 4],
            children: [0; 4],
        });

        let children = self
            .children
            .as_ref()
            .expect("flatten starts at an interior node");
        for (slot, &quadrant) in DUMP_CHILD_ORDER.iter().enumerate() {
            let child = &children[quadrant];
            nodes[my_index].sums[slot] = child.previous;
            if !child.is_leaf() {
                let next_index = nodes.len();
                child.flatten(nodes);
                nodes[my_index].children[slot] = next_index;
            }
        }
    }
}

/// Sample drawn from a directional tree.
#[derive(Debug, Clone, Copy)]
pub struct DirTreeSample {
    pub direction: Vec3,
    pub pdf: f32,
    pub scattering_mode: ScatteringMode,
}

/// One spatial cell's directional radiance cache.
pub struct DirTree {
    config: Arc<GuidingConfig>,
    root: DirTreeNode,
    current_sample_weight: AtomicF32,
    previous_sample_weight: f32,
    optimizer: SpinLock<Adam<f32>>,
    optimizer_product: SpinLock<Adam<Vec2>>,
    is_built: bool,
    scattering_mode: ScatteringMode,
    proxy: RadianceProxy,
}

impl Clone for DirTree {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            root: self.root.clone(),
            current_sample_weight: self.current_sample_weight.clone(),
            previous_sample_weight: self.previous_sample_weight,
            optimizer: SpinLock::new(self.optimizer.clone_inner()),
            optimizer_product: SpinLock::new(self.optimizer_product.clone_inner()),
            is_built: self.is_built,
            scattering_mode: self.scattering_mode,
            proxy: self.proxy.clone(),
        }
    }
}

impl DirTree {
    pub fn new(config: Arc<GuidingConfig>) -> Self {
        let learning_rate = config.learning_rate;
        Self {
            config,
            root: DirTreeNode::fresh_root(),
            current_sample_weight: AtomicF32::new(0.0),
            previous_sample_weight: 0.0,
            optimizer: SpinLock::new(Adam::new(learning_rate)),
            optimizer_product: SpinLock::new(Adam::new(learning_rate)),
            is_built: false,
            scattering_mode: ScatteringMode::Diffuse,
            proxy: RadianceProxy::new(),
        }
    }

    /// Ingests one observation: an optimizer step when the sample carries a
    /// usable product, then an atomic radiance splat under the configured
    /// directional filter.
    pub fn record(&self, record: &GuidingRecord) {
        if self.config.bsdf_sampling_fraction_mode == SamplingFractionMode::Learn
            && self.is_built
            && record.product > 0.0
        {
            match record.guiding_method {
                GuidingMethod::PathGuiding => self.optimization_step(record),
                GuidingMethod::ProductGuiding => self.optimization_step_product(record),
            }
        }

        if record.is_delta || record.wi_pdf <= 0.0 {
            return;
        }

        self.current_sample_weight.fetch_add(record.sample_weight);

        let radiance = record.radiance / record.wi_pdf * record.sample_weight;
        let p = math::dir_to_cylindrical(record.direction);

        match self.config.directional_filter {
            DirectionalFilter::Nearest => self.root.record_nearest(p, radiance),
            DirectionalFilter::Box => {
                let leaf_size = Vec2::splat(0.5f32.powi(self.root.depth_at(p) as i32));
                let splat = Aabb2::new(p - 0.5 * leaf_size, p + 0.5 * leaf_size);
                if splat.area() > 0.0 {
                    self.root.record_box(splat, Aabb2::unit(), radiance / splat.area());
                }
            }
        }
    }

    /// Draws a direction proportional to the published radiance. Falls back
    /// to uniform-on-sphere while the tree has no mass, so the pdf is never
    /// zero for an admissible mode.
    pub fn sample(&self, rng: &mut dyn RngCore, modes: ScatteringModes) -> DirTreeSample {
        if !modes.contains(self.scattering_mode) {
            return DirTreeSample {
                direction: Vec3::Z,
                pdf: 0.0,
                scattering_mode: ScatteringMode::None,
            };
        }

        let mut s = sampling::next_vec2(rng);

        if self.previous_sample_weight <= 0.0 || self.root.previous <= 0.0 {
            DirTreeSample {
                direction: math::sample_sphere_uniform(s),
                pdf: RCP_FOUR_PI,
                scattering_mode: ScatteringMode::Diffuse,
            }
        } else {
            let mut pdf = 1.0 / self.root.previous;
            let p = self
                .root
                .sample_recursive(&mut s, &mut pdf)
                .min(Vec2::splat(1.0 - f32::EPSILON))
                .max(Vec2::ZERO);
            DirTreeSample {
                direction: math::cylindrical_to_dir(p),
                pdf: pdf * RCP_FOUR_PI,
                scattering_mode: self.scattering_mode,
            }
        }
    }

    /// Density of [`Self::sample`] at `direction`.
    pub fn pdf(&self, direction: Vec3, modes: ScatteringModes) -> f32 {
        if !modes.contains(self.scattering_mode) {
            return 0.0;
        }
        if self.previous_sample_weight <= 0.0 || self.root.previous <= 0.0 {
            return RCP_FOUR_PI;
        }
        let mut p = math::dir_to_cylindrical(direction);
        self.root.pdf_recursive(&mut p) / self.root.previous * RCP_FOUR_PI
    }

    /// Snapshots the pass's accumulators; must run before `restructure`.
    pub fn build(&mut self) {
        self.previous_sample_weight = self.current_sample_weight.load();
        self.root.build_radiance_sums();
    }

    /// Adapts the topology to the snapshot taken by [`Self::build`], then
    /// re-classifies the scattering mode and republishes the radiance proxy.
    /// Trees that collected nothing reset to the degenerate root.
    pub fn restructure(&mut self, threshold: f32) {
        self.is_built = true;
        self.current_sample_weight.store(0.0);
        self.proxy.invalidate();

        let total_sum = self.root.previous;
        if total_sum <= 0.0 {
            self.root = DirTreeNode::fresh_root();
            self.scattering_mode = ScatteringMode::Diffuse;
            self.optimizer.get_mut().reset();
            self.optimizer_product.get_mut().reset();
            return;
        }

        let mut leaves = Vec::new();
        self.root.restructure(total_sum, threshold, 0, &mut leaves);
        self.root.reset_current();

        if self.config.guided_bounce_mode == GuidedBounceMode::Learn {
            self.scattering_mode = classify_scattering_mode(&mut leaves);
        }

        if self.previous_sample_weight > 0.0 {
            self.proxy
                .build(&self.root, RCP_FOUR_PI / self.previous_sample_weight);
        }
    }

    pub fn is_built(&self) -> bool {
        self.is_built
    }

    pub fn scattering_mode(&self) -> ScatteringMode {
        self.scattering_mode
    }

    pub fn radiance_proxy(&self) -> &RadianceProxy {
        &self.proxy
    }

    /// Sample weight accumulated during the current pass.
    pub fn sample_weight(&self) -> f32 {
        self.current_sample_weight.load()
    }

    /// Spatial subdivision copies a tree into both children; each copy keeps
    /// half the evidence.
    pub fn halve_sample_weight(&mut self) {
        let halved = 0.5 * self.current_sample_weight.load();
        self.current_sample_weight.store(halved);
    }

    /// Mean radiance over the sphere per unit sample weight.
    pub fn mean(&self) -> f32 {
        if self.previous_sample_weight <= 0.0 {
            return 0.0;
        }
        self.root.previous * RCP_FOUR_PI / self.previous_sample_weight
    }

    /// Published radiance density toward `direction`. Debugging accessor.
    pub fn radiance(&self, direction: Vec3) -> f32 {
        if self.root.previous <= 0.0 || self.previous_sample_weight <= 0.0 {
            return 0.0;
        }
        let mut p = math::dir_to_cylindrical(direction);
        self.root.radiance_at(&mut p) * RCP_FOUR_PI / self.previous_sample_weight
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    pub fn max_depth(&self) -> usize {
        self.root.max_depth()
    }

    /// Mixing weight of the BSDF proposal in the two-way mixture.
    pub fn bsdf_sampling_fraction(&self) -> f32 {
        match self.config.bsdf_sampling_fraction_mode {
            SamplingFractionMode::Learn => logistic(self.optimizer.lock().theta()),
            SamplingFractionMode::Fixed => self.config.fixed_bsdf_sampling_fraction,
        }
    }

    /// `(bsdf, product)` mixing weights of the three-way mixture.
    pub fn bsdf_sampling_fraction_product(&self) -> Vec2 {
        match self.config.bsdf_sampling_fraction_mode {
            SamplingFractionMode::Learn => {
                let theta = self.optimizer_product.lock().theta();
                Vec2::new(logistic(theta.x), logistic(theta.y))
            }
            SamplingFractionMode::Fixed => Vec2::new(0.33333, 0.5),
        }
    }

    // Gradient of the two-way mixture objective through the logistic
    // parameterization, regularized toward theta = 0.
    fn optimization_step(&self, record: &GuidingRecord) {
        let mut adam = self.optimizer.lock();

        let fraction = logistic(adam.theta());
        let combined_pdf =
            fraction * record.bsdf_pdf + (1.0 - fraction) * record.d_tree_pdf;
        if combined_pdf <= 0.0 {
            return;
        }

        let d_fraction = -record.product * (record.bsdf_pdf - record.d_tree_pdf)
            / (record.wi_pdf * combined_pdf);
        let d_theta = d_fraction * fraction * (1.0 - fraction);
        let gradient = (d_theta + adam.theta() * REGULARIZATION) * record.sample_weight;

        adam.step(gradient);
    }

    fn optimization_step_product(&self, record: &GuidingRecord) {
        let mut adam = self.optimizer_product.lock();

        let theta = adam.theta();
        let fraction = Vec2::new(logistic(theta.x), logistic(theta.y));
        let guided_pdf = fraction.y * record.d_tree_pdf + (1.0 - fraction.y) * record.product_pdf;
        let combined_pdf = fraction.x * record.bsdf_pdf + (1.0 - fraction.x) * guided_pdf;
        if combined_pdf <= 0.0 {
            return;
        }

        let common = -record.product / (record.wi_pdf * combined_pdf);
        let d_fraction = Vec2::new(
            common * (record.bsdf_pdf - guided_pdf),
            common * (1.0 - fraction.x) * (record.d_tree_pdf - record.product_pdf),
        );
        let d_theta = d_fraction * fraction * (Vec2::ONE - fraction);
        let gradient = (d_theta + theta * REGULARIZATION) * record.sample_weight;

        adam.step(gradient);
    }

    /// Directional part of the visualizer dump: mean, sample weight, then
    /// the flattened node list as `(sum, child_index)` quadruples.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut nodes = Vec::new();
        self.root.flatten(&mut nodes);

        writer.write_all(&self.mean().to_le_bytes())?;
        writer.write_all(&(self.sample_weight() as u64).to_le_bytes())?;
        writer.write_all(&(nodes.len() as u64).to_le_bytes())?;

        for node in &nodes {
            for i in 0..4 {
                writer.write_all(&node.sums[i].to_le_bytes())?;
                writer.write_all(&(node.children[i] as u16).to_le_bytes())?;
            }
        }
        Ok(())
    }
}

/// Sweeps the per-leaf `(area, energy)` fractions from the smallest leaves
/// upward: a tree whose energy concentrates into a small solid angle scatters
/// like a glossy surface, anything broader counts as diffuse.
fn classify_scattering_mode(leaves: &mut [(f32, f32)]) -> ScatteringMode {
    leaves.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut area_sum = 0.0;
    let mut energy_sum = 0.0;
    for &(area, energy) in leaves.iter() {
        if area_sum + area >= DTREE_GLOSSY_AREA_FRACTION {
            break;
        }
        area_sum += area;
        energy_sum += energy;
        if energy_sum > DTREE_GLOSSY_ENERGY_THRESHOLD {
            return ScatteringMode::Glossy;
        }
    }
    ScatteringMode::Diffuse
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuidingConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const THRESHOLD: f32 = crate::guiding::DTREE_THRESHOLD;

    fn tree_with(configure: impl FnOnce(&mut GuidingConfig)) -> DirTree {
        let mut config = GuidingConfig::default();
        configure(&mut config);
        DirTree::new(Arc::new(config))
    }

    fn nearest_tree() -> DirTree {
        tree_with(|c| c.directional_filter = DirectionalFilter::Nearest)
    }

    fn record_dir(tree: &DirTree, direction: Vec3, radiance: f32) {
        tree.record(&GuidingRecord {
            direction,
            radiance,
            wi_pdf: 1.0,
            bsdf_pdf: 0.0,
            d_tree_pdf: 0.0,
            product_pdf: 0.0,
            sample_weight: 1.0,
            product: 0.0,
            is_delta: false,
            guiding_method: GuidingMethod::PathGuiding,
        });
    }

    /// Point in the upper-right quadrant of the directional square.
    fn upper_right_dir() -> Vec3 {
        math::cylindrical_to_dir(Vec2::new(0.75, 0.25))
    }

    #[test]
    fn empty_tree_samples_uniformly() {
        let tree = nearest_tree();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..64 {
            let sample = tree.sample(&mut rng, ScatteringModes::ALL);
            assert!((sample.direction.length() - 1.0).abs() < 1e-4);
            assert_eq!(sample.pdf, RCP_FOUR_PI);
            assert_eq!(sample.scattering_mode, ScatteringMode::Diffuse);
        }
        assert_eq!(tree.pdf(Vec3::Z, ScatteringModes::ALL), RCP_FOUR_PI);
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn hot_quadrant_subdivides_once_per_restructure() {
        let tree = &mut nearest_tree();
        for _ in 0..100 {
            record_dir(tree, upper_right_dir(), 1.0);
        }
        tree.build();
        let total_before = tree.root.previous;
        tree.restructure(THRESHOLD);

        // The hot upper-right child refined one level; the cold three did not.
        let children = tree.root.children.as_ref().unwrap();
        assert!(!children[1].is_leaf());
        assert_eq!(children[1].node_count(), 5);
        assert!(children[0].is_leaf());
        assert!(children[2].is_leaf());
        assert!(children[3].is_leaf());
        assert_eq!(tree.node_count(), 9);

        // Quarter-seeding preserves the root mass.
        assert!((tree.root.previous - total_before).abs() <= total_before * 1e-6);
    }

    #[test]
    fn restructure_preserves_mass_at_zero_threshold() {
        let tree = &mut nearest_tree();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..500 {
            let dir = math::sample_sphere_uniform(crate::sampling::next_vec2(&mut rng));
            record_dir(tree, dir, 0.5 + crate::sampling::next_f32(&mut rng));
        }
        tree.build();
        let total = tree.root.previous;
        assert!(total > 0.0);

        tree.restructure(0.0);
        // Quarter-seeding distributes each refined leaf's mass exactly, so
        // the leaves still sum to the untouched root total.
        fn leaf_mass(node: &DirTreeNode) -> f32 {
            match &node.children {
                None => node.previous,
                Some(children) => children.iter().map(leaf_mass).sum(),
            }
        }
        assert!((leaf_mass(&tree.root) - total).abs() <= total * 1e-5);
        assert!((tree.root.previous - total).abs() <= total * 1e-6);
        // Every non-empty leaf refined exactly one level.
        assert!(tree.max_depth() > 2);
    }

    #[test]
    fn zero_mass_restructure_resets_to_degenerate_root() {
        let tree = &mut nearest_tree();
        for _ in 0..10 {
            record_dir(tree, upper_right_dir(), 1.0);
        }
        tree.build();
        tree.restructure(THRESHOLD);
        assert!(tree.node_count() > 5);

        // Nothing recorded this iteration: the tree resets.
        tree.build();
        tree.restructure(THRESHOLD);
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.pdf(Vec3::Z, ScatteringModes::ALL), RCP_FOUR_PI);
        assert!(tree.is_built());
    }

    #[test]
    fn depth_saturates_at_cap() {
        let tree = &mut nearest_tree();
        for _ in 0..DTREE_MAX_DEPTH + 10 {
            for _ in 0..10 {
                record_dir(tree, upper_right_dir(), 1.0);
            }
            tree.build();
            tree.restructure(THRESHOLD);
        }
        assert!(tree.max_depth() <= DTREE_MAX_DEPTH + 1);
    }

    #[test]
    fn pdf_integrates_to_one_when_peaked() {
        let tree = &mut tree_with(|c| c.directional_filter = DirectionalFilter::Box);
        let mut rng = StdRng::seed_from_u64(3);

        // Two iterations so the topology refines around the peak and the
        // published sums come from real records rather than seeds.
        for _ in 0..2 {
            for _ in 0..1000 {
                record_dir(tree, Vec3::Z, 1.0);
            }
            for _ in 0..200 {
                let dir = math::sample_sphere_uniform(crate::sampling::next_vec2(&mut rng));
                record_dir(tree, dir, 0.05);
            }
            tree.build();
            tree.restructure(THRESHOLD);
            for _ in 0..1000 {
                record_dir(tree, Vec3::Z, 1.0);
            }
            for _ in 0..200 {
                let dir = math::sample_sphere_uniform(crate::sampling::next_vec2(&mut rng));
                record_dir(tree, dir, 0.05);
            }
        }
        tree.build();

        // Exact quadrature: the pdf is piecewise constant on dyadic leaves,
        // so a fine dyadic grid over the cylindrical square integrates it
        // without sampling noise.
        let n = 128;
        let mut integral = 0.0f64;
        for y in 0..n {
            for x in 0..n {
                let uv = Vec2::new(
                    (x as f32 + 0.5) / n as f32,
                    (y as f32 + 0.5) / n as f32,
                );
                integral += tree.pdf(math::cylindrical_to_dir(uv), ScatteringModes::ALL) as f64;
            }
        }
        integral *= crate::math::FOUR_PI as f64 / (n * n) as f64;
        assert!(
            (integral - 1.0).abs() < 0.01,
            "pdf integral {} deviates more than 1%",
            integral
        );

        // Strongly peaked toward the recorded direction.
        assert!(tree.pdf(Vec3::Z, ScatteringModes::ALL) >= 10.0 * RCP_FOUR_PI);
        assert!(tree.pdf(-Vec3::Z, ScatteringModes::ALL) < RCP_FOUR_PI);
    }

    #[test]
    fn concentrated_energy_classifies_glossy() {
        let tree = &mut nearest_tree();
        // Drive the tree three iterations deep around one direction so 99%
        // of the mass ends in a small leaf.
        for _ in 0..3 {
            for _ in 0..100 {
                record_dir(tree, upper_right_dir(), 1.0);
            }
            record_dir(tree, math::cylindrical_to_dir(Vec2::new(0.1, 0.6)), 1.0);
            tree.build();
            tree.restructure(THRESHOLD);
        }
        assert_eq!(tree.scattering_mode(), ScatteringMode::Glossy);
    }

    #[test]
    fn spread_energy_classifies_diffuse() {
        let tree = &mut nearest_tree();
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..3 {
            for _ in 0..2000 {
                let dir = math::sample_sphere_uniform(crate::sampling::next_vec2(&mut rng));
                record_dir(tree, dir, 1.0);
            }
            tree.build();
            tree.restructure(THRESHOLD);
        }
        assert_eq!(tree.scattering_mode(), ScatteringMode::Diffuse);
    }

    #[test]
    fn mode_filter_suppresses_sampling() {
        let tree = nearest_tree();
        let mut rng = StdRng::seed_from_u64(5);
        let sample = tree.sample(&mut rng, ScatteringModes::GLOSSY);
        assert_eq!(sample.scattering_mode, ScatteringMode::None);
        assert_eq!(sample.pdf, 0.0);
        assert_eq!(tree.pdf(Vec3::Z, ScatteringModes::GLOSSY), 0.0);
    }

    #[test]
    fn learned_fraction_decreases_when_guiding_wins() {
        let tree = &mut nearest_tree();
        // Mark the tree as built so the optimizer engages.
        tree.build();
        tree.restructure(THRESHOLD);

        let record = GuidingRecord {
            direction: Vec3::Z,
            radiance: 1.0,
            wi_pdf: 0.55,
            bsdf_pdf: 0.1,
            d_tree_pdf: 1.0,
            product_pdf: 0.0,
            sample_weight: 1.0,
            product: 1.0,
            is_delta: true, // optimizer only; no radiance splat
            guiding_method: GuidingMethod::PathGuiding,
        };

        assert!((tree.bsdf_sampling_fraction() - 0.5).abs() < 1e-6);
        let mut previous = tree.bsdf_sampling_fraction();
        let mut crossed_at = None;
        for i in 0..10_000 {
            tree.record(&record);
            let fraction = tree.bsdf_sampling_fraction();
            if crossed_at.is_none() {
                // Monotone descent until the fraction passes 0.1; after
                // that the regularizer holds it at a small equilibrium.
                assert!(fraction <= previous + 1e-5, "fraction rose at step {}", i);
                if fraction < 0.1 {
                    crossed_at = Some(i);
                }
            }
            previous = fraction;
            if i >= 2000 {
                assert!(fraction < 0.3, "fraction {} not converged at {}", fraction, i);
            }
        }
        assert!(crossed_at.unwrap_or(usize::MAX) < 2000);
    }

    #[test]
    fn dump_layout_round_trips() {
        let tree = &mut nearest_tree();
        for _ in 0..100 {
            record_dir(tree, upper_right_dir(), 1.0);
        }
        tree.build();
        tree.restructure(THRESHOLD);
        record_dir(tree, upper_right_dir(), 1.0);

        let mut bytes = Vec::new();
        tree.write_to(&mut bytes).unwrap();

        let mean = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let weight = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let node_count = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        assert!(mean > 0.0);
        assert_eq!(weight, 1);
        assert_eq!(node_count as usize, tree.node_count() - tree_leaf_count(tree));
        assert_eq!(bytes.len(), 20 + node_count as usize * 4 * 6);

        // Child indices reference interior nodes only and never the root.
        for n in 0..node_count as usize {
            for slot in 0..4 {
                let at = 20 + n * 24 + slot * 6 + 4;
                let child = u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap());
                assert!((child as u64) < node_count);
            }
        }
    }

    fn tree_leaf_count(tree: &DirTree) -> usize {
        fn leaves(node: &DirTreeNode) -> usize {
            match &node.children {
                None => 1,
                Some(children) => children.iter().map(leaves).sum(),
            }
        }
        leaves(&tree.root)
    }
}
