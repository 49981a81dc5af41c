//! Pass and iteration control.
//!
//! Doubles the per-iteration pass count, triggers the SD-tree rebuild
//! between iterations, watches the extrapolated variance to pick the final
//! iteration, and optionally combines iterations weighted by inverse
//! variance.

pub mod film;

pub use film::{Image, VarianceFilm};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec3;

use crate::config::{GuidingConfig, IterationProgression};
use crate::guiding::SpatTree;

/// Iterations retained for inverse-variance combination.
pub const IMAGE_BUFFER_CAPACITY: usize = 4;

/// Renderer-wide samples threshold below which the variance trend is noise.
const MIN_SAMPLES_FOR_EXTRAPOLATION: usize = 256;

/// Cooperative cancellation flag, cloneable across workers.
#[derive(Debug, Clone, Default)]
pub struct AbortSwitch(Arc<AtomicBool>);

impl AbortSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives the guiding iterations across render passes.
pub struct PassController {
    samples_per_pass: usize,
    progression: IterationProgression,
    max_passes: usize,
    remaining_passes: usize,
    passes_rendered: usize,
    passes_left_curr_iter: usize,
    num_passes_curr_iter: usize,
    iteration: usize,
    last_extrapolated_variance: f32,
    is_final_iteration: bool,
    variance_is_increasing: bool,
    image_buffer: VecDeque<(Image, f32)>,
}

impl PassController {
    pub fn new(config: &GuidingConfig) -> Self {
        let max_passes = (config.sample_budget / config.samples_per_pass)
            .min(config.max_passes)
            .max(1);

        Self {
            samples_per_pass: config.samples_per_pass,
            progression: config.iteration_progression,
            max_passes,
            remaining_passes: max_passes,
            passes_rendered: 0,
            passes_left_curr_iter: 0,
            num_passes_curr_iter: 0,
            iteration: 0,
            last_extrapolated_variance: f32::INFINITY,
            is_final_iteration: false,
            variance_is_increasing: false,
            image_buffer: VecDeque::with_capacity(IMAGE_BUFFER_CAPACITY),
        }
    }

    pub fn max_passes(&self) -> usize {
        self.max_passes
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn is_final_iteration(&self) -> bool {
        self.is_final_iteration
    }

    /// Starts a new iteration when the previous one has used up its passes:
    /// doubles the pass budget, folds a too-small tail into the final
    /// iteration, and rebuilds the SD-tree unless learning has stopped.
    pub fn on_pass_begin(&mut self, sd_tree: &mut SpatTree, film: &mut VarianceFilm) {
        if self.passes_left_curr_iter > 0 {
            return;
        }

        self.num_passes_curr_iter = (1usize << self.iteration).min(self.remaining_passes);
        self.passes_left_curr_iter = self.num_passes_curr_iter;

        if self.is_final_iteration
            || self.remaining_passes - self.passes_left_curr_iter < 2 * self.passes_left_curr_iter
        {
            // The tail would be smaller than the next doubling; spend it all
            // in this, final, iteration.
            self.passes_left_curr_iter = self.remaining_passes;
            self.num_passes_curr_iter = self.remaining_passes;
            self.is_final_iteration = true;
            sd_tree.start_final_iteration();
        }

        if !self.variance_is_increasing && self.iteration > 0 {
            film.clear();
            sd_tree.build(self.iteration);
        }

        self.iteration += 1;
    }

    /// Books one finished pass. Returns `true` when rendering is done
    /// (budget exhausted or aborted); the caller then tears down and, in
    /// combine mode, fetches the merged image via
    /// [`Self::combine_iterations`].
    pub fn on_pass_end(
        &mut self,
        film: &VarianceFilm,
        image: &Image,
        abort: &AbortSwitch,
    ) -> bool {
        self.passes_rendered += 1;
        self.passes_left_curr_iter -= 1;
        self.remaining_passes -= 1;

        if self.passes_rendered >= self.max_passes || abort.is_aborted() {
            let variance = film.estimator_variance();
            log::info!("final iteration variance estimate: {:.7}", variance);

            if self.progression == IterationProgression::Combine {
                self.buffer_image(image.clone(), 1.0 / variance);
            }
            return true;
        }

        if self.passes_left_curr_iter == 0 {
            let remaining_at_iter_start = self.remaining_passes + self.num_passes_curr_iter;
            let samples_rendered = self.passes_rendered * self.samples_per_pass;
            let variance = film.estimator_variance();
            let extrapolated_variance =
                variance * self.num_passes_curr_iter as f32 / remaining_at_iter_start as f32;

            log::info!(
                "iteration {} variance: {:.7}, extrapolated: {:.7} (previous {:.7})",
                self.iteration,
                variance,
                extrapolated_variance,
                self.last_extrapolated_variance,
            );

            if self.progression == IterationProgression::Automatic
                && samples_rendered > MIN_SAMPLES_FOR_EXTRAPOLATION
                && extrapolated_variance > self.last_extrapolated_variance
            {
                log::info!("extrapolated variance is increasing, initiating final iteration");
                self.variance_is_increasing = true;
                self.is_final_iteration = true;
            }
            self.last_extrapolated_variance = extrapolated_variance;

            if self.progression == IterationProgression::Combine {
                self.buffer_image(image.clone(), 1.0 / variance);
            }
        }

        false
    }

    fn buffer_image(&mut self, image: Image, inverse_variance: f32) {
        if self.image_buffer.len() == IMAGE_BUFFER_CAPACITY {
            self.image_buffer.pop_front();
        }
        self.image_buffer.push_back((image, inverse_variance));
    }

    /// Inverse-variance weighted average of the buffered iterations.
    /// `None` unless at least one iteration was buffered.
    pub fn combine_iterations(&self) -> Option<Image> {
        let (first, _) = self.image_buffer.front()?;
        let total_inverse_variance: f32 =
            self.image_buffer.iter().map(|(_, inv)| inv).sum();
        if total_inverse_variance <= 0.0 {
            return None;
        }

        let mut combined = Image::new(first.width(), first.height());
        for y in 0..combined.height() {
            for x in 0..combined.width() {
                let mut color = Vec3::ZERO;
                for (image, inverse_variance) in &self.image_buffer {
                    color += image.pixel(x, y) * (inverse_variance / total_inverse_variance);
                }
                combined.set_pixel(x, y, color);
            }
        }
        Some(combined)
    }
}
