//! Online ADAM optimizer for the BSDF-vs-guided mixing weights.
//!
//! Each directional tree learns its mixing parameters in logit space: a
//! scalar theta for the two-way BSDF/guided mix and a 2-vector for the
//! three-way BSDF/guided/product mix. The same stepping code serves both
//! through a small parameter abstraction.

use glam::Vec2;

const BETA_1: f32 = 0.9;
const BETA_2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

/// L2 pull of theta toward zero (a 0.5 sampling fraction).
pub const REGULARIZATION: f32 = 0.01;

const THETA_MIN: f32 = -20.0;
const THETA_MAX: f32 = 20.0;

pub fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Component-wise arithmetic shared by the scalar and 2-vector parameters.
pub trait Parameter: Copy {
    const ZERO: Self;

    fn scaled(self, s: f32) -> Self;
    fn plus(self, other: Self) -> Self;
    fn times(self, other: Self) -> Self;
    fn over(self, other: Self) -> Self;
    fn sqrt(self) -> Self;
    fn plus_scalar(self, s: f32) -> Self;
    fn clamped(self, lo: f32, hi: f32) -> Self;
}

impl Parameter for f32 {
    const ZERO: Self = 0.0;

    fn scaled(self, s: f32) -> Self {
        self * s
    }

    fn plus(self, other: Self) -> Self {
        self + other
    }

    fn times(self, other: Self) -> Self {
        self * other
    }

    fn over(self, other: Self) -> Self {
        self / other
    }

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    fn plus_scalar(self, s: f32) -> Self {
        self + s
    }

    fn clamped(self, lo: f32, hi: f32) -> Self {
        self.clamp(lo, hi)
    }
}

impl Parameter for Vec2 {
    const ZERO: Self = Vec2::ZERO;

    fn scaled(self, s: f32) -> Self {
        self * s
    }

    fn plus(self, other: Self) -> Self {
        self + other
    }

    fn times(self, other: Self) -> Self {
        self * other
    }

    fn over(self, other: Self) -> Self {
        self / other
    }

    fn sqrt(self) -> Self {
        Vec2::new(self.x.sqrt(), self.y.sqrt())
    }

    fn plus_scalar(self, s: f32) -> Self {
        self + Vec2::splat(s)
    }

    fn clamped(self, lo: f32, hi: f32) -> Self {
        self.clamp(Vec2::splat(lo), Vec2::splat(hi))
    }
}

/// ADAM state for one mixing parameter.
#[derive(Debug, Clone)]
pub struct Adam<T: Parameter> {
    learning_rate: f32,
    step_count: u32,
    first_moment: T,
    second_moment: T,
    theta: T,
}

impl<T: Parameter> Adam<T> {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            step_count: 0,
            first_moment: T::ZERO,
            second_moment: T::ZERO,
            theta: T::ZERO,
        }
    }

    pub fn theta(&self) -> T {
        self.theta
    }

    /// One de-biased ADAM step. Theta stays clamped to `[-20, 20]` so the
    /// logistic never saturates to an exact 0 or 1.
    pub fn step(&mut self, gradient: T) {
        self.step_count += 1;
        let t = self.step_count as f32;
        let debiased_learning_rate =
            self.learning_rate * (1.0 - BETA_2.powf(t)).sqrt() / (1.0 - BETA_1.powf(t));

        self.first_moment = self
            .first_moment
            .scaled(BETA_1)
            .plus(gradient.scaled(1.0 - BETA_1));
        self.second_moment = self
            .second_moment
            .scaled(BETA_2)
            .plus(gradient.times(gradient).scaled(1.0 - BETA_2));

        let update = self
            .first_moment
            .over(self.second_moment.sqrt().plus_scalar(EPSILON))
            .scaled(debiased_learning_rate);
        self.theta = self.theta.plus(update.scaled(-1.0)).clamped(THETA_MIN, THETA_MAX);
    }

    pub fn reset(&mut self) {
        self.step_count = 0;
        self.first_moment = T::ZERO;
        self.second_moment = T::ZERO;
        self.theta = T::ZERO;
    }
}
