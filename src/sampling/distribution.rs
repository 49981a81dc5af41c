//! Piecewise-constant discrete distribution over a flat bin array.
//!
//! The radiance proxy flattens its square pixel map into one of these to
//! importance-sample pixels in O(log n).

/// CDF-backed distribution over `n` non-negative weights.
#[derive(Debug, Clone)]
pub struct Distribution1D {
    func: Vec<f32>,
    cdf: Vec<f32>,
    func_int: f32,
}

impl Distribution1D {
    /// Builds the distribution. Non-finite or negative weights are treated
    /// as zero; an all-zero input degenerates to the uniform distribution.
    pub fn new(weights: &[f32]) -> Self {
        assert!(!weights.is_empty());

        let func: Vec<f32> = weights
            .iter()
            .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
            .collect();

        let n = func.len();
        let mut cdf = Vec::with_capacity(n + 1);
        cdf.push(0.0);
        let mut acc = 0.0f32;
        for &f in &func {
            acc += f;
            cdf.push(acc);
        }
        let func_int = acc;

        if func_int > 0.0 {
            for c in cdf.iter_mut() {
                *c /= func_int;
            }
        } else {
            // Degenerate input: fall back to uniform.
            for (i, c) in cdf.iter_mut().enumerate() {
                *c = i as f32 / n as f32;
            }
        }
        *cdf.last_mut().unwrap() = 1.0;

        Self { func, cdf, func_int }
    }

    pub fn count(&self) -> usize {
        self.func.len()
    }

    pub fn integral(&self) -> f32 {
        self.func_int
    }

    /// Draws a bin index; returns `(index, probability)`.
    pub fn sample_discrete(&self, u: f32) -> (usize, f32) {
        let u = u.clamp(0.0, 1.0);
        // cdf[0] is 0.0, so the partition point is always >= 1.
        let index = (self.cdf.partition_point(|&c| c <= u) - 1).min(self.func.len() - 1);
        (index, self.discrete_pdf(index))
    }

    /// Probability of drawing bin `index`.
    pub fn discrete_pdf(&self, index: usize) -> f32 {
        if self.func_int > 0.0 {
            self.func[index] / self.func_int
        } else {
            1.0 / self.func.len() as f32
        }
    }
}
