//! Numeric kernels behind the aggregation pass.
//!
//! Sample statistics use `n - 1` degrees of freedom. Percentiles use the
//! nearest-rank rule on sorted samples. Student's t distribution is evaluated
//! through the regularized incomplete beta function.

use thiserror::Error;

/// Statistics-level failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatsError {
    /// Fewer samples than the estimator needs.
    #[error("insufficient sample: need at least {needed}, got {got}")]
    InsufficientSample {
        /// Minimum sample count.
        needed: usize,
        /// Samples available.
        got: usize,
    },
    /// A probability outside the open unit interval.
    #[error("probability {0} outside (0, 1)")]
    InvalidProbability(f64),
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Sample variance with `n - 1` in the denominator.
pub fn variance(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let m = mean(samples)?;
    let ss: f64 = samples.iter().map(|x| (x - m) * (x - m)).sum();
    Some(ss / (samples.len() - 1) as f64)
}

/// Sample standard deviation with `n - 1` in the denominator.
pub fn std_dev(samples: &[f64]) -> Option<f64> {
    variance(samples).map(f64::sqrt)
}

/// Nearest-rank percentile over an ascending slice.
///
/// The 1-based rank is `ceil(q * N)` clamped to `[1, N]`. A tiny epsilon
/// absorbs products such as `0.29 * 100` that land just above an integer.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (q * n as f64 - 1e-9).ceil();
    let rank = if rank.is_nan() { 1 } else { (rank as usize).clamp(1, n) };
    Some(sorted[rank - 1])
}

/// Sorts a copy of the samples ascending.
pub fn sorted(samples: &[f64]) -> Vec<f64> {
    let mut out = samples.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

/// Two-sided confidence interval around a sample mean.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceInterval {
    /// Point estimate.
    pub mean: f64,
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

/// Student-t confidence interval for the mean at the given confidence level.
pub fn confidence_interval(
    samples: &[f64],
    confidence: f64,
) -> Result<ConfidenceInterval, StatsError> {
    if samples.len() < 2 {
        return Err(StatsError::InsufficientSample {
            needed: 2,
            got: samples.len(),
        });
    }
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(StatsError::InvalidProbability(confidence));
    }
    let n = samples.len() as f64;
    let (Some(m), Some(s)) = (mean(samples), std_dev(samples)) else {
        return Err(StatsError::InsufficientSample {
            needed: 2,
            got: samples.len(),
        });
    };
    let t = StudentT::new(n - 1.0).quantile(1.0 - (1.0 - confidence) / 2.0)?;
    let half = t * s / n.sqrt();
    Ok(ConfidenceInterval {
        mean: m,
        lower: m - half,
        upper: m + half,
    })
}

/// Outcome of Welch's unequal-variance t-test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WelchTest {
    /// t statistic of `a` against `b`.
    pub statistic: f64,
    /// Welch–Satterthwaite degrees of freedom.
    pub df: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

/// Welch's t-test between two independent samples.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Result<WelchTest, StatsError> {
    let got = a.len().min(b.len());
    let insufficient = StatsError::InsufficientSample { needed: 2, got };
    let (Some(mean_a), Some(var_a)) = (mean(a), variance(a)) else {
        return Err(insufficient);
    };
    let (Some(mean_b), Some(var_b)) = (mean(b), variance(b)) else {
        return Err(insufficient);
    };
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let va = var_a / na;
    let vb = var_b / nb;
    let pooled = va + vb;
    let diff = mean_a - mean_b;

    if pooled == 0.0 {
        let (statistic, p_value) = if diff == 0.0 {
            (0.0, 1.0)
        } else {
            (diff.signum() * f64::INFINITY, 0.0)
        };
        return Ok(WelchTest {
            statistic,
            df: na + nb - 2.0,
            p_value,
        });
    }

    let statistic = diff / pooled.sqrt();
    let df = pooled * pooled / (va * va / (na - 1.0) + vb * vb / (nb - 1.0));
    let p_value = StudentT::new(df).two_sided(statistic);
    Ok(WelchTest {
        statistic,
        df,
        p_value,
    })
}

/// Student's t distribution with `df` degrees of freedom.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StudentT {
    df: f64,
}

impl StudentT {
    /// Distribution with the given (positive) degrees of freedom.
    pub fn new(df: f64) -> Self {
        Self { df }
    }

    /// Cumulative distribution function.
    pub fn cdf(&self, t: f64) -> f64 {
        if t.is_nan() {
            return f64::NAN;
        }
        if t.is_infinite() {
            return if t > 0.0 { 1.0 } else { 0.0 };
        }
        let tail = 0.5 * self.tail_mass(t);
        if t > 0.0 {
            1.0 - tail
        } else {
            tail
        }
    }

    /// Two-sided p-value `P(|T| >= |t|)`.
    pub fn two_sided(&self, t: f64) -> f64 {
        if t.is_infinite() {
            return 0.0;
        }
        self.tail_mass(t).clamp(0.0, 1.0)
    }

    /// Inverse CDF found by bisection.
    pub fn quantile(&self, p: f64) -> Result<f64, StatsError> {
        if !(p > 0.0 && p < 1.0) {
            return Err(StatsError::InvalidProbability(p));
        }
        if p < 0.5 {
            return self.quantile(1.0 - p).map(|t| -t);
        }
        let mut lo = 0.0;
        let mut hi = 1.0;
        while self.cdf(hi) < p && hi < 1e12 {
            lo = hi;
            hi *= 2.0;
        }
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if self.cdf(mid) < p {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= f64::EPSILON * hi {
                break;
            }
        }
        Ok(0.5 * (lo + hi))
    }

    // I_x(df/2, 1/2) with x = df / (df + t^2): the mass of both tails.
    fn tail_mass(&self, t: f64) -> f64 {
        let x = self.df / (self.df + t * t);
        regularized_incomplete_beta(x, 0.5 * self.df, 0.5)
    }
}

fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

// Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 500;
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEFFS[0];
    for (i, coeff) in COEFFS.iter().enumerate().skip(1) {
        acc += coeff / (x + i as f64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}
