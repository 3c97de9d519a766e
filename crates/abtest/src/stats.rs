//! Statistical primitives for winner selection: two-proportion z-test,
//! Welch's t-test for revenue means, and Wilson score intervals.

/// Result of a pairwise hypothesis test.
#[derive(Debug, Clone, Copy)]
pub struct TestResult {
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sided two-proportion z-test with pooled variance.
/// Returns `None` when either sample is empty or the pooled proportion is
/// degenerate (all successes or all failures), where no difference can be
/// attested.
pub fn two_proportion_z(
    successes_a: u64,
    total_a: u64,
    successes_b: u64,
    total_b: u64,
) -> Option<TestResult> {
    if total_a == 0 || total_b == 0 {
        return None;
    }
    let p_a = successes_a as f64 / total_a as f64;
    let p_b = successes_b as f64 / total_b as f64;
    let pooled = (successes_a + successes_b) as f64 / (total_a + total_b) as f64;
    if pooled <= 0.0 || pooled >= 1.0 {
        return None;
    }
    let se = (pooled * (1.0 - pooled) * (1.0 / total_a as f64 + 1.0 / total_b as f64)).sqrt();
    let z = (p_a - p_b) / se;
    Some(TestResult {
        statistic: z,
        p_value: two_sided_p(z),
    })
}

/// Welch's t-test on two means with unequal variances. The p-value uses
/// the normal approximation, which is adequate at the sample sizes gating
/// requires (`min_sample_size` is enforced before a winner is declared).
pub fn welch_t(
    mean_a: f64,
    var_a: f64,
    n_a: u64,
    mean_b: f64,
    var_b: f64,
    n_b: u64,
) -> Option<TestResult> {
    if n_a < 2 || n_b < 2 {
        return None;
    }
    let se_sq = var_a / n_a as f64 + var_b / n_b as f64;
    if se_sq <= 0.0 {
        return None;
    }
    let t = (mean_a - mean_b) / se_sq.sqrt();
    Some(TestResult {
        statistic: t,
        p_value: two_sided_p(t),
    })
}

/// Wilson score interval for a binomial proportion, as (lower, upper).
/// Better behaved than the normal approximation at small samples.
pub fn wilson_interval(successes: u64, total: u64, z: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }
    let n = total as f64;
    let rate = successes as f64 / n;
    let z_sq = z * z;
    let denominator = 1.0 + z_sq / n;
    let centre = (rate + z_sq / (2.0 * n)) / denominator;
    let margin =
        (z / denominator) * ((rate * (1.0 - rate)) / n + z_sq / (4.0 * n * n)).sqrt();
    ((centre - margin).max(0.0), (centre + margin).min(1.0))
}

/// Critical z for a two-sided confidence level in (0, 1). Levels outside
/// the table fall back to the 95% critical value (1.960); the fallback
/// only affects interval widths, never significance, which is decided
/// directly on the p-value.
pub fn z_for_confidence(level: f64) -> f64 {
    const TABLE: &[(f64, f64)] = &[
        (0.80, 1.282),
        (0.85, 1.440),
        (0.90, 1.645),
        (0.95, 1.960),
        (0.99, 2.576),
        (0.999, 3.291),
    ];
    TABLE
        .iter()
        .find(|(l, _)| (level - l).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or(1.960)
}

fn two_sided_p(statistic: f64) -> f64 {
    2.0 * (1.0 - normal_cdf(statistic.abs()))
}

/// Standard normal CDF via the Abramowitz & Stegun 7.1.26 erf
/// approximation (max error ~1.5e-7).
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
