//! Comparative statistics over two sample groups.
//!
//! All tests take the instrumented group first and the plain group second.
//! Swapping the groups flips the sign of `t` and `d` and changes nothing else.

use serde::{Deserialize, Serialize};

/// Significance level for every test.
pub const ALPHA: f64 = 0.05;

/// Smallest group size any test accepts.
pub const MIN_SAMPLES: usize = 2;

/// Result of a statistical test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StatOutcome<T> {
    Computed(T),
    /// Fewer than [`MIN_SAMPLES`] values in a group.
    InsufficientData,
    /// Degenerate input, such as zero variance everywhere.
    CannotCompute,
}

impl<T> StatOutcome<T> {
    pub fn computed(&self) -> Option<&T> {
        match self {
            Self::Computed(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TTest {
    pub t: f64,
    pub df: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Magnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

impl Magnitude {
    pub fn of(d: f64) -> Self {
        match d.abs() {
            x if x < 0.2 => Self::Negligible,
            x if x < 0.5 => Self::Small,
            x if x < 0.8 => Self::Medium,
            _ => Self::Large,
        }
    }
}

impl std::fmt::Display for Magnitude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negligible => write!(f, "negligible"),
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectSize {
    pub d: f64,
    pub magnitude: Magnitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FTest {
    /// Larger variance over smaller; infinite when only the smaller is zero.
    pub f: f64,
    pub df1: f64,
    pub df2: f64,
    pub p_value: f64,
    pub significant: bool,
}

/// Descriptive statistics of one group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation; zero for a single value.
    pub stdev: f64,
}

impl Summary {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
        Some(Self {
            count: n,
            min: sorted[0],
            max: sorted[n - 1],
            mean: mean(values),
            median,
            stdev: if n > 1 { variance(values).sqrt() } else { 0.0 },
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator).
fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0)
}

/// Welch's unequal-variance t-test, two-sided.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> StatOutcome<TTest> {
    if a.len() < MIN_SAMPLES || b.len() < MIN_SAMPLES {
        return StatOutcome::InsufficientData;
    }
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let (v1, v2) = (variance(a), variance(b));
    if v1 == 0.0 && v2 == 0.0 {
        return StatOutcome::CannotCompute;
    }

    let (s1, s2) = (v1 / n1, v2 / n2);
    let t = (mean(a) - mean(b)) / (s1 + s2).sqrt();
    let df = (s1 + s2).powi(2) / (s1.powi(2) / (n1 - 1.0) + s2.powi(2) / (n2 - 1.0));
    let p_value = student_t_two_sided_p(t, df);
    StatOutcome::Computed(TTest {
        t,
        df,
        p_value,
        significant: p_value < ALPHA,
    })
}

/// Cohen's d with the (n - 1)-weighted pooled standard deviation.
pub fn cohens_d(a: &[f64], b: &[f64]) -> StatOutcome<EffectSize> {
    if a.len() < MIN_SAMPLES || b.len() < MIN_SAMPLES {
        return StatOutcome::InsufficientData;
    }
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let pooled = (((n1 - 1.0) * variance(a) + (n2 - 1.0) * variance(b)) / (n1 + n2 - 2.0)).sqrt();
    if pooled == 0.0 {
        return StatOutcome::CannotCompute;
    }
    let d = (mean(a) - mean(b)) / pooled;
    StatOutcome::Computed(EffectSize {
        d,
        magnitude: Magnitude::of(d),
    })
}

/// Two-sided F-test for equal variances.
pub fn f_test(a: &[f64], b: &[f64]) -> StatOutcome<FTest> {
    if a.len() < MIN_SAMPLES || b.len() < MIN_SAMPLES {
        return StatOutcome::InsufficientData;
    }
    let (va, vb) = (variance(a), variance(b));
    if va == 0.0 && vb == 0.0 {
        return StatOutcome::CannotCompute;
    }

    let ((large, n_large), (small, n_small)) = if va >= vb {
        ((va, a.len()), (vb, b.len()))
    } else {
        ((vb, b.len()), (va, a.len()))
    };
    let df1 = n_large as f64 - 1.0;
    let df2 = n_small as f64 - 1.0;

    if small == 0.0 {
        return StatOutcome::Computed(FTest {
            f: f64::INFINITY,
            df1,
            df2,
            p_value: 0.0,
            significant: true,
        });
    }

    let f = large / small;
    let p_value = (2.0 * (1.0 - f_cdf(f, df1, df2))).clamp(0.0, 1.0);
    StatOutcome::Computed(FTest {
        f,
        df1,
        df2,
        p_value,
        significant: p_value < ALPHA,
    })
}

/// Two-sided p-value of Student's t distribution.
fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    regularized_incomplete_beta(df / (df + t * t), df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// CDF of the F distribution.
fn f_cdf(f: f64, df1: f64, df2: f64) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    let x = df1 * f / (df1 * f + df2);
    regularized_incomplete_beta(x, df1 / 2.0, df2 / 2.0)
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
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
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut sum = COEFFS[0];
    for (i, c) in COEFFS.iter().enumerate().skip(1) {
        sum += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized incomplete beta function I_x(a, b).
pub fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    // The continued fraction converges quickly only on this side.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Lentz's method for the incomplete beta continued fraction.
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c: f64 = 1.0;
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

/// Human-readable duration from nanoseconds, e.g. `1s, 500ms`.
pub fn format_duration(nanoseconds: f64) -> String {
    if !nanoseconds.is_finite() {
        return nanoseconds.to_string();
    }
    let sign = if nanoseconds < 0.0 { "-" } else { "" };
    let ns = nanoseconds.abs() as u128;
    let seconds = ns / 1_000_000_000;
    let millis = (ns % 1_000_000_000) / 1_000_000;
    let micros = (ns % 1_000_000) / 1_000;
    let rest = ns % 1_000;

    let mut parts = Vec::new();
    if seconds > 0 {
        parts.push(format!("{seconds}s"));
    }
    if millis > 0 {
        parts.push(format!("{millis}ms"));
    }
    if micros > 0 {
        parts.push(format!("{micros}µs"));
    }
    if rest > 0 || parts.is_empty() {
        parts.push(format!("{rest}ns"));
    }
    format!("{sign}{}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    // -------------------------------------------------------------------------
    // Special functions
    // -------------------------------------------------------------------------

    #[test]
    fn test_ln_gamma_known_values() {
        assert!(close(ln_gamma(1.0), 0.0, 1e-12));
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-10));
        assert!(close(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), 1e-10));
    }

    #[test]
    fn test_incomplete_beta_known_values() {
        // I_x(1, 1) = x
        assert!(close(regularized_incomplete_beta(0.3, 1.0, 1.0), 0.3, 1e-10));
        // I_0.5(a, a) = 0.5
        assert!(close(regularized_incomplete_beta(0.5, 4.5, 4.5), 0.5, 1e-10));
        assert_eq!(regularized_incomplete_beta(0.0, 2.0, 3.0), 0.0);
        assert_eq!(regularized_incomplete_beta(1.0, 2.0, 3.0), 1.0);
    }

    #[test]
    fn test_student_t_reference_p_value() {
        // t = 2.228 with 10 df is the 0.975 quantile.
        assert!(close(student_t_two_sided_p(2.228, 10.0), 0.05, 1e-3));
    }

    // -------------------------------------------------------------------------
    // Tests on samples
    // -------------------------------------------------------------------------

    #[test]
    fn test_identical_samples() {
        let a = [10.0, 12.0, 11.0, 13.0, 9.0];
        let t = *welch_t_test(&a, &a).computed().unwrap();
        assert!(close(t.t, 0.0, 1e-12));
        assert!(t.p_value > 0.9);
        assert!(!t.significant);

        let d = *cohens_d(&a, &a).computed().unwrap();
        assert!(close(d.d, 0.0, 1e-12));
        assert_eq!(d.magnitude, Magnitude::Negligible);

        let f = *f_test(&a, &a).computed().unwrap();
        assert!(close(f.f, 1.0, 1e-12));
        assert!(f.p_value > 0.9);
    }

    #[test]
    fn test_large_consistent_gap() {
        let a = [200.0, 201.0, 199.0, 202.0, 198.0, 200.5];
        let b = [100.0, 101.0, 99.0, 102.0, 98.0, 100.5];
        let t = *welch_t_test(&a, &b).computed().unwrap();
        assert!(t.t > 10.0);
        assert!(t.p_value < 0.05);
        assert!(t.significant);

        let d = *cohens_d(&a, &b).computed().unwrap();
        assert!(d.d >= 0.8);
        assert_eq!(d.magnitude, Magnitude::Large);
    }

    #[test]
    fn test_insufficient_data() {
        assert_eq!(welch_t_test(&[1.0], &[1.0, 2.0]), StatOutcome::InsufficientData);
        assert_eq!(cohens_d(&[1.0, 2.0], &[]), StatOutcome::InsufficientData);
        assert_eq!(f_test(&[], &[]), StatOutcome::InsufficientData);
    }

    #[test]
    fn test_zero_variance_cases() {
        let flat = [5.0, 5.0, 5.0];
        let other = [5.0, 5.0];
        assert_eq!(welch_t_test(&flat, &other), StatOutcome::CannotCompute);
        assert_eq!(cohens_d(&flat, &other), StatOutcome::CannotCompute);
        assert_eq!(f_test(&flat, &other), StatOutcome::CannotCompute);

        let spread = [1.0, 2.0, 3.0];
        let f = *f_test(&spread, &flat).computed().unwrap();
        assert!(f.f.is_infinite());
        assert_eq!(f.p_value, 0.0);
        assert!(f.significant);
    }

    #[test]
    fn test_magnitude_buckets() {
        assert_eq!(Magnitude::of(0.19), Magnitude::Negligible);
        assert_eq!(Magnitude::of(-0.2), Magnitude::Small);
        assert_eq!(Magnitude::of(0.5), Magnitude::Medium);
        assert_eq!(Magnitude::of(-0.8), Magnitude::Large);
    }

    #[test]
    fn test_summary() {
        let s = Summary::of(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.count, 4);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.median, 2.5);
        assert!(close(s.mean, 2.5, 1e-12));
        assert!(close(s.stdev, (5.0f64 / 3.0).sqrt(), 1e-12));
        assert_eq!(Summary::of(&[7.0]).unwrap().stdev, 0.0);
        assert!(Summary::of(&[]).is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1_500_000_000.0), "1s, 500ms");
        assert_eq!(format_duration(2_003_004.0), "2ms, 3µs, 4ns");
        assert_eq!(format_duration(0.0), "0ns");
        assert_eq!(format_duration(-1_000_000.0), "-1ms");
    }

    fn group() -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(1.0f64..1000.0, 2..30)
    }

    proptest! {
        #[test]
        fn prop_swapping_groups_flips_only_sign(a in group(), b in group()) {
            if let (StatOutcome::Computed(ab), StatOutcome::Computed(ba)) =
                (welch_t_test(&a, &b), welch_t_test(&b, &a))
            {
                prop_assert!(close(ab.t, -ba.t, 1e-9));
                prop_assert!(close(ab.p_value, ba.p_value, 1e-9));
                prop_assert!(close(ab.df, ba.df, 1e-9));
            }
            if let (StatOutcome::Computed(ab), StatOutcome::Computed(ba)) =
                (cohens_d(&a, &b), cohens_d(&b, &a))
            {
                prop_assert!(close(ab.d, -ba.d, 1e-9));
                prop_assert_eq!(ab.magnitude, ba.magnitude);
            }
            prop_assert_eq!(f_test(&a, &b), f_test(&b, &a));
        }

        #[test]
        fn prop_p_values_in_unit_interval(a in group(), b in group()) {
            if let StatOutcome::Computed(t) = welch_t_test(&a, &b) {
                prop_assert!((0.0..=1.0).contains(&t.p_value));
            }
            if let StatOutcome::Computed(f) = f_test(&a, &b) {
                prop_assert!((0.0..=1.0).contains(&f.p_value));
                prop_assert!(f.f >= 1.0);
            }
        }
    }
}
