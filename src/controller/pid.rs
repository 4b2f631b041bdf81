//! PID filter for power setpoints
//!
//! Moves a measured power value towards a target one cycle at a time.
//!
//! # Terms
//! - **P**: `p * error` with `error = target - input`
//! - **I**: `i * Σerror` over previous cycles, with anti-windup
//! - **D**: `-d * (input - previous input)`, derivative on measurement so a
//!   target change does not kick the output
//!
//! The output is rounded to whole watts, clamped to the live limits and never
//! crosses the target.

#[derive(Debug, Clone)]
pub struct PidFilter {
    /// Proportional gain
    p: f64,
    /// Integral gain
    i: f64,
    /// Derivative gain
    d: f64,

    first_run: bool,
    /// Input of the previous run for the derivative term
    last_input: i64,
    /// Accumulated error
    error_sum: i64,

    lower_limit: Option<i32>,
    upper_limit: Option<i32>,
}

impl PidFilter {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self {
            p,
            i,
            d,
            first_run: true,
            last_input: 0,
            error_sum: 0,
            lower_limit: None,
            upper_limit: None,
        }
    }

    /// Create a filter with fixed output limits
    pub fn with_limits(p: f64, i: f64, d: f64, lower: i32, upper: i32) -> Self {
        let mut pid = Self::new(p, i, d);
        pid.set_limits(Some(lower), Some(upper));
        pid
    }

    /// Update output limits. An upper limit below the lower one is raised to it.
    pub fn set_limits(&mut self, lower: Option<i32>, upper: Option<i32>) {
        self.lower_limit = lower;
        self.upper_limit = match (lower, upper) {
            (Some(lower), Some(upper)) if upper < lower => Some(lower),
            _ => upper,
        };
    }

    pub fn limits(&self) -> (Option<i32>, Option<i32>) {
        (self.lower_limit, self.upper_limit)
    }

    pub fn set_gains(&mut self, p: f64, i: f64, d: f64) {
        self.p = p;
        self.i = i;
        self.d = d;
    }

    pub fn reset(&mut self) {
        self.first_run = true;
        self.last_input = 0;
        self.error_sum = 0;
    }

    pub fn error_sum(&self) -> i64 {
        self.error_sum
    }

    /// Next output for a measured `input` and the requested `target`.
    pub fn apply(&mut self, input: i32, target: i32) -> i32 {
        let target = self.clamp(target as i64);
        let input = input as i64;
        let error = target - input;
        if error == 0 {
            return target as i32;
        }

        let p_term = self.p * error as f64;

        if self.first_run {
            self.last_input = input;
            self.first_run = false;
        }
        let i_term = self.i * self.error_sum as f64;
        let d_term = -self.d * (input - self.last_input) as f64;
        self.last_input = input;

        self.error_sum = self.limit_error_sum(self.error_sum + error);

        // rounded at single precision, like the setpoint registers it ends up in
        let raw = (p_term + i_term + d_term) as f32;
        let mut output = self.clamp((raw as f64 + 0.5).floor() as i64);

        if input > target && output < target {
            output = target;
        }
        if input < target && output > target {
            output = target;
        }
        output as i32
    }

    fn clamp(&self, value: i64) -> i64 {
        let mut value = value;
        if let Some(lower) = self.lower_limit {
            value = value.max(lower as i64);
        }
        if let Some(upper) = self.upper_limit {
            value = value.min(upper as i64);
        }
        value
    }

    /// Anti-windup: the error sum stays within ten times the limit span.
    fn limit_error_sum(&self, value: i64) -> i64 {
        match (self.lower_limit, self.upper_limit) {
            (Some(lower), Some(upper)) => {
                let limit = ((lower as i64).abs() + (upper as i64).abs()) * 10;
                value.clamp(-limit, limit)
            }
            _ => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_proportional_only() {
        let mut pid = PidFilter::new(0.5, 0.0, 0.0);
        assert_eq!(pid.apply(0, 1000), 500);
        assert_eq!(pid.apply(500, 1000), 250);
    }

    #[test]
    fn test_pid_integral_accumulation() {
        let mut pid = PidFilter::new(0.0, 1.0, 0.0);
        // first run has no accumulated error yet, output is held at the input side
        assert_eq!(pid.apply(0, 100), 0);
        assert_eq!(pid.error_sum(), 100);
        assert_eq!(pid.apply(0, 100), 100);
    }

    #[test]
    fn test_pid_reaches_target_without_error() {
        let mut pid = PidFilter::with_limits(0.3, 0.3, 0.1, -10_000, 10_000);
        assert_eq!(pid.apply(2500, 2500), 2500);
        assert_eq!(pid.error_sum(), 0);
    }

    #[test]
    fn test_pid_output_clamping() {
        let mut pid = PidFilter::with_limits(1.0, 0.0, 0.0, -50, 50);
        assert_eq!(pid.apply(0, 200), 50);
        assert_eq!(pid.apply(0, -200), -50);
    }

    #[test]
    fn test_pid_inverted_limits() {
        let mut pid = PidFilter::with_limits(0.3, 0.3, 0.1, 5, 4);
        assert_eq!(pid.limits(), (Some(5), Some(5)));
        assert_eq!(pid.apply(0, -100_000), 5);
    }

    #[test]
    fn test_pid_integral_windup_protection() {
        let mut pid = PidFilter::with_limits(0.0, 1.0, 0.0, -10, 10);
        for _ in 0..100 {
            let _ = pid.apply(0, 10);
        }
        assert_eq!(pid.error_sum(), 200);
    }

    #[test]
    fn test_pid_never_crosses_target() {
        let mut pid = PidFilter::with_limits(0.3, 0.3, 0.1, -100_000, 100_000);
        assert_eq!(pid.apply(100_000, 0), 0);
    }

    #[test]
    fn test_pid_reset() {
        let mut pid = PidFilter::new(0.3, 0.3, 0.1);
        let _ = pid.apply(0, 1000);
        assert_ne!(pid.error_sum(), 0);
        pid.reset();
        assert_eq!(pid.error_sum(), 0);
    }

    #[test]
    fn test_step_response() {
        let mut pid = PidFilter::with_limits(0.3, 0.3, 0.1, -10_000, 10_000);
        let mut value = 0;
        let mut outputs = Vec::new();
        for _ in 0..9 {
            value = pid.apply(value, 10_000);
            outputs.push(value);
        }
        assert_eq!(outputs, vec![3000, 4800, 6480, 7548, 8345, 8868, 9235, 9481, 9648]);
    }
}
