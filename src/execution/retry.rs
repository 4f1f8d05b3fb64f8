//! Resource Scaling and Retry Policy
//!
//! Each rule declares base resources. Attempt `n` of a task requests
//! `base * n` memory and runtime under linear scaling, or the base values
//! unchanged under constant scaling. Thread counts never scale.
//!
//! ```yaml
//! resources:
//!   mem_mb: 4000
//!   runtime: 120
//!   scaling: linear
//! max_attempts: 3
//! ```

use serde::{Deserialize, Serialize};

/// How memory and runtime grow with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scaling {
    #[default]
    Linear,
    Constant,
}

fn default_mem_mb() -> u64 {
    1024
}

fn default_runtime() -> u64 {
    60
}

/// Base resources of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory in megabytes for the first attempt
    #[serde(default = "default_mem_mb")]
    pub mem_mb: u64,

    /// Runtime in minutes for the first attempt
    #[serde(default = "default_runtime")]
    pub runtime: u64,

    #[serde(default)]
    pub scaling: Scaling,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            mem_mb: default_mem_mb(),
            runtime: default_runtime(),
            scaling: Scaling::default(),
        }
    }
}

impl ResourceSpec {
    pub fn new(mem_mb: u64, runtime: u64) -> Self {
        Self {
            mem_mb,
            runtime,
            scaling: Scaling::Linear,
        }
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// Computes the request of one attempt. Attempts are numbered from 1;
    /// attempt 0 is treated as 1.
    ///
    /// # Example
    ///
    /// ```
    /// use seqflow::execution::retry::ResourceSpec;
    ///
    /// let spec = ResourceSpec::new(2000, 30);
    /// let third = spec.resources(3, 4);
    /// assert_eq!(third.mem_mb, 6000);
    /// assert_eq!(third.runtime, 90);
    /// assert_eq!(third.threads, 4);
    /// ```
    pub fn resources(&self, attempt: u32, threads: usize) -> Resources {
        let factor = match self.scaling {
            Scaling::Linear => u64::from(attempt.max(1)),
            Scaling::Constant => 1,
        };
        Resources {
            mem_mb: self.mem_mb.saturating_mul(factor),
            runtime: self.runtime.saturating_mul(factor),
            threads,
        }
    }
}

/// Resources requested by one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub mem_mb: u64,
    /// Minutes. Passed to actions; the engine does not enforce it.
    pub runtime: u64,
    pub threads: usize,
}

/// Decides whether a failed attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Policy of a rule: its own override, else the run-wide default.
    pub fn for_rule(rule_max_attempts: Option<u32>, default_max_attempts: u32) -> Self {
        Self::new(rule_max_attempts.unwrap_or(default_max_attempts))
    }

    /// True if a task whose `attempt` just failed gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_scaling() {
        let spec = ResourceSpec::new(1000, 10);
        let requests: Vec<u64> = (1..=3).map(|a| spec.resources(a, 2).mem_mb).collect();
        assert_eq!(requests, vec![1000, 2000, 3000]);
        assert_eq!(spec.resources(2, 2).runtime, 20);
    }

    #[test]
    fn test_constant_scaling() {
        let spec = ResourceSpec::new(1000, 10).with_scaling(Scaling::Constant);
        assert_eq!(spec.resources(1, 1), spec.resources(5, 1));
    }

    #[test]
    fn test_threads_do_not_scale() {
        let spec = ResourceSpec::default();
        assert_eq!(spec.resources(1, 8).threads, 8);
        assert_eq!(spec.resources(4, 8).threads, 8);
    }

    #[test]
    fn test_attempt_zero_is_first_attempt() {
        let spec = ResourceSpec::new(500, 5);
        assert_eq!(spec.resources(0, 1), spec.resources(1, 1));
    }

    #[test]
    fn test_deserialize_defaults() {
        let spec: ResourceSpec = serde_yaml::from_str("mem_mb: 2048").unwrap();
        assert_eq!(spec.mem_mb, 2048);
        assert_eq!(spec.runtime, 60);
        assert_eq!(spec.scaling, Scaling::Linear);

        let constant: ResourceSpec = serde_yaml::from_str("scaling: constant").unwrap();
        assert_eq!(constant.scaling, Scaling::Constant);
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::for_rule(Some(5), 2).max_attempts, 5);
        assert_eq!(RetryPolicy::for_rule(None, 2).max_attempts, 2);
    }
}
