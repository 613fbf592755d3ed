//! Thread-safe accounting of iterations, tokens, cost, and elapsed time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetUsage {
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Zero in any field means that dimension is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetLimits {
    pub max_iterations: u32,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub max_cost: f64,
    pub max_elapsed: Option<Duration>,
}

struct Inner {
    usage: BudgetUsage,
    limits: BudgetLimits,
    started_at: Instant,
}

/// Shared budget accounting, safe under concurrent access from many engines.
#[derive(Clone)]
pub struct BudgetTracker {
    inner: Arc<Mutex<Inner>>,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                usage: BudgetUsage::default(),
                limits,
                started_at: Instant::now(),
            })),
        }
    }

    /// Increments the iteration counter and adds token/cost usage.
    pub fn add(&self, tokens_in: u64, tokens_out: u64, cost: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.usage.iterations += 1;
        inner.usage.input_tokens += tokens_in;
        inner.usage.output_tokens += tokens_out;
        inner.usage.cost += cost;
    }

    /// Increments only the iteration counter (e.g. for a no-op iteration).
    pub fn add_iteration(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.usage.iterations += 1;
    }

    pub fn usage(&self) -> BudgetUsage {
        self.inner.lock().unwrap().usage
    }

    pub fn limits(&self) -> BudgetLimits {
        self.inner.lock().unwrap().limits
    }

    /// `-1` for a disabled dimension, `0` (never negative) for an exhausted one.
    pub fn remaining(&self) -> BudgetRemaining {
        let inner = self.inner.lock().unwrap();
        let remaining_of = |limit: u64, used: u64| -> i64 {
            if limit == 0 {
                -1
            } else {
                (limit as i64 - used as i64).max(0)
            }
        };

        let remaining_cost = if inner.limits.max_cost <= 0.0 {
            -1.0
        } else {
            (inner.limits.max_cost - inner.usage.cost).max(0.0)
        };

        let remaining_elapsed = inner.limits.max_elapsed.map(|max| {
            let elapsed = inner.started_at.elapsed();
            max.saturating_sub(elapsed)
        });

        BudgetRemaining {
            iterations: remaining_of(inner.limits.max_iterations as u64, inner.usage.iterations as u64),
            input_tokens: remaining_of(inner.limits.max_input_tokens, inner.usage.input_tokens),
            output_tokens: remaining_of(inner.limits.max_output_tokens, inner.usage.output_tokens),
            cost: remaining_cost,
            elapsed: remaining_elapsed,
        }
    }

    /// Returns true with a human reason when any enabled dimension is reached.
    /// Evaluated on an up-to-date snapshot, but not atomically with `add` — a
    /// narrow overshoot by one iteration's credits is possible and tolerated.
    pub fn should_stop(&self) -> (bool, Option<String>) {
        let inner = self.inner.lock().unwrap();

        if inner.limits.max_iterations > 0 && inner.usage.iterations >= inner.limits.max_iterations {
            return (
                true,
                Some(format!(
                    "iteration limit reached ({}/{})",
                    inner.usage.iterations, inner.limits.max_iterations
                )),
            );
        }
        if inner.limits.max_input_tokens > 0 && inner.usage.input_tokens >= inner.limits.max_input_tokens {
            return (true, Some("input token limit reached".to_string()));
        }
        if inner.limits.max_output_tokens > 0 && inner.usage.output_tokens >= inner.limits.max_output_tokens {
            return (true, Some("output token limit reached".to_string()));
        }
        if inner.limits.max_cost > 0.0 && inner.usage.cost >= inner.limits.max_cost {
            return (
                true,
                Some(format!(
                    "cost limit reached (${:.2}/${:.2})",
                    inner.usage.cost, inner.limits.max_cost
                )),
            );
        }
        if let Some(max_elapsed) = inner.limits.max_elapsed {
            if inner.started_at.elapsed() >= max_elapsed {
                return (true, Some("elapsed time limit reached".to_string()));
            }
        }

        (false, None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetRemaining {
    pub iterations: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub elapsed: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_disable_that_dimension() {
        let tracker = BudgetTracker::new(BudgetLimits::default());
        let (stop, _) = tracker.should_stop();
        assert!(!stop);
        assert_eq!(tracker.remaining().iterations, -1);
    }

    #[test]
    fn should_stop_when_iteration_cap_hit() {
        let tracker = BudgetTracker::new(BudgetLimits {
            max_iterations: 2,
            ..Default::default()
        });
        tracker.add_iteration();
        assert!(!tracker.should_stop().0);
        tracker.add_iteration();
        let (stop, reason) = tracker.should_stop();
        assert!(stop);
        assert!(reason.unwrap().contains("iteration limit"));
    }

    #[test]
    fn remaining_never_goes_negative_when_exhausted() {
        let tracker = BudgetTracker::new(BudgetLimits {
            max_iterations: 1,
            ..Default::default()
        });
        tracker.add_iteration();
        tracker.add_iteration();
        assert_eq!(tracker.remaining().iterations, 0);
    }

    #[test]
    fn concurrent_adds_sum_exactly() {
        use std::thread;

        let tracker = BudgetTracker::new(BudgetLimits::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        t.add(1, 2, 0.01);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let usage = tracker.usage();
        assert_eq!(usage.iterations, 800);
        assert_eq!(usage.input_tokens, 800);
        assert_eq!(usage.output_tokens, 1600);
        assert!((usage.cost - 8.0).abs() < 1e-6);
    }

    #[test]
    fn cost_limit_trips_should_stop() {
        let tracker = BudgetTracker::new(BudgetLimits {
            max_cost: 1.0,
            ..Default::default()
        });
        tracker.add(0, 0, 1.5);
        assert!(tracker.should_stop().0);
    }
}
