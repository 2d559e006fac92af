//! Run budget accounting and stall timing.
//!
//! Costs come from per-1k-token input/output rates; token counts are
//! taken from runtime usage reports. Exceeding the cap never interrupts
//! a tool mid-flight: the supervisor checks at the next safe point.

use std::time::{Duration, Instant};

use crate::config::BudgetConfig;
use crate::runtime::TokenUsage;

#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    total: TokenUsage,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            total: TokenUsage::default(),
        }
    }

    pub fn record(&mut self, usage: TokenUsage) {
        self.total.add(usage);
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.total
    }

    /// Cumulative cost in USD.
    pub fn cost_usd(&self) -> f64 {
        let input = (self.total.input_tokens as f64 / 1000.0) * self.config.input_cost_per_1k;
        let output = (self.total.output_tokens as f64 / 1000.0) * self.config.output_cost_per_1k;
        input + output
    }

    pub fn cap_usd(&self) -> f64 {
        self.config.max_budget_usd
    }

    pub fn over_budget(&self) -> bool {
        self.cost_usd() >= self.config.max_budget_usd
    }

    /// Fraction of the cap consumed, for status output.
    pub fn percent_used(&self) -> f64 {
        if self.config.max_budget_usd <= 0.0 {
            return 0.0;
        }
        self.cost_usd() / self.config.max_budget_usd
    }
}

/// Tracks time since the last TOOL_CALL for stall detection.
#[derive(Debug, Clone)]
pub struct StallClock {
    last_activity: Instant,
    timeout: Duration,
}

impl StallClock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_activity: Instant::now(),
            timeout,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_stalled(&self) -> bool {
        self.last_activity.elapsed() >= self.timeout
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(cap: f64) -> BudgetConfig {
        BudgetConfig {
            max_budget_usd: cap,
            input_cost_per_1k: 0.003,
            output_cost_per_1k: 0.015,
        }
    }

    #[test]
    fn cost_uses_both_rate_tables() {
        let mut tracker = BudgetTracker::new(rates(1.0));
        tracker.record(TokenUsage {
            input_tokens: 100_000,
            output_tokens: 10_000,
        });
        // 100 * 0.003 + 10 * 0.015 = 0.45
        assert!((tracker.cost_usd() - 0.45).abs() < 1e-9);
        assert!(!tracker.over_budget());
    }

    #[test]
    fn cap_is_inclusive() {
        let mut tracker = BudgetTracker::new(rates(1.0));
        tracker.record(TokenUsage {
            input_tokens: 200_000,
            output_tokens: 20_000,
        });
        // 0.60 + 0.30 = 0.90 — still under.
        assert!(!tracker.over_budget());
        tracker.record(TokenUsage {
            input_tokens: 0,
            output_tokens: 7_000,
        });
        // 0.90 + 0.105 = 1.005 — over the 1.00 cap.
        assert!(tracker.over_budget());
        assert!(tracker.percent_used() > 1.0);
    }

    #[test]
    fn stall_clock_resets_on_touch() {
        let mut clock = StallClock::new(Duration::from_millis(30));
        assert!(!clock.is_stalled());
        std::thread::sleep(Duration::from_millis(40));
        assert!(clock.is_stalled());
        clock.touch();
        assert!(!clock.is_stalled());
    }
}
