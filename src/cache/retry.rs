use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

use crate::config::SyncOptions;

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
	/// Consecutive failures including this one.
	pub attempt: u32,
	/// How long to wait before the next attempt.
	pub delay: Duration,
	/// Whether this failure should be surfaced as an `error` event.
	pub report: bool,
}

/// Capped exponential backoff with jitter that never gives up.
pub struct RetryPolicy {
	backoff: ExponentialBackoff,
	max_delay: Duration,
	report_every: u32,
	attempts: u32,
}

impl RetryPolicy {
	pub fn new(options: &SyncOptions) -> Self {
		let backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(options.backoff_initial)
			.with_max_interval(options.backoff_max)
			.with_multiplier(options.backoff_multiplier)
			.with_randomization_factor(options.backoff_jitter)
			.with_max_elapsed_time(None)
			.build();

		Self {
			backoff,
			max_delay: options.backoff_max,
			report_every: options.error_report_threshold.max(1),
			attempts: 0,
		}
	}

	pub fn record_failure(&mut self) -> RetryStep {
		self.attempts = self.attempts.saturating_add(1);
		// Jitter may push a delay above the ceiling.
		let delay = self
			.backoff
			.next_backoff()
			.unwrap_or(self.max_delay)
			.min(self.max_delay);

		RetryStep {
			attempt: self.attempts,
			delay,
			report: self.attempts % self.report_every == 0,
		}
	}

	/// Forget previous failures after forward progress.
	pub fn reset(&mut self) {
		self.attempts = 0;
		self.backoff.reset();
	}

	pub fn attempts(&self) -> u32 {
		self.attempts
	}
}
