//! Progress tracking for block synchronization.
//!
//! `SyncProgressTracker` counts what the loop did (persisted batches, discarded duplicates,
//! reported reorgs, recovered gaps, reconnects) and logs progress every 1000 heights. A snapshot of
//! the counters is published as `SyncStats` for the embedding application.

use tracing::info;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	/// Height of the cursor when the tracker was created
	start_height: u64,
	/// Highest persisted height seen so far
	highest_persisted_height: u64,
	blocks_persisted: u64,
	batches_persisted: u64,
	duplicates_discarded: u64,
	reorgs_detected: u64,
	gaps_recovered: u64,
	/// Successful live subscriptions, the first one included
	connections: u64,
	/// Height at which progress was last logged
	last_logged_height: u64,
}

impl SyncProgressTracker {
	pub fn new(start_height: u64) -> Self {
		Self {
			start_height,
			highest_persisted_height: start_height,
			blocks_persisted: 0,
			batches_persisted: 0,
			duplicates_discarded: 0,
			reorgs_detected: 0,
			gaps_recovered: 0,
			connections: 0,
			last_logged_height: start_height,
		}
	}

	/// Record a persisted batch ending at `last_height`
	pub fn record_batch(&mut self, written: usize, last_height: u64) {
		self.blocks_persisted += written as u64;
		self.batches_persisted += 1;
		self.highest_persisted_height = self.highest_persisted_height.max(last_height);
	}

	pub fn record_duplicate(&mut self) {
		self.duplicates_discarded += 1;
	}

	pub fn record_reorg(&mut self) {
		self.reorgs_detected += 1;
	}

	pub fn record_gap(&mut self) {
		self.gaps_recovered += 1;
	}

	pub fn record_connection(&mut self) {
		self.connections += 1;
	}

	/// Log progress every 1000 heights or when forced
	pub fn log_progress(&mut self, force: bool) {
		let since_last_log = self
			.highest_persisted_height
			.saturating_sub(self.last_logged_height);

		if force || since_last_log >= 1000 {
			info!(
				"Sync progress: {} blocks in {} batches persisted up to height {}",
				self.blocks_persisted, self.batches_persisted, self.highest_persisted_height
			);
			self.last_logged_height = self.highest_persisted_height;
		}
	}

	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			start_height: self.start_height,
			highest_persisted_height: self.highest_persisted_height,
			blocks_persisted: self.blocks_persisted,
			batches_persisted: self.batches_persisted,
			duplicates_discarded: self.duplicates_discarded,
			reorgs_detected: self.reorgs_detected,
			gaps_recovered: self.gaps_recovered,
			reconnects: self.connections.saturating_sub(1),
		}
	}
}

/// Statistics about the sync progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
	pub start_height: u64,
	pub highest_persisted_height: u64,
	pub blocks_persisted: u64,
	pub batches_persisted: u64,
	pub duplicates_discarded: u64,
	pub reorgs_detected: u64,
	pub gaps_recovered: u64,
	pub reconnects: u64,
}

impl SyncStats {
	/// Get a human-readable summary of the sync statistics
	pub fn summary(&self) -> String {
		format!(
			"Sync from {} to {}: {} blocks in {} batches, {} duplicates discarded, {} gaps recovered, {} reconnects{}",
			self.start_height,
			self.highest_persisted_height,
			self.blocks_persisted,
			self.batches_persisted,
			self.duplicates_discarded,
			self.gaps_recovered,
			self.reconnects,
			if self.reorgs_detected == 0 {
				String::new()
			} else {
				format!(" ({} reorgs reported)", self.reorgs_detected)
			}
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stats_reflect_recorded_activity() {
		let mut tracker = SyncProgressTracker::new(5);
		tracker.record_connection();
		tracker.record_batch(3, 8);
		tracker.record_batch(1, 9);
		tracker.record_duplicate();
		tracker.record_connection();
		tracker.record_gap();

		let stats = tracker.get_stats();
		assert_eq!(stats.start_height, 5);
		assert_eq!(stats.highest_persisted_height, 9);
		assert_eq!(stats.blocks_persisted, 4);
		assert_eq!(stats.batches_persisted, 2);
		assert_eq!(stats.duplicates_discarded, 1);
		assert_eq!(stats.gaps_recovered, 1);
		assert_eq!(stats.reconnects, 1);
		assert_eq!(
			stats.summary(),
			"Sync from 5 to 9: 4 blocks in 2 batches, 1 duplicates discarded, 1 gaps recovered, 1 reconnects"
		);
	}

	#[test]
	fn reorgs_are_called_out_in_the_summary() {
		let mut tracker = SyncProgressTracker::new(0);
		tracker.record_reorg();
		assert!(tracker.get_stats().summary().ends_with("(1 reorgs reported)"));
	}
}
