use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use super::repositories::StoreError;

const LOCK_FILE_NAME: &str = "collection.lock";

/// Exclusive advisory lock on a collection directory, held for the lifetime of the guard.
pub(crate) struct CollectionLockGuard {
	file: File,
}

impl CollectionLockGuard {
	pub(crate) fn acquire(collection_dir: &Path) -> Result<Self, StoreError> {
		fs::create_dir_all(collection_dir)?;

		let lock_path = collection_dir.join(LOCK_FILE_NAME);
		let file = OpenOptions::new()
			.create(true)
			.truncate(false)
			.read(true)
			.write(true)
			.open(&lock_path)?;

		if FileExt::try_lock_exclusive(&file).is_err() {
			return Err(StoreError::Locked(collection_dir.to_path_buf()));
		}

		Ok(Self { file })
	}
}

impl Drop for CollectionLockGuard {
	fn drop(&mut self) {
		// The OS releases the lock with the descriptor anyway.
		let _ = FileExt::unlock(&self.file);
	}
}
